// src/core/etcd/client.rs

//! Client for the database's JSON gateway.
//!
//! The supervisor only needs a handful of administrative calls: membership
//! changes, health, and a key mirror for the cluster-spec cross-check.
//! Callers pass the client URLs per call; quarantined-URL substitution and
//! unix-socket rewriting happen where the URLs are selected.

use crate::core::errors::KeeperError;
use crate::core::protocol::ClusterMember;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait EtcdApi: Send + Sync {
    async fn member_list(&self, client_urls: &[String]) -> Result<Vec<ClusterMember>, KeeperError>;
    /// Registers a new member and returns its assigned member id.
    async fn member_add(
        &self,
        client_urls: &[String],
        peer_urls: &[String],
    ) -> Result<u64, KeeperError>;
    async fn member_remove(&self, client_urls: &[String], member_id: u64)
    -> Result<(), KeeperError>;
    async fn health(&self, client_urls: &[String]) -> Result<bool, KeeperError>;
    async fn get(&self, client_urls: &[String], key: &str) -> Result<Option<Vec<u8>>, KeeperError>;
    async fn put(&self, client_urls: &[String], key: &str, value: &[u8])
    -> Result<(), KeeperError>;
}

#[derive(Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<MemberJson>,
}

#[derive(Deserialize)]
struct MemberJson {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

#[derive(Deserialize)]
struct MemberAddResponse {
    member: MemberJson,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValueJson>,
}

#[derive(Deserialize)]
struct KeyValueJson {
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    health: String,
}

/// `EtcdApi` over the grpc-gateway JSON endpoints.
pub struct EtcdGatewayClient {
    http: reqwest::Client,
}

impl EtcdGatewayClient {
    pub fn new(request_timeout: Duration) -> Result<Self, KeeperError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| KeeperError::Transport(format!("building http client: {e}")))?;
        Ok(Self { http })
    }

    /// The gateway only speaks http(s); unix-socket URLs are skipped.
    fn bases(client_urls: &[String]) -> Result<Vec<&String>, KeeperError> {
        let bases: Vec<&String> = client_urls
            .iter()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .collect();
        if bases.is_empty() {
            return Err(KeeperError::Transport(format!(
                "no http(s) client urls among {client_urls:?}"
            )));
        }
        Ok(bases)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        client_urls: &[String],
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, KeeperError> {
        let mut last_err = None;
        for base in Self::bases(client_urls)? {
            let url = format!("{}{path}", base.trim_end_matches('/'));
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(|e| {
                        KeeperError::Transport(format!("decoding response from {url}: {e}"))
                    });
                }
                Ok(response) => {
                    last_err = Some(KeeperError::Transport(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    debug!("etcd gateway call {} failed: {}", url, e);
                    last_err = Some(KeeperError::Transport(format!("{url}: {e}")));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| KeeperError::Transport("no reachable client url".to_string())))
    }
}

fn parse_member_id(raw: &str) -> Result<u64, KeeperError> {
    raw.parse::<u64>()
        .map_err(|e| KeeperError::Transport(format!("member id {raw:?} not a u64: {e}")))
}

#[async_trait]
impl EtcdApi for EtcdGatewayClient {
    async fn member_list(&self, client_urls: &[String]) -> Result<Vec<ClusterMember>, KeeperError> {
        let response: MemberListResponse = self
            .post_json(client_urls, "/v3/cluster/member/list", json!({}))
            .await?;
        response
            .members
            .into_iter()
            .map(|m| {
                Ok(ClusterMember {
                    member_id: parse_member_id(&m.id)?,
                    name: m.name,
                    peer_urls: m.peer_urls,
                    client_urls: m.client_urls,
                })
            })
            .collect()
    }

    async fn member_add(
        &self,
        client_urls: &[String],
        peer_urls: &[String],
    ) -> Result<u64, KeeperError> {
        let response: MemberAddResponse = self
            .post_json(
                client_urls,
                "/v3/cluster/member/add",
                json!({ "peerURLs": peer_urls }),
            )
            .await?;
        parse_member_id(&response.member.id)
    }

    async fn member_remove(
        &self,
        client_urls: &[String],
        member_id: u64,
    ) -> Result<(), KeeperError> {
        let _: serde_json::Value = self
            .post_json(
                client_urls,
                "/v3/cluster/member/remove",
                json!({ "ID": member_id.to_string() }),
            )
            .await?;
        Ok(())
    }

    async fn health(&self, client_urls: &[String]) -> Result<bool, KeeperError> {
        for base in Self::bases(client_urls)? {
            let url = format!("{}/health", base.trim_end_matches('/'));
            if let Ok(response) = self.http.get(&url).send().await
                && response.status().is_success()
                && let Ok(health) = response.json::<HealthResponse>().await
            {
                return Ok(health.health == "true");
            }
        }
        Ok(false)
    }

    async fn get(&self, client_urls: &[String], key: &str) -> Result<Option<Vec<u8>>, KeeperError> {
        let response: RangeResponse = self
            .post_json(
                client_urls,
                "/v3/kv/range",
                json!({ "key": BASE64.encode(key) }),
            )
            .await?;
        let Some(kv) = response.kvs.into_iter().next() else {
            return Ok(None);
        };
        BASE64
            .decode(&kv.value)
            .map(Some)
            .map_err(|e| KeeperError::Transport(format!("decoding value for {key:?}: {e}")))
    }

    async fn put(
        &self,
        client_urls: &[String],
        key: &str,
        value: &[u8],
    ) -> Result<(), KeeperError> {
        let _: serde_json::Value = self
            .post_json(
                client_urls,
                "/v3/kv/put",
                json!({ "key": BASE64.encode(key), "value": BASE64.encode(value) }),
            )
            .await?;
        Ok(())
    }
}
