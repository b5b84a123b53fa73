// src/supervisor.rs

//! Wires all supervisor components together and runs them until shutdown.

use crate::config::Config;
use crate::core::agent::LocalAgent;
use crate::core::backup::{BackupController, BackupStore, FsBackupStore};
use crate::core::client::{TcpTransport, Transport};
use crate::core::commands::{CommandStore, FsCommandStore};
use crate::core::discovery::{Discovery, StaticDiscovery};
use crate::core::driver::ReconfigDriver;
use crate::core::election::{LeaderElector, LeaderLedger};
use crate::core::etcd::{EtcdApi, EtcdGatewayClient};
use crate::core::listener;
use crate::core::observer::Observer;
use crate::core::reconciler::Reconciler;
use crate::core::registry::PeerRegistry;
use crate::core::specstore::{FsSpecStore, SpecStore};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

/// The main entry point for running a supervisor instance.
pub async fn run(config: Config) -> Result<()> {
    info!(
        "etcdkeeper starting for cluster {:?} as peer {:?}",
        config.cluster_name, config.peer_id
    );

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config.timing.rpc_timeout));
    let discovery: Arc<dyn Discovery> =
        Arc::new(StaticDiscovery::new(&config.nodes, config.port));
    let registry = Arc::new(PeerRegistry::new(
        discovery,
        transport.clone(),
        config.cluster_name.clone(),
        config.timing.poll_interval,
        config.timing.eviction_polls,
    ));

    let ledger = Arc::new(LeaderLedger::default());
    let backup_store: Arc<dyn BackupStore> =
        Arc::new(FsBackupStore::new(&config.backup.store_path));
    let agent = Arc::new(LocalAgent::new(&config, ledger.clone(), backup_store.clone()));
    let elector = Arc::new(LeaderElector::new(
        config.peer_id(),
        config.cluster_name.clone(),
        registry.clone(),
        ledger,
        config.timing.leader_lease,
    ));

    let etcd_api: Arc<dyn EtcdApi> =
        Arc::new(EtcdGatewayClient::new(config.timing.rpc_timeout)?);
    let observer = Observer::new(registry.clone(), etcd_api.clone());
    let driver = ReconfigDriver::new(
        transport.clone(),
        elector.clone(),
        etcd_api,
        config.etcd.tls_enabled,
        config.dns_suffix.clone(),
        config.etcd.bin_roots.clone(),
        config.timing.rpc_timeout,
        config.timing.action_timeout,
    );

    let command_store: Arc<dyn CommandStore> = Arc::new(FsCommandStore::new(&config.data_dir));
    let spec_store: Arc<dyn SpecStore> = Arc::new(FsSpecStore::new(&config.data_dir));
    let bootstrap_spec = config.bootstrap_spec();

    let (reconciler, mut status_rx, state_rx) = Reconciler::new(
        observer,
        elector.clone(),
        driver,
        command_store,
        spec_store.clone(),
        bootstrap_spec.clone(),
        config.timing.tick_interval,
        config.timing.unhealthy_ticks,
    );
    let backup_controller = BackupController::new(
        transport,
        elector.clone(),
        backup_store,
        spec_store,
        bootstrap_spec,
        state_rx,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let bind_addr = format!("{}:{}", config.host, config.port);
    tasks.spawn(listener::run(bind_addr, agent.clone(), shutdown_tx.subscribe()));

    {
        let registry = registry.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            registry.run(shutdown_rx).await;
            Ok(())
        });
    }
    {
        let elector = elector.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            elector.run(shutdown_rx).await;
            Ok(())
        });
    }
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            reconciler.run(shutdown_rx).await;
            Ok(())
        });
    }
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            backup_controller.run(shutdown_rx).await;
            Ok(())
        });
    }
    tasks.spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            info!("controller status: {:?}", status);
        }
        Ok(())
    });

    // Run until the operator interrupts us or a task dies.
    let failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            None
        }
        joined = tasks.join_next() => match joined {
            Some(Ok(Ok(()))) => Some(anyhow!("a supervisor task exited unexpectedly")),
            Some(Ok(Err(e))) => Some(e),
            Some(Err(e)) => Some(anyhow!("a supervisor task panicked: {e}")),
            None => Some(anyhow!("all supervisor tasks terminated")),
        },
    };

    let _ = shutdown_tx.send(());
    // The local replica is owned by this supervisor; take it down cleanly.
    agent.shutdown().await;
    while tasks.join_next().await.is_some() {}

    match failure {
        Some(e) => {
            error!("supervisor failed: {e}");
            Err(e)
        }
        None => Ok(()),
    }
}
