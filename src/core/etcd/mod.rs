// src/core/etcd/mod.rs

//! Ownership of the local etcd replica: process lifecycle and the client
//! used to talk to running replicas.

pub mod client;
pub mod process;

pub use client::{EtcdApi, EtcdGatewayClient};
pub use process::{EtcdProcess, ProcessPlan};
