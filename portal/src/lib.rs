//! Deploy Portal Library
//!
//! Control plane for deploying Docker workloads to remote VMs over SSH.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod introspection;
pub mod logs;
pub mod models;
pub mod remote;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
