//! Deployment module

pub mod executor;
pub mod fsm;
pub mod locks;
pub mod translator;
