//! In-memory stores for targets and deployments
//!
//! Both stores are owned by the application state and handed to the executor,
//! the introspection component and the HTTP handlers as `Arc`s.

pub mod deployments;
pub mod targets;
