//! Container introspection models

use serde::{Deserialize, Serialize};

/// A container as reported by the remote engine. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: String,
}
