//! Target registry

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::PortalError;
use crate::filesys::file::File;
use crate::models::target::{EnvVars, NewTarget, Target, TargetId};

/// On-disk form of the registry
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: TargetId,
    targets: Vec<Target>,
}

#[derive(Debug)]
struct Entries {
    next_id: TargetId,
    targets: BTreeMap<TargetId, Target>,
}

impl Default for Entries {
    fn default() -> Self {
        Self {
            next_id: 1,
            targets: BTreeMap::new(),
        }
    }
}

/// Registry of known targets, optionally mirrored to a JSON file
pub struct TargetRegistry {
    entries: RwLock<Entries>,
    snapshot_file: Option<File>,
    // Serializes snapshot writes so the newest state always lands last
    persist_lock: tokio::sync::Mutex<()>,
}

impl TargetRegistry {
    /// Create an empty, memory-only registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            snapshot_file: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a registry mirrored to `file`, loading it if it exists
    pub async fn load(file: File) -> Result<Self, PortalError> {
        let mut entries = Entries::default();

        if file.exists().await {
            let snapshot: Snapshot = file.read_json().await?;
            for target in snapshot.targets {
                entries.next_id = entries.next_id.max(target.id + 1);
                entries.targets.insert(target.id, target);
            }
            entries.next_id = entries.next_id.max(snapshot.next_id);
            info!(
                "Loaded {} targets from {}",
                entries.targets.len(),
                file.path().display()
            );
        }

        Ok(Self {
            entries: RwLock::new(entries),
            snapshot_file: Some(file),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Register a new target. Reachability is not checked here.
    pub async fn create(&self, new: NewTarget) -> Result<Target, PortalError> {
        for (field, value) in [
            ("name", &new.name),
            ("address", &new.address),
            ("ssh_key_path", &new.ssh_key_path),
            ("ssh_user", &new.ssh_user),
        ] {
            if value.trim().is_empty() {
                return Err(PortalError::ValidationError(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        let target = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let target = Target {
                id: entries.next_id,
                name: new.name.trim().to_string(),
                address: new.address.trim().to_string(),
                ssh_user: new.ssh_user.trim().to_string(),
                ssh_key_path: new.ssh_key_path.trim().to_string(),
                created_at: Utc::now(),
                env: EnvVars::new(),
            };
            entries.next_id += 1;
            entries.targets.insert(target.id, target.clone());
            target
        };

        info!("Registered target {} ({}) at {}", target.id, target.name, target.address);
        self.persist().await?;
        Ok(target)
    }

    /// Look up a target
    pub fn get(&self, id: TargetId) -> Option<Target> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.targets.get(&id).cloned()
    }

    /// Look up a target, failing with `NotFound`
    pub fn require(&self, id: TargetId) -> Result<Target, PortalError> {
        self.get(id)
            .ok_or_else(|| PortalError::NotFound(format!("Target {} not found", id)))
    }

    /// All targets in id order
    pub fn list(&self) -> Vec<Target> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.targets.values().cloned().collect()
    }

    /// VM-level environment of a target
    pub fn get_env(&self, id: TargetId) -> Result<EnvVars, PortalError> {
        self.require(id).map(|t| t.env)
    }

    /// Replace the VM-level environment of a target
    pub async fn update_env(&self, id: TargetId, env: EnvVars) -> Result<EnvVars, PortalError> {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let target = entries
                .targets
                .get_mut(&id)
                .ok_or_else(|| PortalError::NotFound(format!("Target {} not found", id)))?;
            target.env = env.clone();
        }

        debug!("Updated env of target {} ({} variables)", id, env.len());
        self.persist().await?;
        Ok(env)
    }

    async fn persist(&self) -> Result<(), PortalError> {
        let Some(file) = &self.snapshot_file else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            Snapshot {
                next_id: entries.next_id,
                targets: entries.targets.values().cloned().collect(),
            }
        };
        file.write_json_atomic(&snapshot).await
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
