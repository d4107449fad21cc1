//! Deployment store and log sink
//!
//! Records are never deleted. Each record sits behind its own lock so that
//! appending to one deployment's log never blocks readers of another, and a
//! reader always observes a whole number of log events.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use crate::errors::PortalError;
use crate::models::deployment::{
    Deployment, DeploymentId, EventLevel, LogEvent, Workload,
};
use crate::models::target::TargetId;

#[derive(Debug)]
struct DeploymentRecord {
    deployment: Deployment,
    fsm: DeploymentFsm,
    logs: Vec<LogEvent>,
}

#[derive(Debug)]
struct Records {
    next_id: DeploymentId,
    by_id: BTreeMap<DeploymentId, Arc<RwLock<DeploymentRecord>>>,
}

/// Deployment records and their append-only logs
pub struct DeploymentStore {
    records: RwLock<Records>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records {
                next_id: 1,
                by_id: BTreeMap::new(),
            }),
        }
    }

    /// Create a queued deployment
    pub fn create(&self, target_id: TargetId, workload: Workload, message: String) -> Deployment {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let deployment = Deployment {
            id: records.next_id,
            target_id,
            workload,
            status: DeploymentStatus::Queued,
            message,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        records.next_id += 1;
        records.by_id.insert(
            deployment.id,
            Arc::new(RwLock::new(DeploymentRecord {
                deployment: deployment.clone(),
                fsm: DeploymentFsm::new(),
                logs: Vec::new(),
            })),
        );
        deployment
    }

    fn record(&self, id: DeploymentId) -> Result<Arc<RwLock<DeploymentRecord>>, PortalError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| PortalError::NotFound(format!("Deployment {} not found", id)))
    }

    pub fn get(&self, id: DeploymentId) -> Option<Deployment> {
        let record = self.record(id).ok()?;
        let record = record.read().unwrap_or_else(|e| e.into_inner());
        Some(record.deployment.clone())
    }

    /// All deployments in creation order
    pub fn list(&self) -> Vec<Deployment> {
        let records: Vec<_> = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            records.by_id.values().cloned().collect()
        };
        records
            .iter()
            .map(|r| r.read().unwrap_or_else(|e| e.into_inner()).deployment.clone())
            .collect()
    }

    /// Log events with `seq >= since`, in emission order
    pub fn logs(&self, id: DeploymentId, since: u64) -> Result<Vec<LogEvent>, PortalError> {
        let record = self.record(id)?;
        let record = record.read().unwrap_or_else(|e| e.into_inner());
        let start = usize::try_from(since).unwrap_or(usize::MAX).min(record.logs.len());
        Ok(record.logs[start..].to_vec())
    }

    /// Append a log event; its `seq` is its position in the log
    pub fn append(
        &self,
        id: DeploymentId,
        level: EventLevel,
        message: impl Into<String>,
    ) -> Result<LogEvent, PortalError> {
        let record = self.record(id)?;
        let mut record = record.write().unwrap_or_else(|e| e.into_inner());
        let event = LogEvent {
            seq: record.logs.len() as u64,
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        record.logs.push(event.clone());
        Ok(event)
    }

    /// `queued -> running`
    pub fn mark_running(&self, id: DeploymentId, message: String) -> Result<Deployment, PortalError> {
        self.apply(id, DeploymentEvent::Start, message)
    }

    /// `running -> success`
    pub fn mark_succeeded(&self, id: DeploymentId, message: String) -> Result<Deployment, PortalError> {
        self.apply(id, DeploymentEvent::Succeed(message.clone()), message)
    }

    /// `queued | running -> failed`
    pub fn mark_failed(&self, id: DeploymentId, message: String) -> Result<Deployment, PortalError> {
        self.apply(id, DeploymentEvent::Fail(message.clone()), message)
    }

    fn apply(
        &self,
        id: DeploymentId,
        event: DeploymentEvent,
        message: String,
    ) -> Result<Deployment, PortalError> {
        let record = self.record(id)?;
        let mut record = record.write().unwrap_or_else(|e| e.into_inner());

        let status = record.fsm.process(event).map_err(PortalError::Internal)?;
        let now = Utc::now();
        let deployment = &mut record.deployment;
        deployment.status = status;
        deployment.message = message;
        match status {
            DeploymentStatus::Running => deployment.started_at = Some(now),
            DeploymentStatus::Success | DeploymentStatus::Failed => deployment.finished_at = Some(now),
            DeploymentStatus::Queued => {}
        }
        Ok(deployment.clone())
    }

    /// Deployments currently in `status` for `target_id`
    pub fn count_with_status(&self, target_id: TargetId, status: DeploymentStatus) -> usize {
        self.list()
            .iter()
            .filter(|d| d.target_id == target_id && d.status == status)
            .count()
    }
}

impl Default for DeploymentStore {
    fn default() -> Self {
        Self::new()
    }
}
