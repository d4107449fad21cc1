//! Deployment executor
//!
//! Accepted deployments are queued on a per-target lane: an unbounded FIFO
//! channel drained by one worker task, created the first time the target is
//! deployed to. The worker takes the target's lock (bounded by the lock
//! timeout, counted from submission), marks the deployment running, streams
//! every plan step into the deployment log and records the terminal status
//! before releasing the lock.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::locks::TargetLocks;
use crate::deploy::translator::{self, CommandPlan, Preview};
use crate::errors::PortalError;
use crate::models::deployment::{Deployment, DeploymentId, DeploymentRequest, EventLevel, Workload};
use crate::models::target::{Target, TargetId};
use crate::remote::{self, failure_detail, OutputLine, OutputStream, Session, SessionProvider};
use crate::store::deployments::DeploymentStore;
use crate::store::targets::TargetRegistry;

const STREAM_BUFFER: usize = 64;

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// How long a deployment may wait, queued, for its target
    pub lock_timeout: Duration,

    /// Bound on opening a session
    pub connect_timeout: Duration,

    /// Bound on running the whole plan
    pub command_timeout: Duration,

    /// Output lines kept for failure messages
    pub stderr_tail_lines: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(900),
            stderr_tail_lines: 20,
        }
    }
}

struct Job {
    id: DeploymentId,
    target: Target,
    workload: Workload,
    plan: CommandPlan,
    enqueued_at: Instant,
    cancel: watch::Receiver<bool>,
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

struct ExecutorInner {
    provider: Arc<dyn SessionProvider>,
    targets: Arc<TargetRegistry>,
    deployments: Arc<DeploymentStore>,
    locks: Arc<TargetLocks>,
    options: ExecutorOptions,
    cancels: Mutex<HashMap<DeploymentId, watch::Sender<bool>>>,
}

/// Runs deployments against targets, one at a time per target
pub struct DeploymentExecutor {
    inner: Arc<ExecutorInner>,
    lanes: Mutex<HashMap<TargetId, Lane>>,
    closed: AtomicBool,
}

impl DeploymentExecutor {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        targets: Arc<TargetRegistry>,
        deployments: Arc<DeploymentStore>,
        locks: Arc<TargetLocks>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                provider,
                targets,
                deployments,
                locks,
                options,
                cancels: Mutex::new(HashMap::new()),
            }),
            lanes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.inner.options
    }

    /// Dry run: what `request` would do, without touching the target
    pub fn preview(&self, request: &DeploymentRequest) -> Result<Preview, PortalError> {
        let target = self.inner.targets.require(request.target_id)?;
        Ok(translator::preview(request, &target))
    }

    /// Accept a deployment and queue it on its target's lane.
    ///
    /// Returns the `queued` record immediately; nothing remote happens before
    /// this returns.
    pub fn submit(&self, request: DeploymentRequest) -> Result<Deployment, PortalError> {
        // Held until the job is on its lane, so shutdown drains every lane
        // created by a submit it did not reject
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(PortalError::ServerError(
                "deployment executor is shutting down".to_string(),
            ));
        }

        let target = self.inner.targets.require(request.target_id)?;
        let plan = translator::plan(&request.workload);
        let message = translator::queued_message(&request.workload, &target);

        let deployment = self
            .inner
            .deployments
            .create(target.id, request.workload.clone(), message.clone());
        self.inner.log(deployment.id, EventLevel::Info, message);
        info!(
            "Deployment {} queued for target {} ({})",
            deployment.id, target.id, target.address
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deployment.id, cancel_tx);

        let job = Job {
            id: deployment.id,
            target,
            workload: request.workload,
            plan,
            enqueued_at: Instant::now(),
            cancel: cancel_rx,
        };

        let target_id = job.target.id;
        let sent = lanes
            .entry(target_id)
            .or_insert_with(|| spawn_lane(self.inner.clone(), target_id))
            .tx
            .send(job);
        drop(lanes);
        if let Err(mpsc::error::SendError(job)) = sent {
            error!("Lane for target {} is gone", job.target.id);
            self.inner.finish(
                job.id,
                Err(PortalError::Internal("deployment lane closed".to_string())),
            );
        }

        Ok(deployment)
    }

    /// Ask a queued or running deployment to stop.
    ///
    /// Returns `false` when the deployment already finished.
    pub fn cancel(&self, id: DeploymentId) -> Result<bool, PortalError> {
        if self.inner.deployments.get(id).is_none() {
            return Err(PortalError::NotFound(format!("Deployment {} not found", id)));
        }
        let cancels = self.inner.cancels.lock().unwrap_or_else(|e| e.into_inner());
        match cancels.get(&id) {
            Some(tx) => {
                info!("Cancelling deployment {}", id);
                tx.send_replace(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel everything pending, close the lanes and wait for their workers
    pub async fn shutdown(&self, grace: Duration) {
        let lanes: Vec<(TargetId, Lane)> = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            self.closed.store(true, Ordering::SeqCst);
            lanes.drain().collect()
        };

        // Every accepted job is on a drained lane by now
        {
            let cancels = self.inner.cancels.lock().unwrap_or_else(|e| e.into_inner());
            for tx in cancels.values() {
                tx.send_replace(true);
            }
        }

        info!("Stopping {} deployment lanes...", lanes.len());

        for (target_id, lane) in lanes {
            drop(lane.tx);
            let mut handle = lane.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Lane for target {} did not stop in time, aborting", target_id);
                handle.abort();
            }
        }
    }
}

fn spawn_lane(inner: Arc<ExecutorInner>, target_id: TargetId) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    debug!("Opening deployment lane for target {}", target_id);
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            inner.process(job).await;
        }
        debug!("Deployment lane for target {} closed", target_id);
    });
    Lane { tx, handle }
}

/// Resolves once `cancel` is set; never resolves if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let set = cancel.wait_for(|c| *c).await.is_ok();
    if !set {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic".to_string()
}

/// Bounded tail of one output stream
struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

impl ExecutorInner {
    fn log(&self, id: DeploymentId, level: EventLevel, message: impl Into<String>) {
        if let Err(e) = self.deployments.append(id, level, message) {
            error!("Failed to append to log of deployment {}: {}", id, e);
        }
    }

    /// Record the terminal status of a deployment
    fn finish(&self, id: DeploymentId, outcome: Result<String, PortalError>) {
        let result = match outcome {
            Ok(message) => {
                info!("Deployment {} succeeded: {}", id, message);
                self.log(id, EventLevel::Info, message.clone());
                self.deployments.mark_succeeded(id, message)
            }
            Err(e) => {
                let message = e.detail();
                warn!("Deployment {} failed: {}", id, message);
                self.log(id, EventLevel::Error, message.clone());
                self.deployments.mark_failed(id, message)
            }
        };
        if let Err(e) = result {
            error!("Failed to record outcome of deployment {}: {}", id, e);
        }

        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    async fn process(&self, mut job: Job) {
        let id = job.id;
        let target_id = job.target.id;

        let acquired = tokio::select! {
            biased;
            _ = cancelled(&mut job.cancel) => Err(PortalError::Cancelled),
            guard = self.locks.acquire_within(target_id, self.options.lock_timeout, job.enqueued_at) => guard,
        };
        let guard = match acquired {
            Ok(guard) => guard,
            Err(e) => {
                self.finish(id, Err(e));
                return;
            }
        };

        if *job.cancel.borrow() {
            self.finish(id, Err(PortalError::Cancelled));
            return;
        }

        let running = format!(
            "Deploying to {} ({})",
            job.target.name,
            job.target.ssh_destination()
        );
        if let Err(e) = self.deployments.mark_running(id, running.clone()) {
            error!("Deployment {} could not start: {}", id, e);
            self.finish(id, Err(e));
            return;
        }
        self.log(id, EventLevel::Info, running);
        info!("Deployment {} running on target {}", id, target_id);

        let outcome = AssertUnwindSafe(self.execute(&mut job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!("Deployment {} panicked", id);
                Err(PortalError::Internal(format!(
                    "deployment panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        // Status first, then the lock
        self.finish(id, outcome);
        drop(guard);
    }

    async fn execute(&self, job: &mut Job) -> Result<String, PortalError> {
        let Job {
            id,
            target,
            workload,
            plan,
            cancel,
            ..
        } = job;
        let id = *id;

        let mut session = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(PortalError::Cancelled),
            session = remote::connect_with_timeout(
                self.provider.as_ref(),
                target,
                self.options.connect_timeout,
            ) => session?,
        };
        self.log(
            id,
            EventLevel::Info,
            format!("Connected to {} via {}", target.ssh_destination(), self.provider.name()),
        );

        let timeout = self.options.command_timeout;
        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(PortalError::Cancelled),
            run = tokio::time::timeout(timeout, self.run_plan(id, &mut session, plan, workload)) => {
                match run {
                    Ok(result) => result,
                    Err(_) => Err(PortalError::Timeout(format!(
                        "deployment did not finish within {:?}",
                        timeout
                    ))),
                }
            }
        };

        if let Err(e) = session.close().await {
            warn!("Failed to close session to {}: {}", target.ssh_destination(), e);
        }
        result
    }

    async fn run_plan(
        &self,
        id: DeploymentId,
        session: &mut Box<dyn Session>,
        plan: &CommandPlan,
        workload: &Workload,
    ) -> Result<String, PortalError> {
        let total = plan.steps.len();
        let mut last_stdout = None;

        for (index, step) in plan.steps.iter().enumerate() {
            self.log(
                id,
                EventLevel::Info,
                format!("[{}/{}] {}: {}", index + 1, total, step.description, step.command),
            );
            debug!("Deployment {} step {}: {}", id, index + 1, step.command);

            let mut stdout = TailBuffer::new(self.options.stderr_tail_lines);
            let mut stderr = TailBuffer::new(self.options.stderr_tail_lines);
            last_stdout = None;

            let (tx, mut rx) = mpsc::channel::<OutputLine>(STREAM_BUFFER);
            let result = {
                let run = session.stream(&step.command, tx);
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        biased;
                        Some(line) = rx.recv() => {
                            self.record_line(id, &line, &mut stdout, &mut stderr);
                            if line.stream == OutputStream::Stdout {
                                last_stdout = Some(line.text);
                            }
                        }
                        result = &mut run => break result,
                    }
                }
            };
            while let Some(line) = rx.recv().await {
                self.record_line(id, &line, &mut stdout, &mut stderr);
                if line.stream == OutputStream::Stdout {
                    last_stdout = Some(line.text);
                }
            }

            let exit_code = result?;
            if exit_code == 0 {
                continue;
            }

            if step.ignore_failure {
                self.log(
                    id,
                    EventLevel::Warn,
                    format!("`{}` exited with status {}, continuing", step.command, exit_code),
                );
                continue;
            }

            return Err(PortalError::RemoteCommandError {
                command: step.command.clone(),
                exit_code,
                detail: failure_detail(
                    &stderr.joined(),
                    &stdout.joined(),
                    self.options.stderr_tail_lines,
                ),
            });
        }

        Ok(translator::success_message(workload, last_stdout.as_deref()))
    }

    fn record_line(
        &self,
        id: DeploymentId,
        line: &OutputLine,
        stdout: &mut TailBuffer,
        stderr: &mut TailBuffer,
    ) {
        match line.stream {
            OutputStream::Stdout => {
                stdout.push(&line.text);
                self.log(id, EventLevel::Info, line.text.clone());
            }
            OutputStream::Stderr => {
                stderr.push(&line.text);
                self.log(id, EventLevel::Warn, line.text.clone());
            }
        }
    }
}
