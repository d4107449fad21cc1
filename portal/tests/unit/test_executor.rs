//! Deployment executor tests, run against the simulated provider

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use deploy_portal::deploy::executor::{DeploymentExecutor, ExecutorOptions};
use deploy_portal::deploy::fsm::DeploymentStatus;
use deploy_portal::deploy::locks::TargetLocks;
use deploy_portal::errors::PortalError;
use deploy_portal::models::deployment::{
    Deployment, DeploymentId, DeploymentRequest, EventLevel, PortMapping, Workload,
};
use deploy_portal::models::target::{NewTarget, Target};
use deploy_portal::remote::simulated::{ScriptedReply, SimulatedProvider};
use deploy_portal::remote::{Session, SessionProvider};
use deploy_portal::store::deployments::DeploymentStore;
use deploy_portal::store::targets::TargetRegistry;

struct Harness {
    provider: SimulatedProvider,
    targets: Arc<TargetRegistry>,
    deployments: Arc<DeploymentStore>,
    locks: Arc<TargetLocks>,
    executor: DeploymentExecutor,
}

fn options() -> ExecutorOptions {
    ExecutorOptions {
        lock_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        command_timeout: Duration::from_secs(5),
        stderr_tail_lines: 5,
    }
}

fn harness_with(provider: Arc<dyn SessionProvider>, sim: SimulatedProvider, options: ExecutorOptions) -> Harness {
    let targets = Arc::new(TargetRegistry::new());
    let deployments = Arc::new(DeploymentStore::new());
    let locks = Arc::new(TargetLocks::new());
    let executor = DeploymentExecutor::new(
        provider,
        targets.clone(),
        deployments.clone(),
        locks.clone(),
        options,
    );
    Harness {
        provider: sim,
        targets,
        deployments,
        locks,
        executor,
    }
}

fn harness(options: ExecutorOptions) -> Harness {
    let sim = SimulatedProvider::new();
    harness_with(Arc::new(sim.clone()), sim, options)
}

impl Harness {
    async fn add_target(&self, name: &str, address: &str) -> Target {
        self.targets
            .create(NewTarget {
                name: name.to_string(),
                address: address.to_string(),
                ssh_key_path: "/keys/id_ed25519".to_string(),
                ssh_user: "root".to_string(),
            })
            .await
            .unwrap()
    }

    fn status(&self, id: DeploymentId) -> DeploymentStatus {
        self.deployments.get(id).unwrap().status
    }

    fn log_messages(&self, id: DeploymentId) -> Vec<String> {
        self.deployments
            .logs(id, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    async fn wait_status(&self, id: DeploymentId, status: DeploymentStatus) -> Deployment {
        wait_for(&format!("deployment {} to be {:?}", id, status), || {
            self.status(id) == status
        })
        .await;
        self.deployments.get(id).unwrap()
    }

    async fn wait_terminal(&self, id: DeploymentId) -> Deployment {
        wait_for(&format!("deployment {} to finish", id), || {
            self.status(id).is_terminal()
        })
        .await;
        self.deployments.get(id).unwrap()
    }
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn container(target: &Target, name: &str, image: &str, ports: &[PortMapping]) -> DeploymentRequest {
    DeploymentRequest {
        target_id: target.id,
        workload: Workload::Container {
            image: image.to_string(),
            container_name: name.to_string(),
            ports: ports.to_vec(),
        },
    }
}

#[tokio::test]
async fn test_container_deployment_succeeds() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[PortMapping::new(8080, 80)]))
        .unwrap();
    assert_eq!(queued.status, DeploymentStatus::Queued);
    assert_eq!(
        queued.message,
        "Docker deployment queued: web (nginx:latest) with ports 8080:80 to 10.0.0.5"
    );

    let done = h.wait_terminal(queued.id).await;
    assert_eq!(done.status, DeploymentStatus::Success, "{}", done.message);
    assert_eq!(done.message, "Container web deployed successfully (ID: 5eed00015eed)");
    assert!(done.started_at.is_some());
    assert!(done.finished_at >= done.started_at);

    assert_eq!(
        h.provider.commands("10.0.0.5"),
        vec![
            "docker pull nginx:latest",
            "docker stop web",
            "docker rm web",
            "docker run -d --name web -p 8080:80 nginx:latest",
        ]
    );
    assert_eq!(h.provider.open_sessions("10.0.0.5"), 0);

    let logs = h.log_messages(queued.id);
    assert!(logs.contains(&"Status: Downloaded newer image for nginx:latest".to_string()));
    assert_eq!(logs.last().unwrap(), &done.message);

    // stop/rm of a missing container are tolerated
    let events = h.deployments.logs(queued.id, 0).unwrap();
    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Warn && e.message.contains("No such container: web")));
    assert!(events.iter().all(|e| e.level != EventLevel::Error));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
}

#[tokio::test]
async fn test_compose_deployment_succeeds() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let queued = h
        .executor
        .submit(DeploymentRequest {
            target_id: vm1.id,
            workload: Workload::Compose {
                compose_file_path: "/srv/shop/docker-compose.yml".to_string(),
            },
        })
        .unwrap();

    let done = h.wait_terminal(queued.id).await;
    assert_eq!(done.status, DeploymentStatus::Success);
    assert_eq!(
        done.message,
        "Docker Compose stack deployed successfully from /srv/shop/docker-compose.yml"
    );
    // Compose reports progress on stderr
    assert!(h.log_messages(queued.id).iter().any(|m| m.contains("shop-app-1")));
}

#[tokio::test]
async fn test_failed_step_releases_lock() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider.script_once(
        "docker pull nosuch",
        ScriptedReply::failure(
            1,
            &["Error response from daemon: pull access denied for nosuch, repository does not exist"],
        ),
    );

    let first = h
        .executor
        .submit(container(&vm1, "web", "nosuch:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(first.id).await;
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(
        failed.message,
        "step `docker pull nosuch:latest` exited with status 1: Error response from daemon: pull access denied for nosuch, repository does not exist"
    );
    // Later steps never ran
    assert_eq!(h.provider.commands("10.0.0.5"), vec!["docker pull nosuch:latest"]);

    wait_for("lock release", || !h.locks.is_locked(vm1.id)).await;

    let started = Instant::now();
    let second = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let done = h.wait_terminal(second.id).await;
    assert_eq!(done.status, DeploymentStatus::Success);
    assert!(started.elapsed() < options().lock_timeout);
    assert_eq!(h.provider.open_sessions("10.0.0.5"), 0);
}

#[tokio::test]
async fn test_failure_message_falls_back() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider
        .script("docker run", ScriptedReply::failure::<&str>(125, &[]));

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(queued.id).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(
        failed.message,
        "step `docker run -d --name web nginx:latest` exited with status 125: command produced no output"
    );
}

#[tokio::test]
async fn test_same_target_is_serialized_in_order() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let ids: Vec<DeploymentId> = (0..12)
        .map(|i| {
            h.executor
                .submit(container(&vm1, &format!("web{}", i), "nginx:latest", &[]))
                .unwrap()
                .id
        })
        .collect();

    let last = *ids.last().unwrap();
    while !h.status(last).is_terminal() {
        assert!(h.deployments.count_with_status(vm1.id, DeploymentStatus::Running) <= 1);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let done: Vec<Deployment> = ids.iter().map(|id| h.deployments.get(*id).unwrap()).collect();
    assert!(done.iter().all(|d| d.status == DeploymentStatus::Success));
    for pair in done.windows(2) {
        // FIFO: each one starts only after its predecessor finished
        assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
    }
    assert_eq!(h.provider.max_concurrent_sessions("10.0.0.5"), 1);

    let runs: Vec<String> = h
        .provider
        .commands("10.0.0.5")
        .into_iter()
        .filter(|c| c.starts_with("docker run"))
        .collect();
    let expected: Vec<String> = (0..12)
        .map(|i| format!("docker run -d --name web{} nginx:latest", i))
        .collect();
    assert_eq!(runs, expected);
}

#[tokio::test]
async fn test_distinct_targets_run_concurrently() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    let vm2 = h.add_target("vm2", "10.0.0.6").await;

    let gate = Arc::new(Semaphore::new(0));
    h.provider.script(
        "docker pull",
        ScriptedReply::success(&["pulled"]).with_gate(gate.clone()),
    );

    let a = h.executor.submit(container(&vm1, "web", "nginx:latest", &[])).unwrap();
    let b = h.executor.submit(container(&vm2, "web", "nginx:latest", &[])).unwrap();

    // Both hold their own target lock at the same time
    h.wait_status(a.id, DeploymentStatus::Running).await;
    h.wait_status(b.id, DeploymentStatus::Running).await;

    gate.add_permits(2);
    assert_eq!(h.wait_terminal(a.id).await.status, DeploymentStatus::Success);
    assert_eq!(h.wait_terminal(b.id).await.status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_logs_are_readable_while_running() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let gate = Arc::new(Semaphore::new(0));
    h.provider.script(
        "docker pull",
        ScriptedReply::success(&["L1", "L2", "L3"]).with_gate(gate.clone()),
    );

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    h.wait_status(queued.id, DeploymentStatus::Running).await;

    gate.add_permits(1);
    wait_for("first line", || h.log_messages(queued.id).contains(&"L1".to_string())).await;

    let snapshot = h.deployments.logs(queued.id, 0).unwrap();
    let messages: Vec<&str> = snapshot.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"L1"));
    assert!(!messages.contains(&"L2"));
    assert_eq!(h.status(queued.id), DeploymentStatus::Running);

    gate.add_permits(2);
    let done = h.wait_terminal(queued.id).await;
    assert_eq!(done.status, DeploymentStatus::Success);

    // The earlier snapshot is a prefix of the final log
    let all = h.deployments.logs(queued.id, 0).unwrap();
    assert_eq!(&all[..snapshot.len()], &snapshot[..]);

    let since = h.deployments.logs(queued.id, snapshot.len() as u64).unwrap();
    assert_eq!(since.first().unwrap().message, "L2");
    assert_eq!(since.first().unwrap().seq, snapshot.len() as u64);
}

#[tokio::test]
async fn test_cancel_running_deployment() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider
        .script_once("docker pull", ScriptedReply::success(&["Pulling"]).hanging());

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    h.wait_status(queued.id, DeploymentStatus::Running).await;
    assert!(h.locks.is_locked(vm1.id));

    assert!(h.executor.cancel(queued.id).unwrap());
    let cancelled = h.wait_terminal(queued.id).await;
    assert_eq!(cancelled.status, DeploymentStatus::Failed);
    assert_eq!(cancelled.message, "deployment cancelled");

    wait_for("lock release", || !h.locks.is_locked(vm1.id)).await;
    assert_eq!(h.provider.open_sessions("10.0.0.5"), 0);

    // Already finished
    assert!(!h.executor.cancel(queued.id).unwrap());
    assert!(matches!(h.executor.cancel(99), Err(PortalError::NotFound(_))));
}

#[tokio::test]
async fn test_cancel_queued_deployment_never_starts() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider
        .script_once("docker pull", ScriptedReply::success(&["Pulling"]).hanging());

    let first = h.executor.submit(container(&vm1, "web", "nginx:latest", &[])).unwrap();
    let second = h.executor.submit(container(&vm1, "api", "nginx:latest", &[])).unwrap();
    h.wait_status(first.id, DeploymentStatus::Running).await;
    assert_eq!(h.status(second.id), DeploymentStatus::Queued);

    assert!(h.executor.cancel(second.id).unwrap());
    assert!(h.executor.cancel(first.id).unwrap());

    let second = h.wait_terminal(second.id).await;
    assert_eq!(second.status, DeploymentStatus::Failed);
    assert_eq!(second.message, "deployment cancelled");
    assert!(second.started_at.is_none());
    assert!(!h
        .provider
        .commands("10.0.0.5")
        .iter()
        .any(|c| c.contains("api")));
}

#[tokio::test]
async fn test_lock_timeout_fails_deployment() {
    let h = harness(ExecutorOptions {
        lock_timeout: Duration::from_millis(100),
        ..options()
    });
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    // Somebody else (e.g. a container env update) holds the target
    let guard = h.locks.acquire(vm1.id, Duration::from_secs(1)).await.unwrap();

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(queued.id).await;
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.message, "timed out after 100ms waiting for target 1 lock");
    assert!(failed.started_at.is_none());
    assert_eq!(h.provider.connect_count(), 0);

    drop(guard);
}

#[tokio::test]
async fn test_command_timeout_fails_deployment() {
    let h = harness(ExecutorOptions {
        command_timeout: Duration::from_millis(100),
        ..options()
    });
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider
        .script("docker pull", ScriptedReply::success::<&str>(&[]).hanging());

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(queued.id).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.message, "deployment did not finish within 100ms");
    wait_for("lock release", || !h.locks.is_locked(vm1.id)).await;
    assert_eq!(h.provider.open_sessions("10.0.0.5"), 0);
}

#[tokio::test]
async fn test_unreachable_target_fails_deployment() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.99").await;
    h.provider.set_unreachable("10.0.0.99");

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(queued.id).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.message.contains("Connection refused"), "{}", failed.message);
    assert_eq!(h.provider.connect_count(), 1);
    assert!(h.provider.commands("10.0.0.99").is_empty());
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let h = harness(options());
    let ghost = Target {
        id: 42,
        name: "ghost".to_string(),
        address: "10.0.0.42".to_string(),
        ssh_user: "root".to_string(),
        ssh_key_path: "/keys/id".to_string(),
        created_at: chrono::Utc::now(),
        env: Default::default(),
    };

    let result = h.executor.submit(container(&ghost, "web", "nginx:latest", &[]));
    assert!(matches!(result, Err(PortalError::NotFound(_))));
    assert!(h.deployments.list().is_empty());
    assert_eq!(h.provider.connect_count(), 0);
}

struct PanickingProvider;

#[async_trait]
impl SessionProvider for PanickingProvider {
    async fn connect(&self, _target: &Target) -> Result<Box<dyn Session>, PortalError> {
        panic!("boom")
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

#[tokio::test]
async fn test_panic_fails_deployment_and_releases_lock() {
    let h = harness_with(Arc::new(PanickingProvider), SimulatedProvider::new(), options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let queued = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    let failed = h.wait_terminal(queued.id).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.message, "Internal error: deployment panicked: boom");
    wait_for("lock release", || !h.locks.is_locked(vm1.id)).await;

    // The lane survives the panic
    let next = h
        .executor
        .submit(container(&vm1, "web", "nginx:latest", &[]))
        .unwrap();
    assert_eq!(h.wait_terminal(next.id).await.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_work() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    h.provider
        .script("docker pull", ScriptedReply::success::<&str>(&[]).hanging());

    let running = h.executor.submit(container(&vm1, "web", "nginx:latest", &[])).unwrap();
    let queued = h.executor.submit(container(&vm1, "api", "nginx:latest", &[])).unwrap();
    h.wait_status(running.id, DeploymentStatus::Running).await;

    h.executor.shutdown(Duration::from_secs(5)).await;

    for id in [running.id, queued.id] {
        let deployment = h.deployments.get(id).unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.message, "deployment cancelled");
    }
    assert!(matches!(
        h.executor.submit(container(&vm1, "web", "nginx:latest", &[])),
        Err(PortalError::ServerError(_))
    ));
}

#[tokio::test]
async fn test_deployment_failed_before_start_is_not_cancellable() {
    let h = harness(options());
    let vm1 = h.add_target("vm1", "10.0.0.5").await;

    let guard = h.locks.acquire(vm1.id, Duration::from_secs(1)).await.unwrap();
    let first = h.executor.submit(container(&vm1, "web", "nginx:latest", &[])).unwrap();
    h.deployments
        .mark_failed(first.id, "superseded".to_string())
        .unwrap();
    let second = h.executor.submit(container(&vm1, "api", "nginx:latest", &[])).unwrap();
    drop(guard);

    let second = h.wait_terminal(second.id).await;
    assert_eq!(second.status, DeploymentStatus::Success, "{}", second.message);

    // The lane gave up on the first one without running it
    assert!(!h.executor.cancel(first.id).unwrap());
    let first = h.deployments.get(first.id).unwrap();
    assert_eq!(first.status, DeploymentStatus::Failed);
    assert_eq!(first.message, "superseded");
    assert!(first.started_at.is_none());
    assert_eq!(h.provider.connect_count(), 1);
    assert!(!h.provider.commands("10.0.0.5").iter().any(|c| c.contains("web")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_racing_submits_leaves_nothing_pending() {
    let h = Arc::new(harness(options()));
    let vm1 = h.add_target("vm1", "10.0.0.5").await;
    let vm2 = h.add_target("vm2", "10.0.0.6").await;

    let mut submitters = Vec::new();
    for i in 0..4 {
        let h = h.clone();
        let target = if i % 2 == 0 { vm1.clone() } else { vm2.clone() };
        submitters.push(tokio::spawn(async move {
            let mut accepted = 0usize;
            loop {
                match h.executor.submit(container(&target, "web", "nginx:latest", &[])) {
                    Ok(_) => accepted += 1,
                    Err(PortalError::ServerError(_)) => return accepted,
                    Err(e) => panic!("unexpected: {:?}", e),
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    wait_for("submissions to pile up", || h.deployments.list().len() >= 20).await;
    h.executor.shutdown(Duration::from_secs(5)).await;

    let mut accepted = 0;
    for submitter in submitters {
        accepted += submitter.await.unwrap();
    }

    let deployments = h.deployments.list();
    assert_eq!(deployments.len(), accepted);
    for deployment in deployments {
        assert!(
            deployment.status.is_terminal(),
            "deployment {} left {:?} after shutdown",
            deployment.id,
            deployment.status
        );
    }
}
