//! Container introspection tests

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use deploy_portal::deploy::executor::{DeploymentExecutor, ExecutorOptions};
use deploy_portal::deploy::fsm::DeploymentStatus;
use deploy_portal::deploy::locks::TargetLocks;
use deploy_portal::errors::PortalError;
use deploy_portal::introspection::ContainerIntrospector;
use deploy_portal::models::deployment::{DeploymentRequest, Workload};
use deploy_portal::models::target::{EnvVars, NewTarget, Target};
use deploy_portal::remote::simulated::{ScriptedReply, SimulatedProvider};
use deploy_portal::store::deployments::DeploymentStore;
use deploy_portal::store::targets::TargetRegistry;

const VM1: &str = "10.0.0.5";

struct Harness {
    provider: SimulatedProvider,
    targets: Arc<TargetRegistry>,
    locks: Arc<TargetLocks>,
    introspector: ContainerIntrospector,
    target: Target,
}

async fn harness(options: ExecutorOptions) -> Harness {
    let provider = SimulatedProvider::new();
    let targets = Arc::new(TargetRegistry::new());
    let locks = Arc::new(TargetLocks::new());
    let target = targets
        .create(NewTarget {
            name: "vm1".to_string(),
            address: VM1.to_string(),
            ssh_key_path: "/keys/id_ed25519".to_string(),
            ssh_user: "root".to_string(),
        })
        .await
        .unwrap();

    let introspector = ContainerIntrospector::new(
        Arc::new(provider.clone()),
        targets.clone(),
        locks.clone(),
        options,
    );
    Harness {
        provider,
        targets,
        locks,
        introspector,
        target,
    }
}

impl Harness {
    /// Deploy `nginx:latest` as `web` through an executor sharing this
    /// harness's locks, and wait for the outcome
    async fn deploy_web(&self) -> DeploymentStatus {
        let deployments = Arc::new(DeploymentStore::new());
        let executor = DeploymentExecutor::new(
            Arc::new(self.provider.clone()),
            self.targets.clone(),
            deployments.clone(),
            self.locks.clone(),
            ExecutorOptions {
                lock_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let queued = executor
            .submit(DeploymentRequest {
                target_id: self.target.id,
                workload: Workload::Container {
                    image: "nginx:latest".to_string(),
                    container_name: "web".to_string(),
                    ports: Vec::new(),
                },
            })
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = deployments.get(queued.id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "deployment did not finish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn env(pairs: &[(&str, &str)]) -> EnvVars {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_list_containers() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider
        .seed_container(VM1, "web", "nginx:latest", &["8080:80"], &[]);
    h.provider.seed_container(VM1, "db", "postgres:16", &[], &[]);
    h.provider.seed_container("10.0.0.6", "other", "redis:7", &[], &[]);

    let containers = h.introspector.list(h.target.id, false).await.unwrap();
    let names: Vec<&str> = containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["db", "web"]);

    let web = containers.iter().find(|c| c.name == "web").unwrap();
    assert_eq!(web.image, "nginx:latest");
    assert_eq!(web.ports, "0.0.0.0:8080->80/tcp");
    assert_eq!(web.id.len(), 12);
    assert!(web.status.starts_with("Up"));

    // Nothing is cached between calls
    h.provider.seed_container(VM1, "cache", "redis:7", &[], &[]);
    assert_eq!(h.introspector.list(h.target.id, false).await.unwrap().len(), 3);
    assert_eq!(h.provider.open_sessions(VM1), 0);
}

#[tokio::test]
async fn test_list_all_includes_stopped() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);
    h.provider.seed_container(VM1, "job", "busybox", &[], &[]);
    h.provider.script(
        "docker ps --format",
        ScriptedReply::success(&[
            "5eed00015eed\tweb\tnginx:latest\tUp 2 seconds\t",
        ]),
    );

    let running = h.introspector.list(h.target.id, false).await.unwrap();
    assert_eq!(running.len(), 1);

    let all = h.introspector.list(h.target.id, true).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(h.provider.commands(VM1).last().unwrap().starts_with("docker ps -a"));
}

#[tokio::test]
async fn test_list_unknown_target() {
    let h = harness(ExecutorOptions::default()).await;
    let result = h.introspector.list(99, false).await;
    assert!(matches!(result, Err(PortalError::NotFound(_))));
    assert_eq!(h.provider.connect_count(), 0);
}

#[tokio::test]
async fn test_container_logs() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);

    let (lines, logs) = h.introspector.logs(h.target.id, "web", None).await.unwrap();
    assert_eq!(lines, 100);
    assert_eq!(logs, "web started\n");

    let (lines, _) = h.introspector.logs(h.target.id, "web", Some(0)).await.unwrap();
    assert_eq!(lines, 1);
    let (lines, _) = h
        .introspector
        .logs(h.target.id, "web", Some(50_000))
        .await
        .unwrap();
    assert_eq!(lines, 10_000);

    assert_eq!(
        h.provider.commands(VM1).last().unwrap(),
        "docker logs --tail 10000 web 2>&1"
    );
}

#[tokio::test]
async fn test_missing_container_is_not_found() {
    let h = harness(ExecutorOptions::default()).await;

    match h.introspector.logs(h.target.id, "ghost", None).await {
        Err(PortalError::NotFound(msg)) => assert_eq!(msg, "Container ghost not found on target 1"),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(
        h.introspector.get_env(h.target.id, "ghost").await,
        Err(PortalError::NotFound(_))
    ));
    assert!(matches!(
        h.introspector.remove(h.target.id, "ghost").await,
        Err(PortalError::NotFound(_))
    ));
    assert!(matches!(
        h.introspector
            .update_env(h.target.id, "ghost", env(&[("A", "1")]))
            .await,
        Err(PortalError::NotFound(_))
    ));
    assert_eq!(h.provider.open_sessions(VM1), 0);
}

#[tokio::test]
async fn test_get_env() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider
        .seed_container(VM1, "web", "nginx:latest", &[], &["MODE=prod", "GREETING=a=b"]);

    let vars = h.introspector.get_env(h.target.id, "web").await.unwrap();
    assert_eq!(vars.get("MODE").map(String::as_str), Some("prod"));
    assert_eq!(vars.get("GREETING").map(String::as_str), Some("a=b"));
    assert!(vars.contains_key("PATH"));
}

#[tokio::test]
async fn test_update_env_recreates_container() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider
        .seed_container(VM1, "web", "nginx:latest", &["8080:80"], &["OLD=1"]);

    let updated = h
        .introspector
        .update_env(h.target.id, "web", env(&[("A", "1"), ("NOTE", "hello world")]))
        .await
        .unwrap();
    assert_eq!(updated.get("A").map(String::as_str), Some("1"));
    assert_eq!(updated.get("NOTE").map(String::as_str), Some("hello world"));
    assert!(!updated.contains_key("OLD"));

    // A later read agrees with what the update returned
    let read_back = h.introspector.get_env(h.target.id, "web").await.unwrap();
    assert_eq!(read_back, updated);

    let containers = h.introspector.list(h.target.id, false).await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].image, "nginx:latest");
    assert_eq!(containers[0].ports, "0.0.0.0:8080->80/tcp");

    assert!(h
        .provider
        .commands(VM1)
        .iter()
        .any(|c| c == "docker run -d --name web -p 8080:80 -e A=1 -e 'NOTE=hello world' nginx:latest"));
    assert!(!h.locks.is_locked(h.target.id));
}

#[tokio::test]
async fn test_update_env_validates_before_connecting() {
    let h = harness(ExecutorOptions::default()).await;

    let result = h
        .introspector
        .update_env(h.target.id, "web", env(&[("BAD KEY", "1")]))
        .await;
    assert!(matches!(result, Err(PortalError::ValidationError(_))));

    let result = h
        .introspector
        .update_env(h.target.id, "web; reboot", env(&[("A", "1")]))
        .await;
    assert!(matches!(result, Err(PortalError::ValidationError(_))));

    assert_eq!(h.provider.connect_count(), 0);
}

#[tokio::test]
async fn test_update_env_waits_for_target_lock() {
    let h = harness(ExecutorOptions {
        lock_timeout: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);

    let guard = h.locks.acquire(h.target.id, Duration::from_secs(1)).await.unwrap();
    let result = h
        .introspector
        .update_env(h.target.id, "web", env(&[("A", "1")]))
        .await;
    assert!(matches!(result, Err(PortalError::LockTimeout(_))));
    assert_eq!(h.provider.connect_count(), 0);

    // Reads do not need the lock
    assert_ok!(h.introspector.get_env(h.target.id, "web").await);
    drop(guard);

    let updated = assert_ok!(
        h.introspector
            .update_env(h.target.id, "web", env(&[("A", "1")]))
            .await
    );
    assert_eq!(updated.get("A").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn test_remove_container() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);

    assert_ok!(h.introspector.remove(h.target.id, "web").await);

    assert!(h.introspector.list(h.target.id, true).await.unwrap().is_empty());
    assert!(h
        .provider
        .commands(VM1)
        .contains(&"docker rm -f web".to_string()));
}

#[tokio::test]
async fn test_unreachable_target() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider.set_unreachable(VM1);

    let err = assert_err!(h.introspector.list(h.target.id, false).await);
    assert!(matches!(err, PortalError::ConnectionError(_)));
    assert!(err.to_string().contains("Connection refused"));
}

#[tokio::test]
async fn test_hung_update_env_times_out_and_releases_lock() {
    let h = harness(ExecutorOptions {
        command_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);
    h.provider
        .script_once("docker stop", ScriptedReply::success::<&str>(&[]).hanging());

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        h.introspector
            .update_env(h.target.id, "web", env(&[("A", "1")])),
    )
    .await
    .expect("update_env must be bounded by the command timeout");

    match result {
        Err(PortalError::Timeout(msg)) => assert_eq!(
            msg,
            "remote command on root@10.0.0.5 did not finish within 200ms"
        ),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(!h.locks.is_locked(h.target.id));
    assert_eq!(h.provider.open_sessions(VM1), 0);

    assert_eq!(h.deploy_web().await, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_hung_remove_times_out_and_releases_lock() {
    let h = harness(ExecutorOptions {
        command_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);
    h.provider
        .script_once("docker rm -f", ScriptedReply::success::<&str>(&[]).hanging());

    let err = assert_err!(h.introspector.remove(h.target.id, "web").await);
    assert!(matches!(err, PortalError::Timeout(_)));
    assert!(!h.locks.is_locked(h.target.id));

    // Reads are bounded too
    h.provider
        .script_once("docker ps", ScriptedReply::success::<&str>(&[]).hanging());
    let err = assert_err!(h.introspector.list(h.target.id, false).await);
    assert!(matches!(err, PortalError::Timeout(_)));
}

#[tokio::test]
async fn test_failed_update_env_releases_lock() {
    let h = harness(ExecutorOptions::default()).await;
    h.provider.seed_container(VM1, "web", "nginx:latest", &[], &[]);
    h.provider.script_once(
        "docker rm web",
        ScriptedReply::failure(1, &["Error response from daemon: removal of container web is already in progress"]),
    );

    let err = assert_err!(
        h.introspector
            .update_env(h.target.id, "web", env(&[("A", "1")]))
            .await
    );
    match err {
        PortalError::RemoteCommandError { command, exit_code, .. } => {
            assert_eq!(command, "docker rm web");
            assert_eq!(exit_code, 1);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(!h.locks.is_locked(h.target.id));
    assert_eq!(h.provider.open_sessions(VM1), 0);

    assert_eq!(h.deploy_web().await, DeploymentStatus::Success);
}
