//! In-memory session provider
//!
//! Emulates the subset of the docker CLI the portal emits, one engine per
//! target address. It backs `--simulate` mode and the test suite: output can
//! be scripted per command, gated line by line, or made to hang, and the
//! provider counts connection attempts and concurrent sessions per host.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::errors::PortalError;
use crate::models::target::Target;
use crate::remote::{CommandOutput, OutputLine, OutputStream, Session, SessionProvider};

const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Canned output for commands matching a pattern
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub lines: Vec<OutputLine>,
    pub exit_code: u32,
    /// Each line waits for one permit before it is emitted
    pub gate: Option<Arc<Semaphore>>,
    /// Never exit after the lines are emitted
    pub hang: bool,
}

impl ScriptedReply {
    pub fn success<S: AsRef<str>>(stdout: &[S]) -> Self {
        Self {
            lines: stdout.iter().map(|l| OutputLine::stdout(l.as_ref())).collect(),
            exit_code: 0,
            gate: None,
            hang: false,
        }
    }

    pub fn failure<S: AsRef<str>>(exit_code: u32, stderr: &[S]) -> Self {
        Self {
            lines: stderr.iter().map(|l| OutputLine::stderr(l.as_ref())).collect(),
            exit_code,
            gate: None,
            hang: false,
        }
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Debug, Clone)]
struct Script {
    address: Option<String>,
    pattern: String,
    reply: ScriptedReply,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct SimContainer {
    id: String,
    name: String,
    image: String,
    ports: Vec<String>,
    env: Vec<String>,
    restart_policy: String,
    running: bool,
    logs: Vec<String>,
}

impl SimContainer {
    fn status(&self) -> String {
        if self.running {
            "Up 2 seconds".to_string()
        } else {
            "Exited (0) 1 second ago".to_string()
        }
    }

    fn published_ports(&self) -> String {
        self.ports
            .iter()
            .filter_map(|p| {
                let (binding, proto) = match p.split_once('/') {
                    Some((binding, proto)) => (binding, proto),
                    None => (p.as_str(), "tcp"),
                };
                let (host, container) = binding.split_once(':')?;
                Some(format!("0.0.0.0:{}->{}/{}", host, container, proto))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn port_bindings(&self) -> serde_json::Value {
        let mut bindings = serde_json::Map::new();
        for p in &self.ports {
            let (binding, proto) = match p.split_once('/') {
                Some((binding, proto)) => (binding, proto),
                None => (p.as_str(), "tcp"),
            };
            if let Some((host, container)) = binding.split_once(':') {
                bindings.insert(
                    format!("{}/{}", container, proto),
                    json!([{ "HostIp": "", "HostPort": host }]),
                );
            }
        }
        serde_json::Value::Object(bindings)
    }

    fn inspect(&self) -> serde_json::Value {
        json!({
            "Id": self.id,
            "Name": format!("/{}", self.name),
            "Config": {
                "Image": self.image,
                "Env": self.env,
            },
            "HostConfig": {
                "PortBindings": self.port_bindings(),
                "RestartPolicy": { "Name": self.restart_policy, "MaximumRetryCount": 0 },
            },
            "State": {
                "Status": if self.running { "running" } else { "exited" },
                "Running": self.running,
            },
        })
    }
}

#[derive(Debug, Default)]
struct HostEngine {
    containers: BTreeMap<String, SimContainer>,
    images: HashSet<String>,
    next_id: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionCounts {
    open: usize,
    max: usize,
}

/// What a command produced
struct Execution {
    lines: Vec<OutputLine>,
    exit_code: u32,
    gate: Option<Arc<Semaphore>>,
    hang: bool,
}

impl Execution {
    fn new(lines: Vec<OutputLine>, exit_code: u32) -> Self {
        Self {
            lines,
            exit_code,
            gate: None,
            hang: false,
        }
    }

    fn no_such_container(name: &str) -> Self {
        Self::new(
            vec![OutputLine::stderr(format!(
                "Error response from daemon: No such container: {}",
                name
            ))],
            1,
        )
    }
}

impl From<ScriptedReply> for Execution {
    fn from(reply: ScriptedReply) -> Self {
        Self {
            lines: reply.lines,
            exit_code: reply.exit_code,
            gate: reply.gate,
            hang: reply.hang,
        }
    }
}

#[derive(Default)]
struct SimState {
    hosts: Mutex<HashMap<String, HostEngine>>,
    unreachable: Mutex<HashSet<String>>,
    scripts: Mutex<Vec<Script>>,
    sessions: Mutex<HashMap<String, SessionCounts>>,
    history: Mutex<Vec<(String, String)>>,
    connects: AtomicUsize,
    line_delay: Duration,
}

impl SimState {
    fn scripted(&self, address: &str, command: &str) -> Option<ScriptedReply> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let index = scripts.iter().position(|s| {
            s.address.as_deref().map_or(true, |a| a == address) && command.contains(&s.pattern)
        })?;

        let reply = scripts[index].reply.clone();
        if let Some(remaining) = scripts[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                scripts.remove(index);
            }
        }
        Some(reply)
    }

    fn execute(&self, address: &str, command: &str) -> Execution {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((address.to_string(), command.to_string()));

        if let Some(reply) = self.scripted(address, command) {
            return reply.into();
        }

        let words = split_words(command);
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let engine = hosts.entry(address.to_string()).or_default();
        engine.execute(&words)
    }
}

impl HostEngine {
    fn execute(&mut self, words: &[String]) -> Execution {
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["docker", "pull", image] => self.pull(image),
            ["docker", "stop", name] => self.stop(name),
            ["docker", "rm", "-f", name] => self.remove(name, true),
            ["docker", "rm", name] => self.remove(name, false),
            ["docker", "run", rest @ ..] => self.run(rest),
            ["docker", "ps", rest @ ..] => self.ps(rest.contains(&"-a")),
            ["docker", "logs", "--tail", lines, name] => self.logs(name, lines),
            ["docker", "inspect", "--type", "container", name] => self.inspect(name),
            ["docker", "compose", "-f", path, "up", "-d"] => compose_up(path),
            [first, ..] => Execution::new(
                vec![OutputLine::stderr(format!("sh: 1: {}: not found", first))],
                127,
            ),
            [] => Execution::new(Vec::new(), 0),
        }
    }

    fn pull(&mut self, image: &str) -> Execution {
        let (repo, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        self.images.insert(image.to_string());
        Execution::new(
            vec![
                OutputLine::stdout(format!("{}: Pulling from library/{}", tag, repo)),
                OutputLine::stdout("Digest: sha256:0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0"),
                OutputLine::stdout(format!("Status: Downloaded newer image for {}", image)),
            ],
            0,
        )
    }

    fn stop(&mut self, name: &str) -> Execution {
        match self.containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                Execution::new(vec![OutputLine::stdout(name)], 0)
            }
            None => Execution::no_such_container(name),
        }
    }

    fn remove(&mut self, name: &str, force: bool) -> Execution {
        match self.containers.get(name) {
            Some(container) if container.running && !force => Execution::new(
                vec![OutputLine::stderr(format!(
                    "Error response from daemon: cannot remove container \"/{}\": container is running: stop the container before removing or force remove",
                    name
                ))],
                1,
            ),
            Some(_) => {
                self.containers.remove(name);
                Execution::new(vec![OutputLine::stdout(name)], 0)
            }
            None => Execution::no_such_container(name),
        }
    }

    fn run(&mut self, args: &[&str]) -> Execution {
        let mut name = None;
        let mut ports = Vec::new();
        let mut env = vec![DEFAULT_PATH_ENV.to_string()];
        let mut restart_policy = "no".to_string();
        let mut image = None;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-d" => {}
                "--name" => name = iter.next().map(|s| s.to_string()),
                "-p" => ports.extend(iter.next().map(|s| s.to_string())),
                "-e" => env.extend(iter.next().map(|s| s.to_string())),
                "--restart" => {
                    if let Some(policy) = iter.next() {
                        restart_policy = policy.to_string();
                    }
                }
                other if image.is_none() && !other.starts_with('-') => image = Some(other.to_string()),
                _ => {}
            }
        }

        let Some(image) = image else {
            return Execution::new(
                vec![OutputLine::stderr("\"docker run\" requires at least 1 argument.")],
                125,
            );
        };

        self.next_id += 1;
        let id = format!("{:08x}", 0x5eed_0000 + self.next_id).repeat(8);
        let name = name.unwrap_or_else(|| format!("sim_{}", self.next_id));

        if let Some(existing) = self.containers.get(&name) {
            return Execution::new(
                vec![OutputLine::stderr(format!(
                    "docker: Error response from daemon: Conflict. The container name \"/{}\" is already in use by container \"{}\".",
                    name, existing.id
                ))],
                125,
            );
        }

        self.images.insert(image.clone());
        self.containers.insert(
            name.clone(),
            SimContainer {
                id: id.clone(),
                name: name.clone(),
                image,
                ports,
                env,
                restart_policy,
                running: true,
                logs: vec![format!("{} started", name)],
            },
        );
        Execution::new(vec![OutputLine::stdout(id)], 0)
    }

    fn ps(&self, all: bool) -> Execution {
        let lines = self
            .containers
            .values()
            .filter(|c| all || c.running)
            .map(|c| {
                OutputLine::stdout(format!(
                    "{}\t{}\t{}\t{}\t{}",
                    &c.id[..12],
                    c.name,
                    c.image,
                    c.status(),
                    c.published_ports()
                ))
            })
            .collect();
        Execution::new(lines, 0)
    }

    fn logs(&self, name: &str, lines: &str) -> Execution {
        let Some(container) = self.containers.get(name) else {
            return Execution::no_such_container(name);
        };
        let count = lines.parse::<usize>().unwrap_or(usize::MAX);
        let start = container.logs.len().saturating_sub(count);
        Execution::new(
            container.logs[start..]
                .iter()
                .map(|l| OutputLine::stdout(l.as_str()))
                .collect(),
            0,
        )
    }

    fn inspect(&self, name: &str) -> Execution {
        match self.containers.get(name) {
            Some(container) => Execution::new(
                vec![OutputLine::stdout(
                    serde_json::Value::Array(vec![container.inspect()]).to_string(),
                )],
                0,
            ),
            None => Execution::new(
                vec![
                    OutputLine::stdout("[]"),
                    OutputLine::stderr(format!("Error: No such container: {}", name)),
                ],
                1,
            ),
        }
    }
}

fn compose_up(path: &str) -> Execution {
    let project = path
        .rsplit('/')
        .nth(1)
        .filter(|p| !p.is_empty())
        .unwrap_or("stack");
    Execution::new(
        vec![
            OutputLine::stderr(format!(" Network {}_default  Created", project)),
            OutputLine::stderr(format!(" Container {}-app-1  Started", project)),
        ],
        0,
    )
}

/// Split a command line into words, honouring quotes and backslashes.
/// Redirections such as `2>&1` are dropped.
pub fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => current.extend(chars.next()),
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.extend(chars.next());
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }

    words.retain(|w| !(w.contains('>') && w.contains('&')));
    words
}

/// Session provider backed by in-memory engines
#[derive(Clone, Default)]
pub struct SimulatedProvider {
    state: Arc<SimState>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed lines
    pub fn with_line_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(SimState {
                line_delay: delay,
                ..Default::default()
            }),
        }
    }

    /// Refuse connections to `address`
    pub fn set_unreachable(&self, address: &str) {
        self.state
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string());
    }

    /// Reply with `reply` to every command containing `pattern`
    pub fn script(&self, pattern: &str, reply: ScriptedReply) {
        self.push_script(None, pattern, reply, None);
    }

    /// Reply with `reply` to the next command containing `pattern`
    pub fn script_once(&self, pattern: &str, reply: ScriptedReply) {
        self.push_script(None, pattern, reply, Some(1));
    }

    /// Like [`script`](Self::script), restricted to one host
    pub fn script_for(&self, address: &str, pattern: &str, reply: ScriptedReply) {
        self.push_script(Some(address.to_string()), pattern, reply, None);
    }

    fn push_script(
        &self,
        address: Option<String>,
        pattern: &str,
        reply: ScriptedReply,
        remaining: Option<usize>,
    ) {
        self.state
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Script {
                address,
                pattern: pattern.to_string(),
                reply,
                remaining,
            });
    }

    /// Create a running container directly, bypassing the command log
    pub fn seed_container(&self, address: &str, name: &str, image: &str, ports: &[&str], env: &[&str]) {
        let mut words = vec!["docker".to_string(), "run".to_string(), "-d".to_string()];
        words.extend(["--name".to_string(), name.to_string()]);
        for port in ports {
            words.extend(["-p".to_string(), port.to_string()]);
        }
        for var in env {
            words.extend(["-e".to_string(), var.to_string()]);
        }
        words.push(image.to_string());

        let mut hosts = self.state.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.entry(address.to_string()).or_default().execute(&words);
    }

    /// Number of connection attempts, successful or not
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Sessions to `address` that were opened and not closed yet
    pub fn open_sessions(&self, address: &str) -> usize {
        self.counts(address).open
    }

    /// Highest number of simultaneously open sessions to `address`
    pub fn max_concurrent_sessions(&self, address: &str) -> usize {
        self.counts(address).max
    }

    /// Every command executed against `address`, in order
    pub fn commands(&self, address: &str) -> Vec<String> {
        self.state
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn counts(&self, address: &str) -> SessionCounts {
        self.state
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionProvider for SimulatedProvider {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, PortalError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let unreachable = self
            .state
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target.address);
        if unreachable {
            return Err(PortalError::ConnectionError(format!(
                "failed to reach {}: Connection refused",
                target.ssh_destination()
            )));
        }

        {
            let mut sessions = self.state.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let counts = sessions.entry(target.address.clone()).or_default();
            counts.open += 1;
            counts.max = counts.max.max(counts.open);
        }
        debug!("Simulated session opened to {}", target.ssh_destination());

        Ok(Box::new(SimSession {
            address: target.address.clone(),
            state: self.state.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

struct SimSession {
    address: String,
    state: Arc<SimState>,
    closed: bool,
}

impl SimSession {
    async fn emit(&self, execution: Execution, lines: &mpsc::Sender<OutputLine>) -> Result<u32, PortalError> {
        for (i, line) in execution.lines.into_iter().enumerate() {
            if let Some(gate) = &execution.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if i > 0 && !self.state.line_delay.is_zero() {
                tokio::time::sleep(self.state.line_delay).await;
            }
            lines.send(line).await.map_err(|_| PortalError::Cancelled)?;
        }

        if execution.hang {
            std::future::pending::<()>().await;
        }
        Ok(execution.exit_code)
    }

    fn check_open(&self) -> Result<(), PortalError> {
        if self.closed {
            return Err(PortalError::ConnectionError(format!(
                "session to {} is closed",
                self.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for SimSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, PortalError> {
        self.check_open()?;
        let execution = self.state.execute(&self.address, command);
        let capacity = execution.lines.len().max(1);
        let (tx, mut rx) = mpsc::channel(capacity);
        let exit_code = self.emit(execution, &tx).await?;
        drop(tx);

        let mut output = CommandOutput {
            exit_code,
            ..Default::default()
        };
        while let Some(line) = rx.recv().await {
            let buf = match line.stream {
                OutputStream::Stdout => &mut output.stdout,
                OutputStream::Stderr => &mut output.stderr,
            };
            buf.push_str(&line.text);
            buf.push('\n');
        }
        Ok(output)
    }

    async fn stream(
        &mut self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<u32, PortalError> {
        self.check_open()?;
        let execution = self.state.execute(&self.address, command);
        self.emit(execution, &lines).await
    }

    async fn close(&mut self) -> Result<(), PortalError> {
        if !self.closed {
            self.closed = true;
            let mut sessions = self.state.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(counts) = sessions.get_mut(&self.address) {
                counts.open = counts.open.saturating_sub(1);
            }
            debug!("Simulated session to {} closed", self.address);
        }
        Ok(())
    }
}
