//! One broker session: one agent subprocess, one event loop.
//!
//! All session state (queues, correlation tables, lifecycle phase) is
//! mutated on a single sequential timeline: reader tasks, timers, and the
//! flusher only post [`LoopEvent`]s into the loop's channel. Parallelism is
//! confined to I/O waiting.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approvals::{validate_forwarded_result, ApprovalPolicy, Disposition};
use crate::config::RelayConfig;
use crate::pending::{InboundEntry, InboundTable, OutboundEntry, OutboundTable};
use crate::protocol::{
    classify, derive_routing_keys, MsgKind, RoutingKeys, RpcId, JSONRPC_INVALID_PARAMS,
    JSONRPC_REQUEST_TIMEOUT,
};
use crate::transport::{gate_open, PauseKind, Transport};

pub const EVENT_VERSION: u32 = 1;

/// Hard deadline for flushing queued events once an exit has been requested.
const EXIT_FLUSH_DEADLINE_MS: u64 = 2_000;

/// Exit status of the agent subprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// The agent's wired stdio plus exit notification. Production code builds
/// this from a spawned child process; tests build it from in-memory pipes.
pub struct AgentIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub pid: Option<u32>,
    pub exited: oneshot::Receiver<AgentExit>,
}

/// Spawn the agent with a fixed argv (`<agent> app-server`), fully piped
/// stdio, and the configured working directory. The environment is
/// inherited.
pub fn spawn_agent(config: &RelayConfig) -> Result<AgentIo> {
    let mut command = Command::new(&config.agent_path);
    command
        .arg("app-server")
        .current_dir(&config.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {} app-server", config.agent_path))?;

    let stdin = child
        .stdin
        .take()
        .context("agent stdin unavailable")?;
    let stdout = child
        .stdout
        .take()
        .context("agent stdout unavailable")?;
    let stderr = child.stderr.take();
    let pid = child.id();

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => AgentExit {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(err) => {
                warn!("failed to await agent exit: {}", err);
                AgentExit::default()
            }
        };
        let _ = exit_tx.send(exit);
    });

    Ok(AgentIo {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        pid,
        exited: exit_rx,
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_agent(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if let Err(err) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, %signal, "failed to signal agent: {}", err);
    }
}

#[derive(Debug)]
enum LoopEvent {
    ControllerLine(String),
    ControllerClosed,
    AgentLine(String),
    AgentStderr(String),
    AgentExited(AgentExit),
    HandshakeTimeout(RpcId),
    InboundTimeout(RpcId),
    Heartbeat,
    KillEscalation,
    Drained,
    ExitDeadline,
    Signal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Handshaking,
    Ready,
    Draining,
    Aborting,
    Exited,
}

#[derive(Debug, Clone)]
struct ExitPlan {
    code: i32,
    reason: String,
}

#[derive(Debug, Default)]
struct SessionStats {
    controller_lines: u64,
    agent_lines: u64,
    controller_parse_errors: u64,
    agent_parse_errors: u64,
    to_agent_messages: u64,
    from_agent_messages: u64,
    auto_approvals: u64,
    forwarded_agent_requests: u64,
}

struct Session {
    config: RelayConfig,
    policy: ApprovalPolicy,
    session_id: String,
    seq: u64,
    started_at_ms: i64,
    phase: Phase,
    next_id: u64,
    agent_user_agent: Option<String>,
    stats: SessionStats,
    outbound: OutboundTable,
    inbound: InboundTable,
    buffered_input: Vec<Value>,
    store: crate::state::StateStore,
    transport: Transport,
    tx: mpsc::UnboundedSender<LoopEvent>,
    agent_stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    agent_pid: Option<u32>,
    agent_alive: bool,
    exit_requested: bool,
    exit_plan: Option<ExitPlan>,
    done: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run a session against real stdio and a freshly spawned agent. Returns
/// the process exit code.
pub async fn run(config: RelayConfig) -> i32 {
    let agent = spawn_agent(&config);
    run_with_io(config, tokio::io::stdin(), tokio::io::stdout(), agent, true).await
}

/// Run a session over caller-provided streams. `install_signals` wires
/// SIGINT/SIGTERM forwarding and should be false under test.
pub async fn run_with_io<C, S>(
    config: RelayConfig,
    controller: C,
    sink: S,
    agent: Result<AgentIo>,
    install_signals: bool,
) -> i32
where
    C: AsyncRead + Send + Unpin + 'static,
    S: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session::new(config, tx.clone());

    let drained_tx = tx.clone();
    tokio::spawn(session.transport.outbox().run_flusher(sink, move || {
        let _ = drained_tx.send(LoopEvent::Drained);
    }));

    if install_signals {
        install_signal_forwarders(tx.clone());
    }

    session.store.load();
    session.emit_state("loaded");
    session.emit_starting();

    match agent {
        Ok(agent) => {
            session.agent_stdin = Some(agent.stdin);
            session.agent_pid = agent.pid;
            session.agent_alive = true;

            spawn_line_reader(
                agent.stdout,
                session.transport.gate(),
                tx.clone(),
                LoopEvent::AgentLine,
                None,
            );
            if let Some(stderr) = agent.stderr {
                spawn_line_reader(
                    stderr,
                    session.transport.gate(),
                    tx.clone(),
                    LoopEvent::AgentStderr,
                    None,
                );
            }
            spawn_line_reader(
                controller,
                session.transport.gate(),
                tx.clone(),
                LoopEvent::ControllerLine,
                Some(LoopEvent::ControllerClosed),
            );

            let exit_tx = tx.clone();
            let exited = agent.exited;
            tokio::spawn(async move {
                if let Ok(exit) = exited.await {
                    let _ = exit_tx.send(LoopEvent::AgentExited(exit));
                }
            });

            session.start_handshake().await;
        }
        Err(err) => {
            session.emit_error(
                "Failed to spawn agent app-server",
                &[("error", json!(err.to_string()))],
            );
            session.request_exit(1, "spawn-error");
        }
    }

    while let Some(event) = rx.recv().await {
        session.handle_event(event).await;
        if session.done {
            break;
        }
    }

    session.phase = Phase::Exited;
    match session.exit_plan.as_ref() {
        Some(plan) => {
            info!(code = plan.code, reason = %plan.reason, "relay session finished");
            plan.code
        }
        None => 0,
    }
}

fn install_signal_forwarders(tx: mpsc::UnboundedSender<LoopEvent>) {
    let tx_int = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx_int.send(LoopEvent::Signal("SIGINT"));
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to install SIGTERM handler: {}", err);
                    return;
                }
            };
            if sigterm.recv().await.is_some() {
                let _ = tx.send(LoopEvent::Signal("SIGTERM"));
            }
        });
    }
}

/// One reader task per input stream. The pause gate is checked between
/// lines; pausing leaves buffered-but-unread bytes in place.
fn spawn_line_reader<R>(
    reader: R,
    mut gate: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<LoopEvent>,
    make: fn(String) -> LoopEvent,
    eof: Option<LoopEvent>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            if !gate_open(&mut gate).await {
                return;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(make(line)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if let Some(event) = eof {
                        let _ = tx.send(event);
                    }
                    return;
                }
                Err(err) => {
                    debug!("input reader error: {}", err);
                    return;
                }
            }
        }
    });
}

impl Session {
    fn new(config: RelayConfig, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        let policy = ApprovalPolicy {
            exec: config.exec_approval,
            file: config.file_approval,
        };
        let transport = Transport::new(config.max_out_queue);
        let store = crate::state::StateStore::new(config.state_file.clone());

        Self {
            config,
            policy,
            session_id: format!("relay-{}", Uuid::new_v4()),
            seq: 0,
            started_at_ms: now_ms(),
            phase: Phase::Starting,
            next_id: 1,
            agent_user_agent: None,
            stats: SessionStats::default(),
            outbound: OutboundTable::default(),
            inbound: InboundTable::default(),
            buffered_input: Vec::new(),
            store,
            transport,
            tx,
            agent_stdin: None,
            agent_pid: None,
            agent_alive: false,
            exit_requested: false,
            exit_plan: None,
            done: false,
        }
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::ControllerLine(line) => self.on_controller_line(line).await,
            LoopEvent::ControllerClosed => {
                debug!("controller input closed");
            }
            LoopEvent::AgentLine(line) => self.on_agent_line(line).await,
            LoopEvent::AgentStderr(line) => {
                let mut event = self.base_event("relay/agentStderr");
                event.insert("line".into(), json!(line));
                self.emit(event);
            }
            LoopEvent::AgentExited(exit) => self.on_agent_exited(exit),
            LoopEvent::HandshakeTimeout(id) => self.on_handshake_timeout(id),
            LoopEvent::InboundTimeout(id) => self.on_inbound_timeout(id).await,
            LoopEvent::Heartbeat => {
                if self.exit_plan.is_none() && self.phase == Phase::Ready {
                    self.emit_stats("heartbeat");
                }
            }
            LoopEvent::KillEscalation => {
                if self.agent_alive {
                    self.kill_agent(true);
                }
            }
            LoopEvent::Drained => self.on_drained(),
            LoopEvent::ExitDeadline => {
                self.done = true;
            }
            LoopEvent::Signal(name) => self.on_signal(name),
        }
    }

    // ----- event plumbing -----

    fn base_event(&mut self, event_type: &str) -> Map<String, Value> {
        self.seq += 1;
        let mut map = Map::new();
        map.insert("type".into(), json!(event_type));
        map.insert("v".into(), json!(EVENT_VERSION));
        map.insert("seq".into(), json!(self.seq));
        map.insert("ts".into(), json!(now_ms()));
        map.insert("sessionId".into(), json!(self.session_id));
        map.insert("pid".into(), json!(std::process::id()));
        map
    }

    fn emit(&mut self, event: Map<String, Value>) {
        let mut line = Value::Object(event).to_string();
        line.push('\n');
        let depth = self.transport.push(line);
        if self.transport.should_pause(depth) {
            self.pause_io(
                PauseKind::Backpressure,
                format!("outQueue>={}", self.config.max_out_queue),
            );
        }
    }

    fn emit_error(&mut self, message: &str, extra: &[(&str, Value)]) {
        let mut event = self.base_event("relay/error");
        event.insert("message".into(), json!(message));
        for (key, value) in extra {
            event.insert((*key).into(), value.clone());
        }
        self.emit(event);
    }

    fn emit_starting(&mut self) {
        let mut event = self.base_event("relay/starting");
        event.insert("agentPath".into(), json!(self.config.agent_path));
        event.insert("cwd".into(), json!(self.config.cwd.to_string_lossy()));
        event.insert(
            "stateFile".into(),
            json!(self.store.path().to_string_lossy()),
        );
        self.emit(event);
    }

    fn emit_state(&mut self, kind: &str) {
        let mut event = self.base_event("relay/state");
        event.insert("kind".into(), json!(kind));
        event.insert(
            "stateFile".into(),
            json!(self.store.path().to_string_lossy()),
        );
        event.insert(
            "state".into(),
            serde_json::to_value(self.store.state()).unwrap_or(Value::Null),
        );
        self.emit(event);
    }

    fn emit_stats(&mut self, kind: &str) {
        let snapshot = self.stats_snapshot();
        let mut event = self.base_event("relay/stats");
        event.insert("kind".into(), json!(kind));
        event.insert("snapshot".into(), snapshot);
        self.emit(event);
    }

    fn stats_snapshot(&self) -> Value {
        let (sink_writes, sink_backpressure) = self.transport.outbox().sink_stats();
        json!({
            "startedAtMs": self.started_at_ms,
            "uptimeMs": now_ms() - self.started_at_ms,
            "ready": matches!(self.phase, Phase::Ready | Phase::Draining),
            "cwd": self.config.cwd.to_string_lossy(),
            "agentUserAgent": self.agent_user_agent,
            "stateFile": self.store.path().to_string_lossy(),
            "state": self.store.state(),
            "pendingControllerRequests": self.outbound.len(),
            "pendingAgentRequests": self.inbound.len(),
            "outQueueDepth": self.transport.depth(),
            "ioPaused": self.transport.is_paused(),
            "ioPauseReason": self.transport.pause_reason(),
            "agentPid": self.agent_pid,
            "stats": {
                "controllerLines": self.stats.controller_lines,
                "agentLines": self.stats.agent_lines,
                "controllerParseErrors": self.stats.controller_parse_errors,
                "agentParseErrors": self.stats.agent_parse_errors,
                "toAgentMessages": self.stats.to_agent_messages,
                "fromAgentMessages": self.stats.from_agent_messages,
                "autoApprovals": self.stats.auto_approvals,
                "forwardedAgentRequests": self.stats.forwarded_agent_requests,
                "sinkWrites": sink_writes,
                "sinkBackpressure": sink_backpressure,
                "ioPauses": self.transport.io_pauses,
                "ioResumes": self.transport.io_resumes,
                "outQueueHighWater": self.transport.high_water,
            },
        })
    }

    // ----- flow control -----

    fn pause_io(&mut self, kind: PauseKind, reason: String) {
        if self.transport.pause(kind, reason.clone()) {
            let mut event = self.base_event("relay/ioPaused");
            event.insert("reason".into(), json!(reason));
            self.emit(event);
        }
    }

    fn resume_io(&mut self, reason: &str) {
        if self.transport.resume() {
            let mut event = self.base_event("relay/ioResumed");
            event.insert("reason".into(), json!(reason));
            self.emit(event);
        }
    }

    fn on_drained(&mut self) {
        if self.transport.should_resume() {
            self.resume_io("outQueue drained");
        }
        if self.exit_plan.is_some() && self.transport.depth() == 0 {
            self.done = true;
        }
    }

    // ----- exit paths -----

    /// Record the requested exit, fail every pending entry, and defer the
    /// actual termination until the output queue drains or the hard
    /// deadline fires.
    fn request_exit(&mut self, code: i32, reason: &str) {
        if self.exit_plan.is_some() {
            return;
        }
        self.exit_plan = Some(ExitPlan {
            code,
            reason: reason.to_string(),
        });
        if self.phase != Phase::Draining {
            self.phase = Phase::Aborting;
        }

        let failure = format!("relay exiting: {}", reason);
        for (id, entry) in self.outbound.fail_all() {
            self.emit_error(
                &failure,
                &[
                    ("id", id.to_value()),
                    ("method", json!(entry.method)),
                    ("clientRequestId", json!(entry.client_request_id)),
                    ("internal", json!(entry.internal)),
                ],
            );
        }
        for (id, entry) in self.inbound.clear_all() {
            // No reply is owed to an exiting agent; record the drop only.
            self.emit_error(
                &failure,
                &[("id", id.to_value()), ("method", json!(entry.method))],
            );
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(EXIT_FLUSH_DEADLINE_MS)).await;
            let _ = tx.send(LoopEvent::ExitDeadline);
        });

        if self.transport.depth() == 0 {
            self.done = true;
        }
    }

    fn on_agent_exited(&mut self, exit: AgentExit) {
        self.agent_alive = false;
        self.agent_stdin = None;

        let mut event = self.base_event("relay/agentExit");
        event.insert("code".into(), json!(exit.code));
        event.insert("signal".into(), json!(exit.signal));
        self.emit(event);

        if self.exit_requested {
            self.request_exit(0, "client-exit");
        } else {
            self.request_exit(exit.code.unwrap_or(1), "agent-exit");
        }
    }

    fn on_signal(&mut self, name: &'static str) {
        let mut event = self.base_event("relay/signal");
        event.insert("signal".into(), json!(name));
        self.emit(event);

        #[cfg(unix)]
        if let Some(pid) = self.agent_pid.filter(|_| self.agent_alive) {
            let signal = if name == "SIGINT" {
                nix::sys::signal::Signal::SIGINT
            } else {
                nix::sys::signal::Signal::SIGTERM
            };
            signal_agent(pid, signal);
        }
    }

    fn kill_agent(&mut self, force: bool) {
        #[cfg(unix)]
        if let Some(pid) = self.agent_pid.filter(|_| self.agent_alive) {
            let signal = if force {
                nix::sys::signal::Signal::SIGKILL
            } else {
                nix::sys::signal::Signal::SIGTERM
            };
            signal_agent(pid, signal);
        }
        #[cfg(not(unix))]
        let _ = force;
    }

    // ----- handshake -----

    async fn start_handshake(&mut self) {
        self.phase = Phase::Handshaking;

        let mut capabilities = json!({ "experimentalApi": true });
        if !self.config.opt_out_notification_methods.is_empty() {
            capabilities["optOutNotificationMethods"] =
                json!(self.config.opt_out_notification_methods);
        }

        let id = self.alloc_id();
        let initialize = json!({
            "method": "initialize",
            "id": id.to_value(),
            "params": {
                "clientInfo": {
                    "name": self.config.client_name,
                    "title": self.config.client_title,
                    "version": self.config.client_version,
                },
                "capabilities": capabilities,
            },
        });

        let entry = OutboundEntry {
            client_request_id: Some("relay/initialize".to_string()),
            method: Some("initialize".to_string()),
            internal: true,
            thread_id_hint: None,
            turn_id_hint: None,
            item_id_hint: None,
        };
        if let Err(err) = self.outbound.insert(id.clone(), entry) {
            self.emit_error("Failed to register handshake request", &[("error", json!(err.to_string()))]);
            self.request_exit(1, "handshake-error");
            return;
        }

        self.send_to_agent(initialize, "handshake", None, None).await;

        if self.config.handshake_timeout_ms > 0 {
            let tx = self.tx.clone();
            let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(LoopEvent::HandshakeTimeout(id));
            });
        }
    }

    fn on_handshake_timeout(&mut self, id: RpcId) {
        // The entry is gone if the response won the race; nothing to do.
        if self.outbound.resolve(&id).is_none() {
            return;
        }
        self.emit_error(
            "Handshake failed: initialize timed out",
            &[("timeoutMs", json!(self.config.handshake_timeout_ms))],
        );
        self.request_exit(1, "handshake-timeout");
    }

    async fn on_handshake_response(&mut self, msg: &Value) {
        if let Some(error) = msg.get("error") {
            self.emit_error(
                "Handshake failed: initialize returned error",
                &[("error", error.clone())],
            );
            self.request_exit(1, "handshake-error");
            return;
        }

        if let Some(ua) = msg
            .get("result")
            .and_then(|r| r.get("userAgent"))
            .and_then(Value::as_str)
        {
            self.agent_user_agent = Some(ua.to_string());
        }

        self.send_to_agent(json!({ "method": "initialized" }), "handshake", None, None)
            .await;

        self.phase = Phase::Ready;
        let mut event = self.base_event("relay/ready");
        event.insert("agentPath".into(), json!(self.config.agent_path));
        event.insert("cwd".into(), json!(self.config.cwd.to_string_lossy()));
        event.insert(
            "stateFile".into(),
            json!(self.store.path().to_string_lossy()),
        );
        event.insert("agentPid".into(), json!(self.agent_pid));
        event.insert("agentUserAgent".into(), json!(self.agent_user_agent));
        self.emit(event);

        if self.config.heartbeat_ms > 0 {
            let tx = self.tx.clone();
            let interval = Duration::from_millis(self.config.heartbeat_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // consume the immediate first tick
                loop {
                    ticker.tick().await;
                    if tx.send(LoopEvent::Heartbeat).is_err() {
                        return;
                    }
                }
            });
        }

        // Replay input buffered while the handshake was in flight, in
        // original arrival order, before anything newly read.
        let buffered = std::mem::take(&mut self.buffered_input);
        for msg in buffered {
            self.handle_command(msg).await;
        }
    }

    // ----- controller input -----

    async fn on_controller_line(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        self.stats.controller_lines += 1;

        let msg: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                self.stats.controller_parse_errors += 1;
                self.emit_error(
                    "Failed to parse controller line",
                    &[("line", json!(line)), ("error", json!(err.to_string()))],
                );
                return;
            }
        };

        if matches!(self.phase, Phase::Starting | Phase::Handshaking) {
            self.buffered_input.push(msg);
            return;
        }

        self.handle_command(msg).await;
    }

    async fn handle_command(&mut self, msg: Value) {
        let Some(command) = msg.get("type").and_then(Value::as_str).map(str::to_string)
        else {
            self.emit_error(
                "Invalid relay command (expected object with type)",
                &[("msg", msg.clone())],
            );
            return;
        };

        match command.as_str() {
            "relay/exit" => self.on_exit_command(),
            "relay/state/get" => self.emit_state("get"),
            "relay/stats/get" => self.emit_stats("get"),
            "relay/request" => self.on_controller_request(msg).await,
            "relay/respond" => self.on_controller_respond(msg).await,
            "relay/send" => {
                if msg.get("msg").map(Value::is_object).unwrap_or(false) {
                    let raw = msg["msg"].clone();
                    self.send_to_agent(raw, "controllerRaw", None, None).await;
                } else {
                    self.emit_error("relay/send missing msg object", &[("msg", msg)]);
                }
            }
            other => {
                self.emit_error(
                    &format!("Unknown relay command type: {}", other),
                    &[("msg", msg.clone())],
                );
            }
        }
    }

    fn on_exit_command(&mut self) {
        let mut event = self.base_event("relay/exiting");
        event.insert("reason".into(), json!("controller"));
        self.emit(event);

        self.exit_requested = true;
        self.pause_io(PauseKind::Shutdown, "client-exit".to_string());

        if self.agent_alive {
            self.phase = Phase::Draining;
            self.kill_agent(false);
            if self.config.kill_timeout_ms > 0 {
                let tx = self.tx.clone();
                let timeout = Duration::from_millis(self.config.kill_timeout_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(LoopEvent::KillEscalation);
                });
            }
        } else {
            self.request_exit(0, "client-exit");
        }
    }

    async fn on_controller_request(&mut self, msg: Value) {
        let Some(method) = msg.get("method").and_then(Value::as_str).map(str::to_string)
        else {
            self.emit_error("relay/request missing method", &[("msg", msg)]);
            return;
        };

        let id = msg
            .get("id")
            .and_then(RpcId::from_value)
            .unwrap_or_else(|| self.alloc_id());
        let client_request_id = msg
            .get("clientRequestId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let params = apply_request_ergonomics(&method, msg.get("params").cloned());

        let (thread_id_hint, turn_id_hint, item_id_hint) = request_hints(params.as_ref());

        let entry = OutboundEntry {
            client_request_id: client_request_id.clone(),
            method: Some(method.clone()),
            internal: false,
            thread_id_hint,
            turn_id_hint,
            item_id_hint,
        };
        if self.outbound.insert(id.clone(), entry).is_err() {
            self.emit_error(
                "relay/request id is already pending",
                &[("id", id.to_value()), ("method", json!(method))],
            );
            return;
        }

        let mut request = Map::new();
        request.insert("method".into(), json!(method));
        request.insert("id".into(), id.to_value());
        if let Some(params) = params {
            request.insert("params".into(), params);
        }

        self.send_to_agent(
            Value::Object(request),
            "controllerRequest",
            None,
            client_request_id.as_deref(),
        )
        .await;
    }

    async fn on_controller_respond(&mut self, msg: Value) {
        let Some(id) = msg.get("id").and_then(RpcId::from_value) else {
            self.emit_error("relay/respond missing id", &[("msg", msg)]);
            return;
        };

        let has_result = msg.get("result").is_some();
        let has_error = msg.get("error").is_some();
        if !has_result && !has_error {
            self.emit_error("relay/respond must include result or error", &[("msg", msg)]);
            return;
        }

        let Some(method) = self.inbound.get(&id).map(|entry| entry.method.clone()) else {
            self.emit_error(
                "relay/respond id does not match a pending agent request",
                &[("id", id.to_value()), ("msg", msg)],
            );
            return;
        };

        if has_error {
            self.inbound.remove(&id);
            let reply = json!({ "id": id.to_value(), "error": msg["error"] });
            self.send_to_agent(reply, "controllerResponse", Some(&method), None)
                .await;
            return;
        }

        // Validate, then resolve: the entry is closed exactly once, whatever
        // the outcome of validation.
        let result = msg["result"].clone();
        match validate_forwarded_result(&method, &result) {
            Ok(()) => {
                self.inbound.remove(&id);
                let reply = json!({ "id": id.to_value(), "result": result });
                self.send_to_agent(reply, "controllerResponse", Some(&method), None)
                    .await;
            }
            Err(validation_error) => {
                self.inbound.remove(&id);
                self.emit_error(
                    "Invalid relay/respond payload for agent request",
                    &[
                        ("id", id.to_value()),
                        ("method", json!(method)),
                        ("validationError", json!(validation_error)),
                    ],
                );
                self.send_agent_error(
                    &id,
                    &method,
                    JSONRPC_INVALID_PARAMS,
                    &validation_error,
                    None,
                    "controllerResponseValidationError",
                )
                .await;
            }
        }
    }

    // ----- agent output -----

    async fn on_agent_line(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        self.stats.agent_lines += 1;

        let msg: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => {
                self.stats.agent_parse_errors += 1;
                let mut event = self.base_event("relay/fromAgent");
                event.insert("kind".into(), json!("nonJson"));
                event.insert("method".into(), Value::Null);
                event.insert("id".into(), Value::Null);
                event.insert("threadId".into(), Value::Null);
                event.insert("turnId".into(), Value::Null);
                event.insert("itemId".into(), Value::Null);
                event.insert("line".into(), json!(line));
                self.emit(event);
                return;
            }
        };

        self.stats.from_agent_messages += 1;
        let cls = classify(&msg);

        let mut request_method: Option<String> = None;
        let mut client_request_id: Option<String> = None;
        let mut internal = false;
        let mut hints = RoutingKeys::default();
        if cls.kind == MsgKind::Response {
            if let Some(id) = &cls.id {
                if let Some(entry) = self.outbound.resolve(id) {
                    request_method = entry.method;
                    client_request_id = entry.client_request_id;
                    internal = entry.internal;
                    hints = RoutingKeys {
                        thread_id: entry.thread_id_hint,
                        turn_id: entry.turn_id_hint,
                        item_id: entry.item_id_hint,
                    };
                }
            }
        }

        let mut routing = derive_routing_keys(&msg, request_method.as_deref());
        if routing.thread_id.is_none() {
            routing.thread_id = hints.thread_id;
        }
        if routing.turn_id.is_none() {
            routing.turn_id = hints.turn_id;
        }
        if routing.item_id.is_none() {
            routing.item_id = hints.item_id;
        }

        let mut event = self.base_event("relay/fromAgent");
        event.insert("kind".into(), json!(cls.kind.as_str()));
        event.insert("method".into(), json!(cls.method));
        event.insert(
            "id".into(),
            cls.id.as_ref().map(RpcId::to_value).unwrap_or(Value::Null),
        );
        event.insert("requestMethod".into(), json!(request_method));
        event.insert("clientRequestId".into(), json!(client_request_id));
        event.insert("internal".into(), json!(internal));
        event.insert("threadId".into(), json!(routing.thread_id));
        event.insert("turnId".into(), json!(routing.turn_id));
        event.insert("itemId".into(), json!(routing.item_id));
        event.insert("msg".into(), msg.clone());
        self.emit(event);

        if let Some(thread_id) = routing.thread_id.clone() {
            self.update_thread_id(&thread_id);
        }

        if internal && request_method.as_deref() == Some("initialize") {
            self.on_handshake_response(&msg).await;
        }

        if cls.kind == MsgKind::Request {
            if let (Some(method), Some(id)) = (cls.method, cls.id) {
                self.on_agent_request(&msg, method, id).await;
            }
        }
    }

    async fn on_agent_request(&mut self, msg: &Value, method: String, id: RpcId) {
        let params = msg
            .get("params")
            .filter(|p| p.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));

        match self.policy.dispose(&method, &params) {
            Disposition::AutoRespond { result } => {
                let reply = json!({ "id": id.to_value(), "result": result });
                self.send_to_agent(reply, "autoApproval", Some(&method), None)
                    .await;
                self.stats.auto_approvals += 1;
            }
            Disposition::RejectLegacy { message, data } => {
                self.emit_error(
                    "Deprecated agent request rejected (relay is v2-only)",
                    &[("id", id.to_value()), ("method", json!(method))],
                );
                self.send_agent_error(
                    &id,
                    &method,
                    JSONRPC_INVALID_PARAMS,
                    &message,
                    Some(data),
                    "legacyUnsupported",
                )
                .await;
            }
            Disposition::Forward => {
                let timeout_ms = self.config.agent_request_timeout_ms;
                self.inbound.insert(
                    id.clone(),
                    InboundEntry {
                        method: method.clone(),
                        params: params.clone(),
                        started_at: Instant::now(),
                    },
                );
                if timeout_ms > 0 {
                    let tx = self.tx.clone();
                    let timer_id = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                        let _ = tx.send(LoopEvent::InboundTimeout(timer_id));
                    });
                }
                self.stats.forwarded_agent_requests += 1;

                let mut event = self.base_event("relay/agentRequest");
                event.insert("method".into(), json!(method));
                event.insert("id".into(), id.to_value());
                event.insert("timeoutMs".into(), json!(timeout_ms));
                event.insert("threadId".into(), params["threadId"].clone());
                event.insert("turnId".into(), params["turnId"].clone());
                event.insert("itemId".into(), params["itemId"].clone());
                event.insert("msg".into(), msg.clone());
                self.emit(event);
            }
        }
    }

    async fn on_inbound_timeout(&mut self, id: RpcId) {
        // Already answered or bulk-failed: nothing left to resolve.
        let Some(entry) = self.inbound.remove(&id) else {
            return;
        };
        let timeout_ms = self.config.agent_request_timeout_ms;
        let elapsed_ms = entry.started_at.elapsed().as_millis() as u64;

        self.emit_error(
            "Timed out waiting for controller response",
            &[
                ("id", id.to_value()),
                ("method", json!(entry.method)),
                ("timeoutMs", json!(timeout_ms)),
            ],
        );

        let mut event = self.base_event("relay/agentRequestTimeout");
        event.insert("id".into(), id.to_value());
        event.insert("method".into(), json!(entry.method));
        event.insert("timeoutMs".into(), json!(timeout_ms));
        event.insert("elapsedMs".into(), json!(elapsed_ms));
        event.insert("threadId".into(), entry.params["threadId"].clone());
        event.insert("turnId".into(), entry.params["turnId"].clone());
        event.insert("itemId".into(), entry.params["itemId"].clone());
        self.emit(event);

        let message = format!(
            "Timed out waiting for controller response to {}",
            entry.method
        );
        self.send_agent_error(
            &id,
            &entry.method,
            JSONRPC_REQUEST_TIMEOUT,
            &message,
            None,
            "agentRequestTimeout",
        )
        .await;
    }

    // ----- agent output channel -----

    async fn send_agent_error(
        &mut self,
        id: &RpcId,
        method: &str,
        code: i32,
        message: &str,
        data: Option<Value>,
        reason: &str,
    ) {
        let mut error = Map::new();
        error.insert("code".into(), json!(code));
        error.insert("message".into(), json!(message));
        if let Some(data) = data {
            error.insert("data".into(), data);
        }
        let reply = json!({ "id": id.to_value(), "error": error });
        self.send_to_agent(reply, reason, Some(method), None).await;
    }

    /// Write one message to the agent's stdin and emit the matching
    /// `relay/toAgent` event. A write failure fails this send only.
    async fn send_to_agent(
        &mut self,
        msg: Value,
        reason: &str,
        request_method: Option<&str>,
        client_request_id: Option<&str>,
    ) {
        let mut line = msg.to_string();
        line.push('\n');

        let write_result = match self.agent_stdin.as_mut() {
            Some(stdin) => {
                let result = stdin.write_all(line.as_bytes()).await;
                if result.is_ok() {
                    let _ = stdin.flush().await;
                }
                result
            }
            None => {
                self.emit_error(
                    "agent app-server not running",
                    &[("reason", json!(reason)), ("msg", msg)],
                );
                return;
            }
        };

        if let Err(err) = write_result {
            self.emit_error(
                "Failed to write to agent stdin",
                &[("error", json!(err.to_string())), ("msg", msg)],
            );
            return;
        }

        self.stats.to_agent_messages += 1;

        let cls = classify(&msg);
        let routing = derive_routing_keys(&msg, None);
        let method = request_method
            .map(str::to_string)
            .or(cls.method);

        let mut event = self.base_event("relay/toAgent");
        event.insert("kind".into(), json!(cls.kind.as_str()));
        event.insert("method".into(), json!(method));
        event.insert(
            "id".into(),
            cls.id.as_ref().map(RpcId::to_value).unwrap_or(Value::Null),
        );
        event.insert("threadId".into(), json!(routing.thread_id));
        event.insert("turnId".into(), json!(routing.turn_id));
        event.insert("itemId".into(), json!(routing.item_id));
        event.insert("reason".into(), json!(reason));
        if let Some(tag) = client_request_id {
            event.insert("clientRequestId".into(), json!(tag));
        }
        event.insert("msg".into(), msg);
        self.emit(event);
    }

    // ----- routing state -----

    fn update_thread_id(&mut self, thread_id: &str) {
        match self.store.update_current_thread_id(thread_id) {
            Ok(true) => self.emit_state("updated"),
            Ok(false) => {}
            Err(err) => {
                self.emit_error(
                    "Failed to write state file",
                    &[("error", json!(err.to_string()))],
                );
            }
        }
    }

    fn alloc_id(&mut self) -> RpcId {
        let id = self.next_id;
        self.next_id += 1;
        RpcId::from(id)
    }
}

/// Best-effort wire ergonomics restored from the reference client:
/// `thread/start` requires `experimentalRawEvents`, and text inputs on
/// `turn/start`/`turn/steer` must carry `text_elements`.
fn apply_request_ergonomics(method: &str, params: Option<Value>) -> Option<Value> {
    let mut params = params;

    if method == "thread/start" {
        let mut obj = match params {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        obj.entry("experimentalRawEvents".to_string())
            .or_insert(Value::Bool(false));
        return Some(Value::Object(obj));
    }

    if method == "turn/start" || method == "turn/steer" {
        if let Some(Value::Object(map)) = params.as_mut() {
            if let Some(Value::Array(input)) = map.get_mut("input") {
                for item in input.iter_mut() {
                    let is_text = item.get("type").and_then(Value::as_str) == Some("text");
                    if is_text && item.get("text_elements").is_none() {
                        if let Some(obj) = item.as_object_mut() {
                            obj.insert("text_elements".to_string(), json!([]));
                        }
                    }
                }
            }
        }
    }

    params
}

fn request_hints(params: Option<&Value>) -> (Option<String>, Option<String>, Option<String>) {
    let Some(params) = params.filter(|p| p.is_object()) else {
        return (None, None, None);
    };

    let get = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let thread_id = get("threadId");
    let turn_id = get("turnId").or_else(|| get("expectedTurnId"));
    let item_id = get("itemId");
    (thread_id, turn_id, item_id)
}
