use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use relayd::approvals::ApprovalDecision;
use relayd::config::{load_file_config, CliOverrides, RelayConfig};

#[derive(Parser, Debug)]
#[command(
    name = "relayd",
    about = "Relay between a JSON-lines controller and an agent app-server",
    version
)]
struct Cli {
    /// Agent binary, spawned as `<agent> app-server`.
    #[arg(long, env = "RELAYD_AGENT")]
    agent: Option<String>,

    /// Working directory for the agent process (default: current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Routing state file (default: per-workspace path under ~/.relay/state).
    #[arg(long, env = "RELAYD_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Optional TOML config file with a [relay] table.
    #[arg(long, env = "RELAYD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    client_name: Option<String>,

    #[arg(long)]
    client_title: Option<String>,

    #[arg(long)]
    client_version: Option<String>,

    /// Emit a stats heartbeat every N milliseconds (0 disables).
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Max buffered stdout events before input is paused (0 disables).
    #[arg(long)]
    max_out_queue: Option<usize>,

    /// SIGKILL the agent N milliseconds after a graceful exit request.
    #[arg(long)]
    kill_timeout_ms: Option<u64>,

    /// Fail forwarded agent requests after N milliseconds without a
    /// controller answer (0 waits forever).
    #[arg(long)]
    agent_request_timeout_ms: Option<u64>,

    /// Answer for command execution approval requests.
    #[arg(long, value_enum)]
    exec_approval: Option<ApprovalDecision>,

    /// Answer for file change approval requests.
    #[arg(long, value_enum)]
    file_approval: Option<ApprovalDecision>,

    /// Decline all approvals, regardless of other approval flags.
    #[arg(long)]
    read_only: bool,

    /// Notification method to opt out of during the handshake (repeatable).
    #[arg(long = "opt-out-notification-method", value_name = "METHOD")]
    opt_out_notification_method: Vec<String>,

    /// Verbose diagnostics on stderr.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "relayd=debug" } else { "relayd=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // stdout carries the event log; diagnostics go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let file = load_file_config(cli.config.as_deref())?;
    let overrides = CliOverrides {
        agent: cli.agent,
        cwd: cli.cwd,
        state_file: cli.state_file,
        client_name: cli.client_name,
        client_title: cli.client_title,
        client_version: cli.client_version,
        heartbeat_ms: cli.heartbeat_ms,
        max_out_queue: cli.max_out_queue,
        kill_timeout_ms: cli.kill_timeout_ms,
        agent_request_timeout_ms: cli.agent_request_timeout_ms,
        exec_approval: cli.exec_approval,
        file_approval: cli.file_approval,
        read_only: cli.read_only,
        opt_out_notification_methods: cli.opt_out_notification_method,
    };
    let config = RelayConfig::resolve(overrides, file)?;

    let code = relayd::session::run(config).await;
    std::process::exit(code);
}
