//! Runtime configuration: defaults, optional TOML file, CLI overrides.
//!
//! Precedence is CLI > file > built-in default, resolved once at startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::approvals::ApprovalDecision;
use crate::transport::DEFAULT_MAX_OUT_QUEUE;

pub const DEFAULT_AGENT_PATH: &str = "agent";
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_AGENT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Agent binary; spawned as `<agent_path> app-server` with piped stdio.
    pub agent_path: String,
    pub cwd: PathBuf,
    pub state_file: PathBuf,
    pub client_name: String,
    pub client_title: String,
    pub client_version: String,
    /// Emit a stats heartbeat every N ms (0 disables).
    pub heartbeat_ms: u64,
    /// Max buffered stdout events before pausing inputs (0 disables).
    pub max_out_queue: usize,
    /// After a graceful exit request, SIGKILL the agent after N ms (0 disables).
    pub kill_timeout_ms: u64,
    /// Fail forwarded agent requests with no controller answer after N ms
    /// (0 waits forever).
    pub agent_request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Initialize capability: notification methods to suppress.
    pub opt_out_notification_methods: Vec<String>,
    pub exec_approval: ApprovalDecision,
    pub file_approval: ApprovalDecision,
}

/// Options collected by the binary's argument parser; `None` means the flag
/// was not given.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub agent: Option<String>,
    pub cwd: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub client_name: Option<String>,
    pub client_title: Option<String>,
    pub client_version: Option<String>,
    pub heartbeat_ms: Option<u64>,
    pub max_out_queue: Option<usize>,
    pub kill_timeout_ms: Option<u64>,
    pub agent_request_timeout_ms: Option<u64>,
    pub exec_approval: Option<ApprovalDecision>,
    pub file_approval: Option<ApprovalDecision>,
    pub read_only: bool,
    pub opt_out_notification_methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub agent: Option<String>,
    pub state_file: Option<PathBuf>,
    pub client_name: Option<String>,
    pub client_title: Option<String>,
    pub client_version: Option<String>,
    pub heartbeat_ms: Option<u64>,
    pub max_out_queue: Option<usize>,
    pub kill_timeout_ms: Option<u64>,
    pub agent_request_timeout_ms: Option<u64>,
    pub exec_approval: Option<ApprovalDecision>,
    pub file_approval: Option<ApprovalDecision>,
    #[serde(default)]
    pub opt_out_notification_methods: Vec<String>,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    relay: Option<FileConfig>,
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read relay config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(parsed.relay)
}

impl RelayConfig {
    pub fn resolve(cli: CliOverrides, file: Option<FileConfig>) -> Result<RelayConfig> {
        let file = file.unwrap_or_default();

        let cwd = match cli.cwd {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to resolve working directory")?,
        };

        let state_file = cli
            .state_file
            .or(file.state_file)
            .map(|p| absolutize(&cwd, p))
            .unwrap_or_else(|| default_state_file_for_workspace(&cwd));

        let mut exec_approval = cli
            .exec_approval
            .or(file.exec_approval)
            .unwrap_or(ApprovalDecision::Auto);
        let mut file_approval = cli
            .file_approval
            .or(file.file_approval)
            .unwrap_or(ApprovalDecision::Auto);
        if cli.read_only {
            exec_approval = ApprovalDecision::Decline;
            file_approval = ApprovalDecision::Decline;
        }

        let mut opt_out = file.opt_out_notification_methods;
        opt_out.extend(cli.opt_out_notification_methods);
        opt_out.sort();
        opt_out.dedup();

        Ok(RelayConfig {
            agent_path: cli
                .agent
                .or(file.agent)
                .unwrap_or_else(|| DEFAULT_AGENT_PATH.to_string()),
            cwd,
            state_file,
            client_name: cli
                .client_name
                .or(file.client_name)
                .unwrap_or_else(|| "relay".to_string()),
            client_title: cli
                .client_title
                .or(file.client_title)
                .unwrap_or_else(|| "relay broker".to_string()),
            client_version: cli
                .client_version
                .or(file.client_version)
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            heartbeat_ms: cli.heartbeat_ms.or(file.heartbeat_ms).unwrap_or(0),
            max_out_queue: cli
                .max_out_queue
                .or(file.max_out_queue)
                .unwrap_or(DEFAULT_MAX_OUT_QUEUE),
            kill_timeout_ms: cli
                .kill_timeout_ms
                .or(file.kill_timeout_ms)
                .unwrap_or(DEFAULT_KILL_TIMEOUT_MS),
            agent_request_timeout_ms: cli
                .agent_request_timeout_ms
                .or(file.agent_request_timeout_ms)
                .unwrap_or(DEFAULT_AGENT_REQUEST_TIMEOUT_MS),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            opt_out_notification_methods: opt_out,
            exec_approval,
            file_approval,
        })
    }
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Deterministic per-workspace state path so distinct workspaces never
/// collide: `~/.relay/state/<sha256(workspace)[..16]>.json`.
pub fn default_state_file_for_workspace(workspace: &Path) -> PathBuf {
    let normalized = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(normalized.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());

    home_dir()
        .join(".relay")
        .join("state")
        .join(format!("{}.json", &digest[..16]))
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_when_nothing_is_given() {
        let cfg = RelayConfig::resolve(CliOverrides::default(), None).expect("resolve");
        assert_eq!(cfg.agent_path, "agent");
        assert_eq!(cfg.heartbeat_ms, 0);
        assert_eq!(cfg.max_out_queue, DEFAULT_MAX_OUT_QUEUE);
        assert_eq!(cfg.kill_timeout_ms, 2_000);
        assert_eq!(cfg.agent_request_timeout_ms, 30_000);
        assert_eq!(cfg.exec_approval, ApprovalDecision::Auto);
        assert_eq!(cfg.file_approval, ApprovalDecision::Auto);
    }

    #[test]
    fn cli_beats_file_beats_default() {
        let file = FileConfig {
            agent: Some("file-agent".into()),
            heartbeat_ms: Some(500),
            max_out_queue: Some(10),
            ..FileConfig::default()
        };
        let cli = CliOverrides {
            agent: Some("cli-agent".into()),
            ..CliOverrides::default()
        };

        let cfg = RelayConfig::resolve(cli, Some(file)).expect("resolve");
        assert_eq!(cfg.agent_path, "cli-agent");
        assert_eq!(cfg.heartbeat_ms, 500);
        assert_eq!(cfg.max_out_queue, 10);
    }

    #[test]
    fn read_only_forces_both_approvals_to_decline() {
        let cli = CliOverrides {
            exec_approval: Some(ApprovalDecision::Accept),
            read_only: true,
            ..CliOverrides::default()
        };
        let cfg = RelayConfig::resolve(cli, None).expect("resolve");
        assert_eq!(cfg.exec_approval, ApprovalDecision::Decline);
        assert_eq!(cfg.file_approval, ApprovalDecision::Decline);
    }

    #[test]
    fn workspace_hash_paths_are_stable_and_distinct() {
        let a = tempdir().expect("tempdir");
        let b = tempdir().expect("tempdir");

        let path_a = default_state_file_for_workspace(a.path());
        let path_a2 = default_state_file_for_workspace(a.path());
        let path_b = default_state_file_for_workspace(b.path());

        assert_eq!(path_a, path_a2);
        assert_ne!(path_a, path_b);
        assert!(path_a.to_string_lossy().ends_with(".json"));
    }

    #[test]
    fn relative_state_file_is_resolved_against_cwd() {
        let dir = tempdir().expect("tempdir");
        let cli = CliOverrides {
            cwd: Some(dir.path().to_path_buf()),
            state_file: Some(PathBuf::from("relay-state.json")),
            ..CliOverrides::default()
        };
        let cfg = RelayConfig::resolve(cli, None).expect("resolve");
        assert_eq!(cfg.state_file, dir.path().join("relay-state.json"));
    }

    #[test]
    fn file_config_parses_from_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("relay.toml");
        fs::write(
            &path,
            r#"
[relay]
agent = "/usr/local/bin/agent"
heartbeat_ms = 1000
exec_approval = "decline"
opt_out_notification_methods = ["turn/delta"]
"#,
        )
        .unwrap();

        let cfg = load_file_config(Some(&path)).expect("load").expect("some");
        assert_eq!(cfg.agent.as_deref(), Some("/usr/local/bin/agent"));
        assert_eq!(cfg.heartbeat_ms, Some(1000));
        assert_eq!(cfg.exec_approval, Some(ApprovalDecision::Decline));
        assert_eq!(cfg.opt_out_notification_methods, vec!["turn/delta"]);

        assert!(load_file_config(Some(&dir.path().join("missing.toml")))
            .expect("load")
            .is_none());
        assert!(load_file_config(None).expect("load").is_none());
    }
}
