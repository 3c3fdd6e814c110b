//! relayd multiplexes a controller (our stdin/stdout) and an agent
//! `app-server` subprocess (its stdio) into a single ordered event log.
//!
//! Controller commands arrive as JSON lines on stdin; every observable
//! fact (relayed messages, lifecycle changes, errors, stats) leaves as a
//! `relay/*` event line on stdout.

pub mod approvals;
pub mod config;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
