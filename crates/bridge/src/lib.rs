//! # TermBridge
//!
//! A WebSocket-to-PTY session bridge: gives a browser terminal pane the
//! illusion of a local shell. Each accepted connection gets its own shell
//! process in a pseudo-terminal; keystrokes flow in, filtered output flows
//! back in near-real time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   WebSocket accept layer                   │
//! │        (one task per connection, contract-only glue)       │
//! ├────────────────────────────────────────────────────────────┤
//! │                      Session Bridge                        │
//! │   on_connect ──► spawn shell, start output pump, banner    │
//! │   on_message ──► shell stdin (silent drop after exit)      │
//! │   on_disconnect ─► idempotent teardown                     │
//! │                                                            │
//! │   output pump: blocking read ─► lossy decode ─► filter     │
//! │                ─► forward, in order, one chunk at a time   │
//! ├──────────────────────────┬─────────────────────────────────┤
//! │    PTY process manager   │    control-sequence filter      │
//! └──────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and the per-session shell resolver
//! - [`pty`]: One shell process attached to a pseudo-terminal
//! - [`filter`]: Stripping of terminal control sequences
//! - [`bridge`]: Per-connection session lifecycle and the output pump
//! - [`server`]: WebSocket accept loop

pub mod bridge;
pub mod config;
pub mod filter;
pub mod pty;
pub mod server;

// Re-export config types for convenience
pub use config::{Config, ConfigError, EnvShellSource, ShellCommandSource};

// Re-export bridge types for convenience
pub use bridge::{ClientSink, Payload, SessionBridge};

// Re-export PTY types for convenience
pub use pty::{PtyError, ShellProcess, TerminalSize};

// Re-export filter for convenience
pub use filter::strip_control_sequences;

// Re-export server types for convenience
pub use server::Server;
