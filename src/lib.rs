//! lu-runner - compile-and-run service with sandboxed, interactive sessions.
//!
//! A job submitted over HTTP gets a workspace and a session key; the program
//! is built and run in the background inside the configured isolation layer,
//! and a websocket presenting the key is bridged to the process's stdio.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod bridge;
pub mod config;
pub mod http_server;
pub mod isolation;
pub mod pipeline;
pub mod registry;
pub mod sandbox;
pub mod state;
pub mod translate;
pub mod transport;
pub mod workspace;

pub use bridge::{Bridge, Terminal};
pub use config::{Config, Isolation, Limits, Toolchain};
pub use pipeline::{Language, Pipeline, Submission};
pub use registry::SessionRegistry;
pub use state::AppState;
pub use workspace::{SessionKey, WorkspaceManager};
