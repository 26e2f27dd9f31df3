//! Service configuration and per-session limits.

use std::path::PathBuf;
use std::time::Duration;

/// Per-session resource limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Wall-clock limit for building and running the submission.
    pub run_timeout: Duration,
    /// Wall-clock limit for the translation step.
    pub build_timeout: Duration,
    /// Memory ceiling handed to the isolation layer, in bytes.
    pub memory_bytes: u64,
    /// Open file descriptor ceiling for the sandboxed process.
    pub open_files: u64,
    /// Maximum bytes a client may send to the process.
    pub input_cap: usize,
    /// Maximum bytes the process may produce.
    pub output_cap: usize,
    /// How long a finished session waits for a late client.
    pub grace_window: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(30),
            build_timeout: Duration::from_secs(10),
            memory_bytes: 64 * 1024 * 1024,
            open_files: 256,
            input_cap: 1024 * 1024,
            output_cap: 1024 * 1024,
            grace_window: Duration::from_secs(60),
        }
    }
}

/// Where the submitted program runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Disposable container per session, named after the session key.
    Container { image: String },
    /// Plain child process with rlimits. Does not restrict the filesystem view.
    Host,
}

impl Default for Isolation {
    fn default() -> Self {
        Isolation::Container {
            image: "gcc:latest".to_string(),
        }
    }
}

/// Shell script run inside the workspace to build and start the program.
///
/// User arguments are appended as positional parameters, so the script
/// refers to them as `"$@"`.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub script: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            script: format!(
                "cc -O2 -std=c99 -pedantic {} -o main && exec stdbuf -oL ./main \"$@\"",
                C_SOURCE_FILE
            ),
        }
    }
}

/// File the (possibly translated) C source lives in.
pub const C_SOURCE_FILE: &str = "main.c";
/// File a Lu submission is written to before translation.
pub const LU_SOURCE_FILE: &str = "main.lu";

#[derive(Debug, Clone)]
pub struct Config {
    pub scratch_root: PathBuf,
    pub lu_root: PathBuf,
    pub isolation: Isolation,
    pub toolchain: Toolchain,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            lu_root: PathBuf::from("./lu-lang-py"),
            isolation: Isolation::default(),
            toolchain: Toolchain::default(),
            limits: Limits::default(),
        }
    }
}

/// `<tmpdir>/lu-lang-editor-service`, canonicalized when possible.
pub fn default_scratch_root() -> PathBuf {
    let tmp = std::env::temp_dir();
    let tmp = tmp.canonicalize().unwrap_or(tmp);
    tmp.join("lu-lang-editor-service")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_toolchain_forwards_positional_args() {
        let script = Toolchain::default().script;
        assert!(script.contains("main.c"));
        assert!(script.ends_with("\"$@\""));
    }

    #[test]
    fn default_limits_match_service_constants() {
        let limits = Limits::default();
        assert_eq!(limits.run_timeout, Duration::from_secs(30));
        assert_eq!(limits.build_timeout, Duration::from_secs(10));
        assert_eq!(limits.input_cap, 1 << 20);
        assert_eq!(limits.output_cap, 1 << 20);
        assert_eq!(limits.grace_window, Duration::from_secs(60));
        assert_eq!(limits.open_files, 256);
    }

    #[test]
    fn scratch_root_is_named_after_service() {
        assert!(default_scratch_root().ends_with("lu-lang-editor-service"));
    }
}
