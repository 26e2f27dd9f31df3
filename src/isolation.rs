//! Launch recipes for the two isolation backends and their kill strategies.

use crate::config::{Isolation, Limits, Toolchain};
use crate::sandbox::{RunSpec, Terminator};
use crate::workspace::SessionKey;
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

/// Mount point of the workspace inside the container.
const CONTAINER_WORKDIR: &str = "/app";
/// Seconds docker waits between SIGTERM and SIGKILL on stop.
const CONTAINER_STOP_TIMEOUT: &str = "5";

/// Kills the child by signal. Targets the whole process group when the
/// child leads one, so compiled programs started by the shell die too.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator {
    pub process_group: bool,
}

#[async_trait]
impl Terminator for SignalTerminator {
    async fn terminate(&self, child: &mut Child) -> io::Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };
        if self.process_group {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            child.start_kill()
        }
    }
}

/// Kills the container by name. Killing the `docker run` client alone does
/// not stop the container.
#[derive(Debug, Clone)]
pub struct ContainerTerminator {
    pub name: String,
}

#[async_trait]
impl Terminator for ContainerTerminator {
    async fn terminate(&self, _child: &mut Child) -> io::Result<()> {
        info!(container = %self.name, "Killing container");
        let output = Command::new("docker")
            .args(["kill", &self.name])
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "docker kill {} exited with {}: {}",
                self.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Builds the launch spec and matching terminator for the toolchain script.
pub fn prepare(
    isolation: &Isolation,
    toolchain: &Toolchain,
    limits: &Limits,
    key: &SessionKey,
    workdir: &Path,
    user_args: &[String],
) -> (RunSpec, Box<dyn Terminator>) {
    match isolation {
        Isolation::Container { image } => {
            let memory = format!("{}b", limits.memory_bytes);
            let volume = format!("{}/:{}/", workdir.display(), CONTAINER_WORKDIR);
            let nofile = format!("nofile={0}:{0}", limits.open_files);
            let mut args: Vec<String> = vec![
                "run".into(),
                "-i".into(),
                "--name".into(),
                key.to_string(),
                "--stop-timeout".into(),
                CONTAINER_STOP_TIMEOUT.into(),
                "-m".into(),
                memory.clone(),
                "--memory-swap".into(),
                memory,
                "--ulimit".into(),
                nofile,
                "--network".into(),
                "none".into(),
                "--rm".into(),
                "--pull".into(),
                "missing".into(),
                "--quiet".into(),
                "-v".into(),
                volume,
                "-w".into(),
                CONTAINER_WORKDIR.into(),
                image.clone(),
            ];
            args.extend(shell_args(toolchain, user_args));
            let spec = RunSpec::new("docker", workdir, limits.run_timeout).args(args);
            let terminator = ContainerTerminator {
                name: key.to_string(),
            };
            (spec, Box::new(terminator))
        }
        Isolation::Host => {
            let mut spec =
                RunSpec::new("sh", workdir, limits.run_timeout).args(&shell_args(toolchain, user_args)[1..]);
            spec.rlimit_as = Some(limits.memory_bytes);
            spec.rlimit_nofile = Some(limits.open_files);
            spec.own_process_group = true;
            let terminator = SignalTerminator {
                process_group: true,
            };
            (spec, Box::new(terminator))
        }
    }
}

/// `sh -c <script> sh <args...>`: user arguments become `$1..`, never shell text.
fn shell_args(toolchain: &Toolchain, user_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "sh".to_string(),
        "-c".to_string(),
        toolchain.script.clone(),
        "sh".to_string(),
    ];
    args.extend(user_args.iter().cloned());
    args
}
