//! Job orchestration: workspace → source file → (translate) → sandboxed run
//! streamed through a bridge → workspace release.

use crate::bridge::{Bridge, Terminal};
use crate::config::{Config, C_SOURCE_FILE, LU_SOURCE_FILE};
use crate::isolation;
use crate::registry::SessionRegistry;
use crate::sandbox::{self, InputSetup, InputSink, OutputSink};
use crate::translate::translate;
use crate::workspace::{SessionKey, WorkspaceError, WorkspaceManager};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    C,
    Lu,
}

impl Language {
    fn source_file(self) -> &'static str {
        match self {
            Language::C => C_SOURCE_FILE,
            Language::Lu => LU_SOURCE_FILE,
        }
    }
}

/// A validated job request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub input: String,
    pub args: Vec<String>,
    pub language: Language,
}

impl Submission {
    pub fn c(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            args: Vec::new(),
            language: Language::C,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Forwards process output into the session bridge.
struct BridgeSink(Arc<Bridge>);

impl OutputSink for BridgeSink {
    fn on_stdout(&mut self, chunk: &[u8]) {
        self.0.deliver_output(chunk);
    }

    fn on_stderr(&mut self, chunk: &[u8]) {
        self.0.deliver_output(chunk);
    }
}

#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    workspaces: WorkspaceManager,
    registry: SessionRegistry,
}

impl Pipeline {
    pub fn new(config: Config, registry: SessionRegistry) -> Arc<Self> {
        let workspaces = WorkspaceManager::new(&config.scratch_root);
        Arc::new(Self {
            config,
            workspaces,
            registry,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Clears leftovers of a previous process. Run before accepting jobs.
    pub async fn startup(&self) {
        self.workspaces.startup_purge().await;
    }

    /// Accepts a job and starts it in the background. The returned key is the
    /// token a client presents to attach to the session.
    pub async fn submit(self: &Arc<Self>, submission: Submission) -> Result<SessionKey, SubmitError> {
        if submission.input.is_empty() {
            return Err(SubmitError::Validation(
                "input must be a non-empty string".to_string(),
            ));
        }

        let key = self.workspaces.allocate().await?;
        let source = submission.language.source_file();
        if let Err(e) = self
            .workspaces
            .write_file(&key, source, submission.input.as_bytes())
            .await
        {
            self.release(&key).await;
            return Err(e.into());
        }

        let registry = self.registry.clone();
        let closed_key = key.clone();
        let bridge = Bridge::new(
            key.clone(),
            (&self.config.limits).into(),
            Box::new(move |_| {
                registry.remove(&closed_key);
            }),
        );
        self.registry.register(key.clone(), bridge.clone());
        info!(key = %key, language = ?submission.language, args = ?submission.args,
              live_sessions = self.registry.len(), "Created session");

        let pipeline = Arc::clone(self);
        let job_key = key.clone();
        tokio::spawn(async move {
            pipeline.execute(&job_key, &submission, &bridge).await;
        });
        Ok(key)
    }

    async fn execute(&self, key: &SessionKey, submission: &Submission, bridge: &Arc<Bridge>) {
        let terminal = self.build_and_run(key, submission, bridge).await;
        bridge.finish(terminal);
        self.release(key).await;
    }

    async fn build_and_run(
        &self,
        key: &SessionKey,
        submission: &Submission,
        bridge: &Arc<Bridge>,
    ) -> Terminal {
        let workdir = match self.workspaces.dir_for(key) {
            Ok(dir) => dir,
            Err(e) => return Terminal::Errored(e.to_string()),
        };

        if submission.language == Language::Lu {
            let limits = &self.config.limits;
            match translate(
                &self.config.lu_root,
                &workdir,
                LU_SOURCE_FILE,
                C_SOURCE_FILE,
                limits.build_timeout,
            )
            .await
            {
                Ok(translation) if translation.success() => {}
                Ok(translation) => return Terminal::Errored(translation.diagnostic()),
                Err(e) => return Terminal::Errored(e.to_string()),
            }
        }

        let (spec, terminator) = isolation::prepare(
            &self.config.isolation,
            &self.config.toolchain,
            &self.config.limits,
            key,
            &workdir,
            &submission.args,
        );
        let mut sink = BridgeSink(bridge.clone());
        let stdin_bridge = bridge.clone();
        let setup: InputSetup = Box::new(move |input: InputSink| stdin_bridge.set_input_sink(input));

        let result = sandbox::run(&spec, terminator.as_ref(), &mut sink, Some(setup)).await;
        if let Err(sandbox::RunError::Termination { .. }) = &result {
            error!(key = %key, "Sandbox for session could not be terminated");
        }
        Terminal::from(result)
    }

    async fn release(&self, key: &SessionKey) {
        if let Err(e) = self.workspaces.release(key).await {
            error!(key = %key, error = %e, "Failed to release workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Frame, Transport};
    use crate::config::{Isolation, Limits, Toolchain};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn pipeline(scratch: &std::path::Path, script: &str, limits: Limits) -> Arc<Pipeline> {
        let config = Config {
            scratch_root: scratch.join("root"),
            lu_root: scratch.join("no-translator"),
            isolation: Isolation::Host,
            toolchain: Toolchain {
                script: script.to_string(),
            },
            limits: Limits {
                memory_bytes: 1 << 30,
                ..limits
            },
        };
        Pipeline::new(config, SessionRegistry::new())
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Frame>) -> String {
        let mut data = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Data(bytes) => data.extend(bytes),
                    Frame::Close => break,
                }
            }
        })
        .await
        .unwrap();
        String::from_utf8(data).unwrap()
    }

    async fn wait_released(pipeline: &Pipeline) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while pipeline.workspaces().live_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn runs_submission_and_streams_to_attached_client() {
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = pipeline(scratch.path(), "cat main.c; exit 3", Limits::default());

        let key = pipeline.submit(Submission::c("hello source")).await.unwrap();
        let bridge = pipeline.registry().lookup(&key).unwrap();
        let (transport, rx) = Transport::channel();
        bridge.attach(transport);

        assert_eq!(
            collect(rx).await,
            "hello source\n[process exited with code 3]\n"
        );
        wait_released(&pipeline).await;
        assert!(pipeline.registry().lookup(&key).is_none());
        assert!(!scratch.path().join("root").join(key.as_str()).exists());
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_a_session() {
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = pipeline(scratch.path(), "true", Limits::default());
        let err = pipeline.submit(Submission::c("")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert!(pipeline.registry().is_empty());
        assert_eq!(pipeline.workspaces().live_count(), 0);
    }

    #[tokio::test]
    async fn timeout_yields_abort_notice() {
        let scratch = tempfile::tempdir().unwrap();
        let limits = Limits {
            run_timeout: Duration::from_millis(300),
            ..Limits::default()
        };
        let pipeline = pipeline(scratch.path(), "while :; do :; done", limits);

        let key = pipeline.submit(Submission::c("loop")).await.unwrap();
        let (transport, rx) = Transport::channel();
        pipeline.registry().lookup(&key).unwrap().attach(transport);

        assert_eq!(collect(rx).await, "\n[process was aborted]\n");
        wait_released(&pipeline).await;
    }

    #[tokio::test]
    async fn client_input_reaches_the_program() {
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = pipeline(scratch.path(), "read line; echo \"got $line\"", Limits::default());

        let key = pipeline.submit(Submission::c("interactive")).await.unwrap();
        let bridge = pipeline.registry().lookup(&key).unwrap();
        let (transport, rx) = Transport::channel();
        bridge.attach(transport);
        bridge.deliver_input(b"hi\n");

        assert_eq!(collect(rx).await, "got hi\n\n[process exited with code 0]\n");
    }

    #[tokio::test]
    async fn user_args_are_passed_through() {
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = pipeline(scratch.path(), "echo \"$#:$1\"", Limits::default());

        let submission = Submission {
            args: vec!["one two".into()],
            ..Submission::c("x")
        };
        let key = pipeline.submit(submission).await.unwrap();
        let (transport, rx) = Transport::channel();
        pipeline.registry().lookup(&key).unwrap().attach(transport);

        assert_eq!(collect(rx).await, "1:one two\n\n[process exited with code 0]\n");
    }

    #[tokio::test]
    async fn failed_translation_is_reported_and_program_never_runs() {
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = pipeline(scratch.path(), "echo should-not-run", Limits::default());

        let submission = Submission {
            language: Language::Lu,
            ..Submission::c("let x = 1")
        };
        let key = pipeline.submit(submission).await.unwrap();
        let (transport, rx) = Transport::channel();
        pipeline.registry().lookup(&key).unwrap().attach(transport);

        let output = collect(rx).await;
        assert!(output.starts_with("\n[run failed]: "), "{output}");
        assert!(!output.contains("should-not-run"));
    }

    #[tokio::test]
    async fn unattached_session_still_releases_its_workspace() {
        let scratch = tempfile::tempdir().unwrap();
        let limits = Limits {
            grace_window: Duration::from_millis(100),
            ..Limits::default()
        };
        let pipeline = pipeline(scratch.path(), "echo nobody listens", limits);

        let key = pipeline.submit(Submission::c("x")).await.unwrap();
        wait_released(&pipeline).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.registry().lookup(&key).is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}
