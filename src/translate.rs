//! Lu-to-C translation through the external translator script.

use crate::isolation::SignalTerminator;
use crate::sandbox::{run_collect, RunError, RunOutcome, RunSpec};
use std::path::Path;
use std::time::Duration;

/// Result of one translator invocation.
#[derive(Debug, Clone)]
pub struct Translation {
    pub outcome: RunOutcome,
    /// stdout and stderr interleaved; the diagnostic on failure.
    pub output: String,
}

impl Translation {
    pub fn success(&self) -> bool {
        self.outcome == RunOutcome::Exited(0)
    }

    /// Human-readable reason for a failed translation.
    pub fn diagnostic(&self) -> String {
        match self.outcome {
            RunOutcome::TimedOut => format!("translation timed out\n{}", self.output),
            RunOutcome::Exited(code) => format!("translation exited with code {}\n{}", code, self.output),
        }
    }
}

/// Runs `python3 <lu_root>/src/main.py --input <input> --output <output>`
/// with `workdir` as the current directory. File names are relative to it.
pub async fn translate(
    lu_root: &Path,
    workdir: &Path,
    input: &str,
    output: &str,
    time_limit: Duration,
) -> Result<Translation, RunError> {
    let script = lu_root.join("src").join("main.py");
    let script = script.canonicalize().unwrap_or(script);
    let spec = RunSpec::new("python3", workdir, time_limit).args([
        script.display().to_string(),
        "--input".to_string(),
        input.to_string(),
        "--output".to_string(),
        output.to_string(),
    ]);
    translate_with(&spec).await
}

async fn translate_with(spec: &RunSpec) -> Result<Translation, RunError> {
    let (outcome, output) = run_collect(spec, &SignalTerminator::default()).await?;
    Ok(Translation {
        outcome,
        output: String::from_utf8_lossy(&output).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_translator_yields_its_output_as_diagnostic() {
        let spec = RunSpec::new("sh", std::env::temp_dir(), Duration::from_secs(5))
            .args(["-c", "echo 'syntax error on line 1' >&2; exit 2"]);
        let translation = translate_with(&spec).await.unwrap();
        assert!(!translation.success());
        assert_eq!(translation.outcome, RunOutcome::Exited(2));
        let diagnostic = translation.diagnostic();
        assert!(diagnostic.contains("code 2"));
        assert!(diagnostic.contains("syntax error on line 1"));
    }

    #[tokio::test]
    async fn missing_translator_root_surfaces_nonzero_exit() {
        let scratch = tempfile::tempdir().unwrap();
        match translate(
            &scratch.path().join("missing"),
            scratch.path(),
            "main.lu",
            "main.c",
            Duration::from_secs(5),
        )
        .await
        {
            // python3 present: it fails to open the script.
            Ok(translation) => assert!(!translation.success()),
            // python3 absent: launch failure.
            Err(e) => assert!(matches!(e, RunError::Launch { .. })),
        }
    }
}
