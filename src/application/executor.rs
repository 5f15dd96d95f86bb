use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::registry::CommandTemplate;

/// Why a command produced no usable stdout. Every variant's `Display` text is
/// the exact message forwarded to the model, so it must stand on its own.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("argument rejected: {reason}")]
    Rejected { reason: String },
    #[error("failed to run '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{output}")]
    CommandFailed { status: Option<i32>, output: String },
    #[error("command timed out after {}s", limit.as_secs())]
    TimedOut { limit: Duration },
}

impl ExecutionFailure {
    fn rejected(reason: impl Into<String>) -> Self {
        ExecutionFailure::Rejected {
            reason: reason.into(),
        }
    }
}

/// Runs one external command per tool call. All outcomes come back as
/// values; nothing escapes this boundary as a panic or transport error,
/// because the model must receive some text to reason about even when the
/// device command fails.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    limit: Duration,
}

impl CommandExecutor {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// Resolves the template with the optional argument, spawns the argv,
    /// and captures stdout. No shell is involved and the command is never
    /// retried; a failed device toggle must not be silently repeated.
    pub async fn execute(
        &self,
        template: &CommandTemplate,
        argument: Option<&str>,
    ) -> Result<String, ExecutionFailure> {
        if let Some(argument) = argument {
            validate_argument(argument)?;
        }
        let args = template
            .resolve(argument)
            .ok_or_else(|| ExecutionFailure::rejected("template slot left unfilled"))?;
        let program = template.program().to_string();

        debug!(program = %program, ?args, "Spawning tool command");
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionFailure::Io {
                program: program.clone(),
                source,
            })?;

        let output = timeout(self.limit, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(program = %program, limit_secs = self.limit.as_secs(), "Tool command timed out");
                ExecutionFailure::TimedOut { limit: self.limit }
            })?
            .map_err(|source| ExecutionFailure::Io {
                program: program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let status = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        // Best-available text wins: stdout, then stderr, then the exit status.
        let text = if !stdout.is_empty() {
            stdout
        } else if !stderr.is_empty() {
            stderr
        } else {
            match status {
                Some(code) => format!("command exited with status {code}"),
                None => "command terminated by signal".to_string(),
            }
        };
        warn!(program = %program, status = ?status, "Tool command failed");
        Err(ExecutionFailure::CommandFailed {
            status,
            output: text,
        })
    }
}

/// The argument lands in the spawned argv verbatim; reject anything that
/// could read as an option flag or smuggle in extra input.
fn validate_argument(argument: &str) -> Result<(), ExecutionFailure> {
    if argument.chars().any(char::is_control) {
        return Err(ExecutionFailure::rejected(
            "argument contains control characters",
        ));
    }
    if argument.starts_with('-') {
        return Err(ExecutionFailure::rejected(
            "argument must not start with '-'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(command: &str) -> CommandTemplate {
        CommandTemplate::parse("test-tool", command).unwrap()
    }

    fn executor() -> CommandExecutor {
        CommandExecutor::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = executor()
            .execute(&template("echo hello"), None)
            .await
            .unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn fills_slot_with_argument() {
        let output = executor()
            .execute(&template("echo state <plugName>"), Some("kitchen"))
            .await
            .unwrap();
        assert_eq!(output, "state kitchen");
    }

    #[tokio::test]
    async fn missing_program_is_a_failure_value() {
        let error = executor()
            .execute(&template("/nonexistent/spc devices"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionFailure::Io { .. }));
        assert!(!error.to_string().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_without_output_reports_status() {
        let error = executor().execute(&template("false"), None).await.unwrap_err();
        match error {
            ExecutionFailure::CommandFailed { status, output } => {
                assert_eq!(status, Some(1));
                assert_eq!(output, "command exited with status 1");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_keeps_partial_stdout() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("flaky");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "echo partial reading").unwrap();
            writeln!(file, "exit 3").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let error = executor()
            .execute(&template(script.to_str().unwrap()), None)
            .await
            .unwrap_err();
        match error {
            ExecutionFailure::CommandFailed { status, output } => {
                assert_eq!(status, Some(3));
                assert_eq!(output, "partial reading");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_the_fallback_text() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("noisy");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "echo plug unreachable >&2").unwrap();
            writeln!(file, "exit 1").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let error = executor()
            .execute(&template(script.to_str().unwrap()), None)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "plug unreachable");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let executor = CommandExecutor::new(Duration::from_millis(100));
        let error = executor
            .execute(&template("sleep 5"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionFailure::TimedOut { .. }));
    }

    #[tokio::test]
    async fn leading_dash_argument_never_reaches_the_process() {
        let error = executor()
            .execute(&template("echo <plugName>"), Some("--help"))
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionFailure::Rejected { .. }));
    }

    #[tokio::test]
    async fn control_characters_are_rejected() {
        let error = executor()
            .execute(&template("echo <plugName>"), Some("kitchen\nliving"))
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionFailure::Rejected { .. }));
    }

    #[tokio::test]
    async fn unfilled_slot_is_rejected() {
        let error = executor()
            .execute(&template("echo <plugName>"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionFailure::Rejected { .. }));
    }
}
