//! Framework-owned steps run through the application's management CLI
//! (`python manage.py <subcommand>`).

use crate::steps::StepAction;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn last_line(text: &str) -> Option<&str> {
        text.lines().rev().map(str::trim).find(|line| !line.is_empty())
    }
}

/// The management CLI prefix, e.g. `python manage.py`.
#[derive(Debug, Clone)]
pub struct ManageCommand {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
}

impl ManageCommand {
    /// Split a whitespace-separated command prefix.
    pub fn parse(prefix: &str, timeout: Duration) -> Result<Self> {
        let mut parts = prefix.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("management command prefix is empty"))?;
        Ok(Self {
            program,
            base_args: parts.collect(),
            timeout,
        })
    }

    pub fn display(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run a subcommand to completion. A non-zero exit is an error carrying
    /// the last line of stderr.
    pub async fn run(&self, args: &[String], envs: &[(&str, &str)]) -> Result<CommandOutput> {
        let shown = self.display(args);
        tracing::debug!(command = %shown, "executing management command");

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let started = Instant::now();
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| anyhow!("`{}` timed out after {:?}", shown, self.timeout))?
            .with_context(|| format!("failed to start `{}`", shown))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(
            command = %shown,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "management command finished"
        );

        if !result.success() {
            let last_line = CommandOutput::last_line(&result.stderr)
                .or_else(|| CommandOutput::last_line(&result.stdout))
                .unwrap_or("No output available");
            return Err(anyhow!(
                "`{}` exited with {}: {}",
                shown,
                result.exit_code,
                last_line
            ));
        }
        Ok(result)
    }
}

/// A step that runs one management subcommand.
pub struct CommandAction {
    command: ManageCommand,
    args: Vec<String>,
}

impl CommandAction {
    pub fn new(command: ManageCommand, args: &[&str]) -> Self {
        Self {
            command,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[async_trait]
impl StepAction for CommandAction {
    async fn run(&self) -> Result<Option<String>> {
        let output = self.command.run(&self.args, &[]).await?;
        Ok(CommandOutput::last_line(&output.stdout).map(str::to_string))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> (ManageCommand, Vec<String>) {
        let command = ManageCommand::parse("sh -c", Duration::from_secs(5)).unwrap();
        (command, vec![script.to_string()])
    }

    #[test]
    fn test_parse_splits_prefix() {
        let command = ManageCommand::parse("python  manage.py", Duration::from_secs(1)).unwrap();
        assert_eq!(
            command.display(&["migrate".to_string(), "--noinput".to_string()]),
            "python manage.py migrate --noinput"
        );
        assert!(ManageCommand::parse("   ", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let (command, args) = sh("echo 'Applying hospital.0001_initial... OK'");
        let output = command.run(&args, &[]).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("0001_initial"));
    }

    #[tokio::test]
    async fn test_failure_reports_last_stderr_line() {
        let (command, args) = sh("echo noise >&2; echo 'django.db.utils.OperationalError: no such table' >&2; exit 3");
        let err = command.run(&args, &[]).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 3"), "{}", message);
        assert!(message.contains("OperationalError"), "{}", message);
    }

    #[tokio::test]
    async fn test_environment_is_passed_through() {
        let (command, args) = sh("test \"$DJANGO_SUPERUSER_PASSWORD\" = s3cret");
        assert!(command
            .run(&args, &[("DJANGO_SUPERUSER_PASSWORD", "s3cret")])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let command = ManageCommand::parse("sh -c", Duration::from_millis(100)).unwrap();
        let err = command.run(&["sleep 5".to_string()], &[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_command_action_detail_is_last_stdout_line() {
        let command = ManageCommand::parse("sh -c", Duration::from_secs(5)).unwrap();
        let action = CommandAction::new(command, &["echo first; echo '42 static files copied'"]);
        let detail = action.run().await.unwrap();
        assert_eq!(detail.as_deref(), Some("42 static files copied"));
    }
}
