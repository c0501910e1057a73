//! Starting the application server once the bootstrap is READY.

use async_trait::async_trait;
use bootstrap_core::config::ServerConfig;
use bootstrap_core::{exit_code, CancelToken, ServerHandoff};
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long a supervised server gets to exit after SIGTERM before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Full argv for the application server.
pub fn server_argv(config: &ServerConfig) -> Vec<String> {
    let mut argv: Vec<String> = config.command.split_whitespace().map(str::to_string).collect();
    argv.extend([
        "--bind".to_string(),
        format!("{}:{}", config.bind_host, config.port),
        "--workers".to_string(),
        config.workers.to_string(),
        "--threads".to_string(),
        config.threads.to_string(),
        "--timeout".to_string(),
        config.timeout_seconds.to_string(),
        "--access-logfile".to_string(),
        "-".to_string(),
        "--error-logfile".to_string(),
        "-".to_string(),
        config.app.clone(),
    ]);
    argv
}

/// Replace the current process with the server, so it inherits the process
/// identity and receives the orchestrator's signals directly.
pub struct ExecHandoff {
    argv: Vec<String>,
}

impl ExecHandoff {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ServerHandoff for ExecHandoff {
    #[cfg(unix)]
    async fn hand_off(&self, _cancel: &CancelToken) -> i32 {
        use std::os::unix::process::CommandExt;

        let Some((program, args)) = self.argv.split_first() else {
            error!("❌ server command is empty");
            return exit_code::HANDOFF_FAILED;
        };
        info!("🚀 exec {}", self.argv.join(" "));

        // Only returns on failure.
        let err = std::process::Command::new(program).args(args).exec();
        error!("❌ failed to exec {}: {}", program, err);
        exit_code::HANDOFF_FAILED
    }

    #[cfg(not(unix))]
    async fn hand_off(&self, cancel: &CancelToken) -> i32 {
        warn!("⚠️  exec handoff unavailable on this platform, supervising instead");
        SuperviseHandoff::new(self.argv.clone()).hand_off(cancel).await
    }
}

/// Run the server as a child process, forwarding shutdown to it. The exit
/// code is the child's.
pub struct SuperviseHandoff {
    argv: Vec<String>,
    grace: Duration,
}

impl SuperviseHandoff {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ServerHandoff for SuperviseHandoff {
    async fn hand_off(&self, cancel: &CancelToken) -> i32 {
        let Some((program, args)) = self.argv.split_first() else {
            error!("❌ server command is empty");
            return exit_code::HANDOFF_FAILED;
        };

        let mut child = match tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("❌ failed to start {}: {}", program, e);
                return exit_code::HANDOFF_FAILED;
            }
        };
        info!(pid = child.id(), "🚀 server started: {}", self.argv.join(" "));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                info!("forwarding shutdown to server");
                if let Some(pid) = child.id() {
                    request_stop(pid);
                }
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!("⚠️  server still running after {:?}, killing", self.grace);
                        if let Err(e) = child.start_kill() {
                            warn!("⚠️  kill failed: {}", e);
                        }
                        child.wait().await
                    }
                }
            }
        };

        match status {
            Ok(status) => {
                let code = status_code(status);
                info!(exit_code = code, "server exited");
                code
            }
            Err(e) => {
                error!("❌ waiting for server failed: {}", e);
                exit_code::HANDOFF_FAILED
            }
        }
    }
}

/// Used with `--no-handoff`: provisioning only.
pub struct NoHandoff;

#[async_trait]
impl ServerHandoff for NoHandoff {
    async fn hand_off(&self, _cancel: &CancelToken) -> i32 {
        info!("✅ provisioning complete, server start skipped");
        exit_code::READY
    }
}

/// Ask the child to stop with SIGTERM.
#[cfg(unix)]
fn request_stop(pid: u32) {
    let pid = pid.to_string();
    match std::process::Command::new("kill")
        .args(["-TERM", pid.as_str()])
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("⚠️  kill -TERM {} exited with {}", pid, status),
        Err(e) => warn!("⚠️  could not signal server {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn request_stop(_pid: u32) {}

fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    exit_code::HANDOFF_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootstrap_core::config::HandoffMode;
    use bootstrap_core::Cancellation;

    fn server_config() -> ServerConfig {
        ServerConfig {
            command: "gunicorn".to_string(),
            app: "hospital_management.wsgi:application".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 3,
            threads: 2,
            timeout_seconds: 120,
            handoff: HandoffMode::Exec,
        }
    }

    #[test]
    fn test_server_argv_matches_config() {
        let argv = server_argv(&server_config());
        assert_eq!(
            argv,
            vec![
                "gunicorn",
                "--bind",
                "0.0.0.0:8000",
                "--workers",
                "3",
                "--threads",
                "2",
                "--timeout",
                "120",
                "--access-logfile",
                "-",
                "--error-logfile",
                "-",
                "hospital_management.wsgi:application",
            ]
        );
    }

    #[test]
    fn test_multi_word_command_is_split() {
        let mut config = server_config();
        config.command = "python -m gunicorn".to_string();
        let argv = server_argv(&config);
        assert_eq!(&argv[..3], &["python", "-m", "gunicorn"]);
        assert_eq!(argv.last().map(String::as_str), Some("hospital_management.wsgi:application"));
    }

    #[test]
    fn test_no_handoff_reports_ready() {
        let code = tokio_test::block_on(NoHandoff.hand_off(&CancelToken::never()));
        assert_eq!(code, exit_code::READY);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervised_exit_code_is_the_childs() {
        let handoff = SuperviseHandoff::new(vec!["sh".into(), "-c".into(), "exit 3".into()]);
        assert_eq!(handoff.hand_off(&CancelToken::never()).await, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervised_child_is_stopped_on_cancel() {
        let cancellation = Cancellation::new();
        let token = cancellation.token();
        let handoff = SuperviseHandoff::new(vec!["sleep".into(), "30".into()]).with_grace(Duration::from_secs(5));

        let running = tokio::spawn(async move { handoff.hand_off(&token).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancellation.cancel();

        let code = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap();
        // SIGTERM
        assert_eq!(code, 128 + 15);
    }

    #[tokio::test]
    async fn test_missing_program_is_a_handoff_failure() {
        let handoff = SuperviseHandoff::new(vec!["/nonexistent/hospital-server".into()]);
        assert_eq!(handoff.hand_off(&CancelToken::never()).await, exit_code::HANDOFF_FAILED);
    }
}
