//! Controller side: spawns the remote session and serves requests over its
//! standard streams.

use crate::server::{Handler, RelayServer};
use anyhow::{Context, anyhow};
use pipesecret::error::join_results;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Program and arguments that start the remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl SessionCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// `<ssh> <host> <remote_command>`
    pub fn ssh(ssh: &str, host: &str, remote_command: &str) -> Self {
        Self::new(ssh).arg(host).arg(remote_command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

pub struct Controller<H> {
    command: SessionCommand,
    server: RelayServer<H>,
}

impl<H: Handler> Controller<H> {
    pub fn new(command: SessionCommand, handler: H) -> Self {
        Self {
            command,
            server: RelayServer::new(handler),
        }
    }

    /// Run the session to completion.
    ///
    /// When `stop` resolves the child is killed and the relay server is
    /// cancelled. The child's exit status is reported as an error unless it
    /// exited cleanly or died from the kill this method delivered.
    pub async fn run<S>(self, stop: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(self.command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.command.program))?;
        info!(pid = ?child.id(), program = %self.command.program, "remote session started");

        let stdin = child.stdin.take().context("remote session stdin was not captured")?;
        let stdout = child.stdout.take().context("remote session stdout was not captured")?;
        let stderr = child.stderr.take().context("remote session stderr was not captured")?;
        let stderr_drain = tokio::spawn(log_stderr(stderr));

        let cancel = CancellationToken::new();
        let serve = self.server.run(stdout, stdin, cancel.clone());
        tokio::pin!(serve);
        tokio::pin!(stop);
        let mut stopped = false;
        let mut killed = false;

        let server_result = loop {
            tokio::select! {
                result = &mut serve => break result,
                _ = &mut stop, if !stopped => {}
            }
            stopped = true;
            killed = stop_session(&mut child, &cancel);
        };

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut stop, if !stopped => {}
            }
            stopped = true;
            killed = stop_session(&mut child, &cancel);
        };

        let wait_result = match status {
            Err(e) => Err(anyhow::Error::new(e).context("failed to wait for remote session")),
            Ok(status) if status.success() => {
                info!("remote session exited");
                Ok(())
            }
            Ok(status) if killed && status.signal() == Some(libc::SIGKILL) => {
                info!("remote session stopped");
                Ok(())
            }
            Ok(status) => Err(anyhow!("remote session exited with {status}")),
        };

        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_drain)
            .await
            .is_err()
        {
            debug!("gave up waiting for remote session stderr");
        }

        join_results([server_result.context("relay server failed"), wait_result])
    }
}

/// Kill the child and cancel the relay server. Returns whether the kill was
/// delivered.
fn stop_session(child: &mut Child, cancel: &CancellationToken) -> bool {
    info!("stop requested, killing remote session");
    cancel.cancel();
    match child.start_kill() {
        Ok(()) => true,
        Err(e) => {
            warn!(err = %e, "failed to kill remote session");
            false
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("remote: {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(err = %e, "stopped reading remote session stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipesecret::protocol::{HEARTBEAT, HEARTBEAT_ACK, RpcError};
    use serde_json::Value;

    struct Ack;

    impl Handler for Ack {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            match method {
                HEARTBEAT => Ok(Value::from(HEARTBEAT_ACK)),
                other => Err(RpcError::method_not_handled(other)),
            }
        }
    }

    fn shell(script: &str) -> SessionCommand {
        SessionCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn clean_exchange_then_exit_is_ok() {
        let script = r#"
            printf '%s\n' '{"id":"1","method":"heartbeat"}'
            IFS= read -r line
            case "$line" in
              *'"result":"ack"'*) exit 0 ;;
              *) echo "unexpected: $line" >&2; exit 7 ;;
            esac
        "#;
        Controller::new(shell(script), Ack)
            .run(std::future::pending())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn environment_reaches_the_session() {
        let script = r#"[ "$PIPESECRET_SOCKET" = /tmp/x.sock ] || exit 9"#;
        let command = shell(script).env("PIPESECRET_SOCKET", "/tmp/x.sock");
        Controller::new(command, Ack)
            .run(std::future::pending())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_kills_the_session_and_suppresses_its_exit_status() {
        Controller::new(shell("exec sleep 30"), Ack)
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let err = Controller::new(shell("exit 3"), Ack)
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit status: 3"), "got {err:#}");
    }

    #[tokio::test]
    async fn garbage_on_stdout_fails_the_relay_server() {
        let err = Controller::new(shell("echo not-json"), Ack)
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("relay server failed"), "got {err:#}");
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let err = Controller::new(SessionCommand::new("/nonexistent/pipesecret-ssh"), Ack)
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn ssh_command_places_host_before_remote_command() {
        let cmd = SessionCommand::ssh("ssh", "box", "pipesecret remote-serve");
        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args, vec!["box", "pipesecret remote-serve"]);
    }
}
