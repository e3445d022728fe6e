//! Tunnel process bring-up and shutdown

use super::flavor::{LineKind, TunnelFlavor};
use crate::config::{Credentials, TunnelConfig};
use crate::process::{ExitInfo, Process, ProcessEvent, ProcessEvents};
use crossrun_common::{
    retry_until, Attempt, Error, ProcessStatus, Result, RetryPolicy, TunnelIdentifier,
    TunnelOptions,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolve the identifier a tunnel will be started with. `Generate` yields
/// a fresh id once, so later restarts reuse it.
pub fn resolve_identifier(identifier: &TunnelIdentifier) -> Option<String> {
    match identifier {
        TunnelIdentifier::None => None,
        TunnelIdentifier::Generate => Some(Uuid::new_v4().to_string()),
        TunnelIdentifier::Named(id) => Some(id.clone()),
    }
}

enum BringUp {
    Ready,
    Transient(String),
}

/// One vendor tunnel executable and the OS process currently running it
pub struct TunnelProcess {
    flavor: &'static TunnelFlavor,
    binary: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    connect_attempts: u32,
    stop_policy: RetryPolicy,
    current: Mutex<Option<Arc<Process>>>,
    failed_to_connect: AtomicBool,
    stop_requested: Arc<AtomicBool>,
}

impl TunnelProcess {
    pub fn new(
        flavor: &'static TunnelFlavor,
        binary: PathBuf,
        credentials: &Credentials,
        options: &TunnelOptions,
        identifier: Option<&str>,
        config: &TunnelConfig,
        stop_policy: RetryPolicy,
    ) -> Self {
        Self {
            flavor,
            args: flavor.build_args(credentials, options, identifier),
            binary,
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            connect_attempts: config.connect_attempts.max(1),
            stop_policy,
            current: Mutex::new(None),
            failed_to_connect: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.lock().as_ref().and_then(|p| p.pid())
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether any bring-up attempt hit a transient connection failure
    pub fn failed_to_connect(&self) -> bool {
        self.failed_to_connect.load(Ordering::SeqCst)
    }

    fn command_line(&self) -> String {
        self.flavor
            .redacted_command(&self.binary.display().to_string(), &self.args)
    }

    /// Start the tunnel and wait for its readiness marker. Transient
    /// connection failures are retried immediately up to the configured
    /// number of attempts.
    pub async fn create(&self) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        info!("Starting {} tunnel: {}", self.flavor.vendor, self.command_line());

        let mut last_output = String::new();
        for attempt in 1..=self.connect_attempts {
            match self.bring_up().await? {
                BringUp::Ready => {
                    info!(
                        "{} tunnel ready (PID {})",
                        self.flavor.vendor,
                        self.pid().unwrap_or_default()
                    );
                    return Ok(());
                }
                BringUp::Transient(output) => {
                    self.failed_to_connect.store(true, Ordering::SeqCst);
                    warn!(
                        "Tunnel failed to connect (attempt {}/{}), retrying",
                        attempt, self.connect_attempts
                    );
                    last_output = output;
                }
            }
        }

        Err(Error::TunnelFailed {
            command: self.command_line(),
            stdout: last_output,
        })
    }

    async fn bring_up(&self) -> Result<BringUp> {
        let process = Arc::new(Process::new());
        let mut events = process.create(&self.binary, &self.args)?;
        *self.current.lock() = Some(process.clone());

        let mut output = String::new();
        let deadline = tokio::time::sleep(self.ready_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let _ = process.kill();
                    return Err(Error::Timeout {
                        seconds: self.ready_timeout.as_secs(),
                    });
                }
                event = events.next() => match event {
                    Some(ProcessEvent::Stdout(line)) | Some(ProcessEvent::Stderr(line)) => {
                        debug!("tunnel: {}", line);
                        output.push_str(&line);
                        output.push('\n');

                        match self.flavor.classify(&line) {
                            LineKind::Ready => {
                                self.watch(events, output);
                                return Ok(BringUp::Ready);
                            }
                            LineKind::AuthFailure => {
                                let _ = process.stop();
                                return Err(Error::TunnelAuth(line));
                            }
                            _ => {}
                        }
                    }
                    Some(ProcessEvent::Exited(exit)) => {
                        return self.classify_early_exit(exit, output);
                    }
                    None => {
                        return self.classify_early_exit(
                            ExitInfo { code: None, signal: None },
                            output,
                        );
                    }
                },
            }
        }
    }

    fn classify_early_exit(&self, exit: ExitInfo, output: String) -> Result<BringUp> {
        if self.flavor.is_transient_failure(&output) {
            return Ok(BringUp::Transient(output));
        }
        debug!("Tunnel exited before ready with {}", exit);
        Err(Error::TunnelFailed {
            command: self.command_line(),
            stdout: output,
        })
    }

    /// Keep draining output after readiness and report how the tunnel ends
    fn watch(&self, mut events: ProcessEvents, mut output: String) {
        let flavor = self.flavor;
        let stop_requested = self.stop_requested.clone();
        let command = self.command_line();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                        debug!("tunnel: {}", line);
                        output.push_str(&line);
                        output.push('\n');
                    }
                    ProcessEvent::Exited(exit) => {
                        if stop_requested.load(Ordering::SeqCst) || flavor.is_graceful_exit(&output)
                        {
                            info!("{} tunnel exited ({})", flavor.vendor, exit);
                        } else {
                            warn!(
                                "{} tunnel exited unexpectedly ({}): {}\n{}",
                                flavor.vendor, exit, command, output
                            );
                        }
                        break;
                    }
                }
            }
        });
    }

    pub fn status(&self) -> ProcessStatus {
        match self.current.lock().as_ref() {
            Some(process) => process.status().unwrap_or(ProcessStatus::Stopped),
            None => ProcessStatus::Stopped,
        }
    }

    /// SIGTERM, then wait for the exit; SIGKILL once the stop budget runs out
    pub async fn stop(&self) -> Result<()> {
        let process = self
            .current
            .lock()
            .clone()
            .ok_or_else(|| Error::ProcessLifecycle("no pid".to_string()))?;

        self.stop_requested.store(true, Ordering::SeqCst);
        process.stop()?;

        let settled = retry_until(&self.stop_policy, "tunnel shutdown", |_| {
            let process = process.clone();
            async move {
                match process.status()? {
                    ProcessStatus::Stopped => Ok(Attempt::Done(())),
                    ProcessStatus::Running => Ok(Attempt::Retry("still running".to_string())),
                }
            }
        })
        .await;

        match settled {
            Ok(()) => Ok(()),
            Err(Error::RetryExhausted { .. }) => {
                warn!(
                    "Tunnel PID {} ignored SIGTERM, killing",
                    process.pid().unwrap_or_default()
                );
                process.kill()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossrun_common::Vendor;
    use std::path::Path;

    fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(format!("sc-{}", Uuid::new_v4().simple()));
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn tunnel(binary: PathBuf) -> TunnelProcess {
        let config = TunnelConfig {
            ready_timeout_secs: 5,
            ..Default::default()
        };
        TunnelProcess::new(
            TunnelFlavor::for_vendor(Vendor::SauceLabs),
            binary,
            &Credentials::new("alice", "hunter2"),
            &TunnelOptions::default(),
            Some("ci-1"),
            &config,
            RetryPolicy::fixed(40, 50),
        )
    }

    #[test]
    fn test_resolve_identifier() {
        assert_eq!(resolve_identifier(&TunnelIdentifier::None), None);
        assert_eq!(
            resolve_identifier(&TunnelIdentifier::Named("x".into())).as_deref(),
            Some("x")
        );
        let a = resolve_identifier(&TunnelIdentifier::Generate).unwrap();
        let b = resolve_identifier(&TunnelIdentifier::Generate).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_ready_then_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_binary(
            tmp.path(),
            "trap 'echo Goodbye.; exit 0' TERM\n\
             echo 'Sauce Connect is up, you may start your tests.'\n\
             while true; do sleep 0.1; done",
        );
        let tunnel = tunnel(binary);

        tunnel.create().await.unwrap();
        assert_eq!(tunnel.status(), ProcessStatus::Running);
        assert!(!tunnel.failed_to_connect());

        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_binary(tmp.path(), "echo 'HTTP 401 Unauthorized'; sleep 5");

        let err = tunnel(binary).create().await.unwrap_err();
        assert!(matches!(err, Error::TunnelAuth(_)));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("attempted");
        let binary = fake_binary(
            tmp.path(),
            &format!(
                "if [ ! -f {m} ]; then touch {m}; echo 'Error bringing up tunnel VM'; exit 1; fi\n\
                 echo 'Sauce Connect is up, you may start your tests.'\n\
                 while true; do sleep 0.1; done",
                m = marker.display()
            ),
        );
        let tunnel = tunnel(binary);

        tunnel.create().await.unwrap();
        assert!(tunnel.failed_to_connect());
        tunnel.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_reports_redacted_command() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_binary(tmp.path(), "echo 'fatal: bad option'; exit 2");

        let err = tunnel(binary).create().await.unwrap_err();
        match err {
            Error::TunnelFailed { command, stdout } => {
                assert!(command.contains("--api-key ***"));
                assert!(!command.contains("hunter2"));
                assert!(stdout.contains("fatal: bad option"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_before_create() {
        let tmp = tempfile::tempdir().unwrap();
        let tunnel = tunnel(tmp.path().join("sc"));
        assert_eq!(tunnel.status(), ProcessStatus::Stopped);
        assert!(tunnel.stop().await.is_err());
    }
}
