//! Vendor tunnels
//!
//! A [`Tunnel`] owns one vendor tunnel process. Before spawning it checks
//! the OS process table for tunnels of the same vendor (started by us or by
//! anyone else) and refuses to start a tunnel that would collide with them:
//!
//! - an identifier already in use by a running tunnel is a conflict;
//! - a tunnel that runs next to another one without distinct identifiers
//!   must set every differentiating flag (log file, pid file, ports) the
//!   vendor supports, and so must the tunnel already running.

pub mod flavor;
pub mod manager;
pub mod process;

pub use flavor::TunnelFlavor;
pub use manager::{Manager, TunnelInfo};
pub use process::TunnelProcess;

use crate::config::EngineConfig;
use crossrun_common::{Error, ProcessStatus, Result, TunnelIdentifier, TunnelOptions, Vendor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A supervised vendor tunnel
pub struct Tunnel {
    flavor: &'static TunnelFlavor,
    requested: TunnelIdentifier,
    options: TunnelOptions,
    identifier: Option<String>,
    process: TunnelProcess,
    manager: Manager,
    started: AtomicBool,
    intentionally_stopped: AtomicBool,
}

impl Tunnel {
    pub fn new(vendor: Vendor, binary: PathBuf, config: &EngineConfig, options: &TunnelOptions) -> Self {
        let flavor = TunnelFlavor::for_vendor(vendor);
        let identifier = process::resolve_identifier(&options.identifier);
        let manager = Manager::new(flavor, &binary);
        let process = TunnelProcess::new(
            flavor,
            binary,
            &config.credentials,
            options,
            identifier.as_deref(),
            &config.tunnel,
            config.retry.tunnel_stop,
        );

        Self {
            flavor,
            requested: options.identifier.clone(),
            options: options.clone(),
            identifier,
            process,
            manager,
            started: AtomicBool::new(false),
            intentionally_stopped: AtomicBool::new(false),
        }
    }

    /// Identifier as the caller asked for it, before generation
    pub fn requested(&self) -> &TunnelIdentifier {
        &self.requested
    }

    /// Identifier the tunnel runs with; jobs route through it
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn failed_to_connect(&self) -> bool {
        self.process.failed_to_connect()
    }

    /// Check for conflicts with running tunnels, then start and wait for
    /// readiness. Conflicts are reported before anything is spawned.
    pub async fn start(&self) -> Result<()> {
        let running = self.manager.running().await?;
        let (with_id, without_id): (Vec<_>, Vec<_>) =
            running.into_iter().partition(|t| t.identifier.is_some());
        check_conflicts(
            self.flavor,
            &self.options,
            self.identifier.as_deref(),
            &with_id,
            &without_id,
        )?;

        self.process.create().await?;
        self.started.store(true, Ordering::SeqCst);
        self.intentionally_stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Start again with the same settings after an unexpected exit
    pub async fn restart(&self) -> Result<()> {
        info!(
            "Restarting {} tunnel {}",
            self.flavor.vendor,
            self.identifier().unwrap_or("(no identifier)")
        );
        self.process.create().await
    }

    pub fn status(&self) -> ProcessStatus {
        self.process.status()
    }

    /// Stop the tunnel. Stopping a tunnel that already exited is not an error.
    pub async fn stop(&self) -> Result<()> {
        self.intentionally_stopped.store(true, Ordering::SeqCst);
        if self.status() == ProcessStatus::Stopped {
            debug!("Tunnel already stopped");
            return Ok(());
        }
        match self.process.stop().await {
            Err(Error::ProcessLifecycle(msg)) if msg.contains("already stopped") => Ok(()),
            other => other,
        }
    }

    pub fn is_intentionally_stopped(&self) -> bool {
        self.intentionally_stopped.load(Ordering::SeqCst)
    }

    /// Started, not stopped by us, yet no longer running
    pub fn died_unexpectedly(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.is_intentionally_stopped()
            && self.status() == ProcessStatus::Stopped
    }
}

/// Decide whether a new tunnel may start next to the ones already running
pub fn check_conflicts(
    flavor: &TunnelFlavor,
    options: &TunnelOptions,
    identifier: Option<&str>,
    with_id: &[TunnelInfo],
    without_id: &[TunnelInfo],
) -> Result<()> {
    if let Some(id) = identifier {
        if let Some(existing) = with_id.iter().find(|t| t.identifier.as_deref() == Some(id)) {
            return Err(Error::TunnelConflict(format!(
                "a {} tunnel with identifier '{}' is already running (pid {})",
                flavor.vendor, id, existing.pid
            )));
        }
    }

    // Without an identifier we collide with everything; with one, only with
    // tunnels that have none.
    let neighbours: Vec<&TunnelInfo> = if identifier.is_some() {
        without_id.iter().collect()
    } else {
        with_id.iter().chain(without_id).collect()
    };
    if neighbours.is_empty() {
        return Ok(());
    }

    let flags = flavor.differentiator_flags().join(", ");
    if !flavor.has_differentiators(options) {
        return Err(Error::TunnelConflict(format!(
            "another {} tunnel is already running (pid {}); set {} to run tunnels side by side",
            flavor.vendor, neighbours[0].pid, flags
        )));
    }
    if let Some(existing) = neighbours
        .iter()
        .find(|t| !flavor.argv_has_differentiators(&t.args))
    {
        return Err(Error::TunnelConflict(format!(
            "the {} tunnel already running (pid {}) was started without {}",
            flavor.vendor, existing.pid, flags
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pid: u32, args: &str) -> TunnelInfo {
        let args: Vec<String> = args.split_whitespace().map(str::to_string).collect();
        let identifier = TunnelFlavor::flag_value(&args, "--tunnel-identifier").map(str::to_string);
        TunnelInfo {
            pid,
            args,
            identifier,
        }
    }

    fn full_options() -> TunnelOptions {
        TunnelOptions {
            log_file: Some("/tmp/b.log".into()),
            pid_file: Some("/tmp/b.pid".into()),
            proxy_port: Some(8002),
            selenium_port: Some(4447),
            ..Default::default()
        }
    }

    const FULL: &str = "--logfile /tmp/a.log --pidfile /tmp/a.pid --scproxy-port 8001 --se-port 4446";

    fn sauce() -> &'static TunnelFlavor {
        TunnelFlavor::for_vendor(Vendor::SauceLabs)
    }

    #[test]
    fn test_nothing_running() {
        check_conflicts(sauce(), &TunnelOptions::default(), None, &[], &[]).unwrap();
    }

    #[test]
    fn test_second_unidentified_tunnel_needs_differentiators() {
        let existing = [info(10, "--user a")];
        let err = check_conflicts(sauce(), &TunnelOptions::default(), None, &[], &existing)
            .unwrap_err();
        assert!(matches!(err, Error::TunnelConflict(_)));

        // Full set on our side is not enough when the old one lacks it.
        let err = check_conflicts(sauce(), &full_options(), None, &[], &existing).unwrap_err();
        assert!(err.to_string().contains("pid 10"));

        let existing = [info(10, FULL)];
        check_conflicts(sauce(), &full_options(), None, &[], &existing).unwrap();
    }

    #[test]
    fn test_unidentified_next_to_identified() {
        let existing = [info(11, "--tunnel-identifier x")];
        assert!(check_conflicts(sauce(), &TunnelOptions::default(), None, &existing, &[]).is_err());
    }

    #[test]
    fn test_duplicate_identifier() {
        let existing = [info(12, &format!("--tunnel-identifier ci {}", FULL))];
        let err =
            check_conflicts(sauce(), &full_options(), Some("ci"), &existing, &[]).unwrap_err();
        assert!(err.to_string().contains("identifier 'ci'"));
    }

    #[test]
    fn test_distinct_identifiers_coexist() {
        let existing = [info(13, "--tunnel-identifier one")];
        check_conflicts(sauce(), &TunnelOptions::default(), Some("two"), &existing, &[]).unwrap();
    }

    #[test]
    fn test_identified_next_to_unidentified() {
        let existing = [info(14, "--user a")];
        assert!(
            check_conflicts(sauce(), &TunnelOptions::default(), Some("two"), &[], &existing)
                .is_err()
        );
    }

    #[test]
    fn test_browserstack_differentiators() {
        let bs = TunnelFlavor::for_vendor(Vendor::BrowserStack);
        let options = TunnelOptions {
            log_file: Some("/tmp/bs.log".into()),
            proxy_port: Some(45691),
            ..Default::default()
        };
        let existing = [TunnelInfo {
            pid: 20,
            args: "--key k --log-file /tmp/x.log --local-proxy-port 45690"
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            identifier: None,
        }];
        check_conflicts(bs, &options, None, &[], &existing).unwrap();
    }
}
