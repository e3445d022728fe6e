//! Tunnel health monitor
//!
//! Periodically checks every tunnel started by `Platform::open` and
//! restarts the ones that died without being asked to stop.

use crate::tunnel::Tunnel;
use crossrun_common::ProcessStatus;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunnels watched by the monitor
pub type MonitoredTunnels = Arc<RwLock<Vec<Arc<Tunnel>>>>;

pub struct TunnelMonitor {
    tunnels: MonitoredTunnels,
    interval: Duration,
    cancel: CancellationToken,
}

/// Running monitor; dropping it without [`MonitorHandle::shutdown`] leaves
/// the loop running until the runtime exits.
pub struct MonitorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the loop and wait for an in-flight restart to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!("Tunnel monitor ended abnormally: {}", e);
        }
    }
}

impl TunnelMonitor {
    pub fn new(tunnels: MonitoredTunnels, interval: Duration) -> Self {
        Self {
            tunnels,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn(self) -> MonitorHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());
        MonitorHandle { cancel, join }
    }

    async fn run(self) {
        info!("Tunnel monitor started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.check_all().await;
        }

        info!("Tunnel monitor stopped");
    }

    /// One pass over the watched tunnels
    pub async fn check_all(&self) {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.read().clone();

        for tunnel in tunnels {
            if self.cancel.is_cancelled() {
                return;
            }
            if tunnel.is_intentionally_stopped() {
                continue;
            }
            if tunnel.status() == ProcessStatus::Running {
                continue;
            }

            warn!(
                "Tunnel {} is no longer running, restarting",
                tunnel.identifier().unwrap_or("(no identifier)")
            );
            match tunnel.restart().await {
                Ok(()) => debug!("Tunnel restarted (PID {:?})", tunnel.pid()),
                Err(e) => error!("Failed to restart tunnel: {}", e),
            }
        }
    }
}
