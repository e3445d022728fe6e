//! Run orchestration
//!
//! A [`Platform`] owns every run started against one vendor. Runs that ask
//! for a local tunnel reuse a tunnel started by [`Platform::open`], share
//! one with another active run asking for the same identifier, or start
//! their own. A tunnel is stopped only when the last run referencing it is
//! stopped; tunnels from `open` live until [`Platform::close`].

use crate::binary::TunnelBinary;
use crate::config::EngineConfig;
use crate::job::Job;
use crate::monitor::{MonitorHandle, MonitoredTunnels, TunnelMonitor};
use crate::script::{ScriptFn, ScriptJob};
use crate::tunnel::Tunnel;
use crate::validate::{BasicValidator, CapabilityValidator};
use crate::vendor::{self, JobRequest, VendorAdapters};
use crossrun_common::{
    Browser, BuildInfo, Capabilities, Error, JobStatus, ProcessStatus, Result, RunReport,
    RunStatus, TunnelStatus, Vendor,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One logical test execution
pub struct Run {
    id: String,
    jobs: Vec<Arc<Job>>,
    script_jobs: Vec<Arc<ScriptJob>>,
    tunnel: Option<Arc<Tunnel>>,
    stopping: AtomicBool,
}

impl Run {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tunnel(&self) -> Option<&Arc<Tunnel>> {
        self.tunnel.as_ref()
    }

    async fn job_statuses(&self) -> Vec<JobStatus> {
        let mut statuses = join_all(self.jobs.iter().map(|job| job.status())).await;
        statuses.extend(join_all(self.script_jobs.iter().map(|job| job.status())).await);
        statuses
    }

    async fn report(&self) -> RunReport {
        let jobs = self.job_statuses().await;
        let tunnel = match &self.tunnel {
            Some(t) => TunnelStatus::from(t.status()),
            None => TunnelStatus::None,
        };
        let died = self.tunnel.as_ref().is_some_and(|t| t.died_unexpectedly());

        let status = if died {
            RunStatus::Messy
        } else if jobs.iter().any(|s| !s.is_terminal()) {
            RunStatus::Running
        } else {
            RunStatus::Stopped
        };
        RunReport {
            status,
            jobs,
            tunnel,
        }
    }
}

/// A run-started tunnel and the number of runs holding it, counted from
/// acquisition so runs still creating their jobs are included.
struct Lease {
    tunnel: Arc<Tunnel>,
    holders: usize,
}

pub struct Platform {
    vendor: Vendor,
    config: EngineConfig,
    build: BuildInfo,
    adapters: VendorAdapters,
    validator: Arc<dyn CapabilityValidator>,
    binary: TunnelBinary,
    runs: RwLock<HashMap<String, Arc<Run>>>,
    /// Final reports of stopped runs, kept until close
    finished: RwLock<HashMap<String, RunReport>>,
    monitored: MonitoredTunnels,
    leases: Mutex<Vec<Lease>>,
    monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
    /// Serializes tunnel acquisition and release
    tunnel_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Platform {
    pub fn new(vendor: Vendor, config: EngineConfig, build: BuildInfo) -> Result<Self> {
        let adapters = vendor::connect(vendor, &config)?;
        Ok(Self::with_adapters(vendor, config, build, adapters))
    }

    /// Use custom adapters, e.g. doubles in tests
    pub fn with_adapters(
        vendor: Vendor,
        config: EngineConfig,
        build: BuildInfo,
        adapters: VendorAdapters,
    ) -> Self {
        let binary = TunnelBinary::new(vendor, config.bin_path());
        Self {
            vendor,
            config,
            build,
            adapters,
            validator: Arc::new(BasicValidator),
            binary,
            runs: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            monitored: Arc::new(RwLock::new(Vec::new())),
            leases: Mutex::new(Vec::new()),
            monitor: tokio::sync::Mutex::new(None),
            tunnel_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn CapabilityValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn build(&self) -> &BuildInfo {
        &self.build
    }

    /// Ids of runs that have not been stopped
    pub fn run_ids(&self) -> Vec<String> {
        self.runs.read().keys().cloned().collect()
    }

    /// Tunnels started by [`Platform::open`]
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.monitored.read().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ProcessLifecycle("platform is closed".to_string()));
        }
        Ok(())
    }

    async fn tunnel_binary(&self) -> Result<PathBuf> {
        match &self.config.tunnel.binary_path {
            Some(path) => Ok(path.clone()),
            None => self.binary.ensure().await,
        }
    }

    async fn start_tunnel(&self, capabilities: &Capabilities) -> Result<Arc<Tunnel>> {
        let binary = self.tunnel_binary().await?;
        let tunnel = Arc::new(Tunnel::new(
            self.vendor,
            binary,
            &self.config,
            &capabilities.tunnel,
        ));
        tunnel.start().await?;
        Ok(tunnel)
    }

    /// Start one monitored tunnel per distinct identifier among the local
    /// capabilities, then start the health monitor.
    pub async fn open(&self, capabilities: &[Capabilities]) -> Result<()> {
        self.check_open()?;

        {
            let _guard = self.tunnel_lock.lock().await;
            let mut started: Vec<Arc<Tunnel>> = Vec::new();
            for caps in capabilities.iter().filter(|c| c.local) {
                let known = self
                    .monitored
                    .read()
                    .iter()
                    .any(|t| t.requested() == &caps.tunnel.identifier);
                if known {
                    continue;
                }
                match self.start_tunnel(caps).await {
                    Ok(tunnel) => {
                        self.monitored.write().push(tunnel.clone());
                        started.push(tunnel);
                    }
                    Err(e) => {
                        warn!("Opening tunnels failed, stopping {} started here", started.len());
                        self.monitored
                            .write()
                            .retain(|t| !started.iter().any(|s| Arc::ptr_eq(s, t)));
                        for tunnel in &started {
                            if let Err(err) = tunnel.stop().await {
                                warn!("Failed to stop tunnel {:?}: {}", tunnel.identifier(), err);
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }

        let mut monitor = self.monitor.lock().await;
        if monitor.is_none() && !self.monitored.read().is_empty() {
            let interval = Duration::from_millis(self.config.tunnel.monitor_interval_ms);
            *monitor = Some(TunnelMonitor::new(self.monitored.clone(), interval).spawn());
        }
        Ok(())
    }

    /// Find or start the tunnel for a run. Run-started tunnels are leased
    /// before the lock is released; every acquisition must be paired with
    /// one [`Platform::release_tunnel`] or [`Platform::release`].
    async fn acquire_tunnel(&self, capabilities: &Capabilities) -> Result<Option<Arc<Tunnel>>> {
        if !capabilities.local {
            return Ok(None);
        }
        let _guard = self.tunnel_lock.lock().await;
        let wanted = &capabilities.tunnel.identifier;

        let monitored = self
            .monitored
            .read()
            .iter()
            .find(|t| t.requested() == wanted)
            .cloned();
        if let Some(tunnel) = monitored {
            debug!("Using monitored tunnel {:?}", tunnel.identifier());
            return Ok(Some(tunnel));
        }

        {
            let mut leases = self.leases.lock();
            let shared = leases.iter_mut().find(|lease| {
                lease.tunnel.requested() == wanted
                    && !lease.tunnel.is_intentionally_stopped()
                    && lease.tunnel.status() == ProcessStatus::Running
            });
            if let Some(lease) = shared {
                lease.holders += 1;
                debug!(
                    "Sharing tunnel {:?} with {} other run(s)",
                    lease.tunnel.identifier(),
                    lease.holders - 1
                );
                return Ok(Some(lease.tunnel.clone()));
            }
        }

        let tunnel = self.start_tunnel(capabilities).await?;
        self.leases.lock().push(Lease {
            tunnel: tunnel.clone(),
            holders: 1,
        });
        Ok(Some(tunnel))
    }

    /// Drop one hold on `tunnel`. True when the caller must stop it: the
    /// last holder let go and the monitor does not own it. Caller holds
    /// `tunnel_lock`.
    fn release(&self, tunnel: &Arc<Tunnel>) -> bool {
        if self.monitored.read().iter().any(|t| Arc::ptr_eq(t, tunnel)) {
            return false;
        }
        let mut leases = self.leases.lock();
        match leases.iter().position(|lease| Arc::ptr_eq(&lease.tunnel, tunnel)) {
            Some(index) => {
                leases[index].holders -= 1;
                if leases[index].holders > 0 {
                    return false;
                }
                leases.remove(index);
                true
            }
            None => true,
        }
    }

    async fn release_tunnel(&self, tunnel: Option<Arc<Tunnel>>) {
        let Some(tunnel) = tunnel else {
            return;
        };
        let _guard = self.tunnel_lock.lock().await;
        if self.release(&tunnel) {
            if let Err(e) = tunnel.stop().await {
                warn!("Failed to stop tunnel after aborted run: {}", e);
            }
        }
    }

    fn validate(&self, browsers: &[Browser], capabilities: &Capabilities) -> Result<()> {
        if browsers.is_empty() {
            return Err(Error::Input("at least one browser is required".to_string()));
        }
        for browser in browsers {
            self.validator.validate(self.vendor, browser, capabilities)?;
        }
        Ok(())
    }

    fn requests(
        &self,
        url: &str,
        browsers: &[Browser],
        capabilities: &Capabilities,
        tunnel: Option<&Arc<Tunnel>>,
    ) -> Vec<JobRequest> {
        let tunnel_identifier = tunnel.and_then(|t| t.identifier().map(str::to_string));
        browsers
            .iter()
            .map(|browser| JobRequest {
                url: url.to_string(),
                browser: browser.clone(),
                capabilities: capabilities.clone(),
                build: self.build.clone(),
                tunnel_identifier: tunnel_identifier.clone(),
            })
            .collect()
    }

    fn register(&self, jobs: Vec<Arc<Job>>, script_jobs: Vec<Arc<ScriptJob>>, tunnel: Option<Arc<Tunnel>>) -> String {
        let id = Uuid::new_v4().to_string();
        let run = Arc::new(Run {
            id: id.clone(),
            jobs,
            script_jobs,
            tunnel,
            stopping: AtomicBool::new(false),
        });
        self.runs.write().insert(id.clone(), run);
        id
    }

    pub async fn run(&self, url: &str, browser: &Browser, capabilities: &Capabilities) -> Result<String> {
        self.run_multiple(url, std::slice::from_ref(browser), capabilities)
            .await
    }

    /// Create one job per browser, concurrently. Returns the run id once
    /// every job has been created.
    pub async fn run_multiple(
        &self,
        url: &str,
        browsers: &[Browser],
        capabilities: &Capabilities,
    ) -> Result<String> {
        self.check_open()?;
        self.validate(browsers, capabilities)?;

        let tunnel = self.acquire_tunnel(capabilities).await?;
        let requests = self.requests(url, browsers, capabilities, tunnel.as_ref());

        let created = join_all(requests.iter().map(|request| {
            Job::create(self.adapters.jobs.clone(), request, self.config.retry.clone())
        }))
        .await;

        let mut jobs = Vec::with_capacity(created.len());
        let mut failure = None;
        for result in created {
            match result {
                Ok(job) => jobs.push(Arc::new(job)),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            warn!("Job creation failed, stopping {} created jobs", jobs.len());
            for job in &jobs {
                if let Err(err) = job.stop(false).await {
                    warn!("Failed to stop job for {}: {}", job.browser(), err);
                }
            }
            self.release_tunnel(tunnel).await;
            return Err(e);
        }

        let id = self.register(jobs, Vec::new(), tunnel);
        info!("Run {} started with {} job(s)", id, browsers.len());
        Ok(id)
    }

    pub async fn run_script(
        &self,
        url: &str,
        browser: &Browser,
        capabilities: &Capabilities,
        script: ScriptFn,
    ) -> Result<String> {
        self.run_script_multiple(url, std::slice::from_ref(browser), capabilities, script)
            .await
    }

    /// Open one WebDriver session per browser and run `script` on each
    pub async fn run_script_multiple(
        &self,
        url: &str,
        browsers: &[Browser],
        capabilities: &Capabilities,
        script: ScriptFn,
    ) -> Result<String> {
        self.check_open()?;
        self.validate(browsers, capabilities)?;

        let tunnel = self.acquire_tunnel(capabilities).await?;
        let requests = self.requests(url, browsers, capabilities, tunnel.as_ref());

        let created = join_all(requests.iter().map(|request| {
            ScriptJob::create(
                self.adapters.sessions.clone(),
                &self.config.credentials,
                request,
            )
        }))
        .await;

        let mut jobs = Vec::with_capacity(created.len());
        let mut failure = None;
        for result in created {
            match result {
                Ok(job) => jobs.push(Arc::new(job)),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            for job in &jobs {
                if let Err(err) = job.stop(false).await {
                    warn!("Failed to close session {}: {}", job.session().id(), err);
                }
            }
            self.release_tunnel(tunnel).await;
            return Err(e);
        }

        for job in &jobs {
            job.run(script.clone());
        }

        let id = self.register(Vec::new(), jobs, tunnel);
        info!("Script run {} started with {} session(s)", id, browsers.len());
        Ok(id)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunReport> {
        if let Some(report) = self.finished.read().get(run_id) {
            return Ok(report.clone());
        }
        let run = self
            .runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchRun(run_id.to_string()))?;
        Ok(run.report().await)
    }

    /// Stop every job of the run, then its tunnel unless another active run
    /// or the monitor still uses it. Returns screenshot references when
    /// requested. Stopping a stopped run does nothing.
    pub async fn stop(&self, run_id: &str, take_screenshot: bool) -> Result<Vec<String>> {
        if self.finished.read().contains_key(run_id) {
            debug!("Run {} already stopped", run_id);
            return Ok(Vec::new());
        }
        let run = self
            .runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchRun(run_id.to_string()))?;

        if run.stopping.swap(true, Ordering::SeqCst) {
            debug!("Run {} is already stopping", run_id);
            return Ok(Vec::new());
        }

        match self.stop_run(&run, take_screenshot).await {
            Ok(screenshots) => Ok(screenshots),
            Err(e) => {
                run.stopping.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn stop_run(&self, run: &Arc<Run>, take_screenshot: bool) -> Result<Vec<String>> {
        let died = run.tunnel.as_ref().is_some_and(|t| t.died_unexpectedly());

        let mut results = join_all(run.jobs.iter().map(|job| job.stop(take_screenshot))).await;
        results.extend(
            join_all(run.script_jobs.iter().map(|job| job.stop(take_screenshot))).await,
        );

        let mut screenshots = Vec::new();
        for result in results {
            match result {
                Ok(Some(shot)) => screenshots.push(shot),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to stop a job of run {}: {}", run.id, e);
                    return Err(e);
                }
            }
        }

        let mut report = run.report().await;
        report.status = if died {
            RunStatus::Messy
        } else {
            RunStatus::Stopped
        };
        self.finished.write().insert(run.id.clone(), report);

        let _guard = self.tunnel_lock.lock().await;
        self.runs.write().remove(&run.id);

        if let Some(tunnel) = &run.tunnel {
            if self.release(tunnel) {
                tunnel.stop().await?;
            } else {
                debug!("Tunnel of run {} stays up for other users", run.id);
            }
            if let Some(report) = self.finished.write().get_mut(&run.id) {
                report.tunnel = TunnelStatus::from(tunnel.status());
            }
        }

        info!("Run {} stopped", run.id);
        Ok(screenshots)
    }

    /// Stop every run and tunnel and end monitoring. Safe to call twice.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let runs: Vec<Arc<Run>> = self.runs.read().values().cloned().collect();
        let mut tunnels: Vec<Arc<Tunnel>> = Vec::new();
        for run in runs {
            if let Some(tunnel) = &run.tunnel {
                tunnels.push(tunnel.clone());
            }
            if run.stopping.swap(true, Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = self.stop_run(&run, false).await {
                warn!("Ignoring failure while closing run {}: {}", run.id, e);
            }
        }

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.shutdown().await;
        }

        tunnels.extend(self.monitored.write().drain(..));
        tunnels.extend(self.leases.lock().drain(..).map(|lease| lease.tunnel));
        for tunnel in &tunnels {
            if let Err(e) = tunnel.stop().await {
                warn!("Failed to stop tunnel: {}", e);
            }
        }

        self.runs.write().clear();
        self.finished.write().clear();

        let remaining = tunnels
            .iter()
            .filter(|t| t.status() == ProcessStatus::Running)
            .count();
        if remaining > 0 {
            return Err(Error::ProcessLifecycle(format!(
                "{} tunnel process(es) still running after close",
                remaining
            )));
        }
        info!("Platform closed");
        Ok(())
    }
}
