//! Run Command

use anyhow::{bail, Context, Result};
use clap::Args;
use crossrun_common::{
    Browser, BuildInfo, Capabilities, RunReport, RunStatus, TunnelIdentifier, Vendor,
};
use crossrun_engine::Platform;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::output::{self, print_item, print_warning, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Vendor to run on (browserstack, saucelabs, crossbrowsertesting)
    #[arg(long, env = "CROSSRUN_VENDOR")]
    pub vendor: String,

    /// URL to open
    pub url: String,

    /// Browser as name:os[:os_version[:browser_version]], repeatable
    #[arg(short, long = "browser", required = true)]
    pub browsers: Vec<String>,

    /// Route the browsers through a local tunnel
    #[arg(long)]
    pub local: bool,

    /// Tunnel identifier; pass an empty value to generate one
    #[arg(long, requires = "local")]
    pub tunnel_id: Option<String>,

    /// Project name used in session names
    #[arg(long, default_value = "crossrun")]
    pub project: String,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "600")]
    pub timeout: u64,

    /// Seconds between status polls
    #[arg(long, default_value = "5")]
    pub poll_interval: u64,

    /// Capture a screenshot of every job when stopping
    #[arg(long)]
    pub screenshot: bool,
}

/// Run report for display
#[derive(Serialize)]
pub struct RunDisplay {
    pub id: String,
    #[serde(flatten)]
    pub report: RunReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
}

impl TableDisplay for RunDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Run", "Status", "Jobs", "Tunnel"]
    }

    fn row(&self) -> Vec<String> {
        let jobs: Vec<String> = self
            .report
            .jobs
            .iter()
            .map(|s| output::job_status(*s))
            .collect();
        vec![
            self.id.clone(),
            output::run_status(self.report.status),
            jobs.join(", "),
            self.report.tunnel.to_string(),
        ]
    }
}

/// Parse `name:os[:os_version[:browser_version]]`
pub fn parse_browser(value: &str) -> Result<Browser> {
    let mut parts = value.split(':').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty());
    let os = parts.next().filter(|s| !s.is_empty());
    let (Some(name), Some(os)) = (name, os) else {
        bail!("browser '{}' must look like name:os[:os_version[:version]]", value);
    };

    let mut browser = Browser::new(name.to_lowercase(), os);
    if let Some(v) = parts.next().filter(|s| !s.is_empty()) {
        browser = browser.with_os_version(v);
    }
    if let Some(v) = parts.next().filter(|s| !s.is_empty()) {
        browser = browser.with_version(v);
    }
    if parts.next().is_some() {
        bail!("browser '{}' has too many fields", value);
    }
    Ok(browser)
}

fn capabilities(args: &RunArgs) -> Capabilities {
    if !args.local {
        return Capabilities::default();
    }
    let identifier = match args.tunnel_id.as_deref() {
        None => TunnelIdentifier::None,
        Some("") => TunnelIdentifier::Generate,
        Some(id) => TunnelIdentifier::Named(id.to_string()),
    };
    Capabilities::local(identifier)
}

pub async fn execute(args: RunArgs, config: Option<&Path>, format: OutputFormat) -> Result<()> {
    let vendor: Vendor = args.vendor.parse()?;
    let browsers = args
        .browsers
        .iter()
        .map(|b| parse_browser(b))
        .collect::<Result<Vec<_>>>()?;
    let config = super::load_config(vendor, config)?;

    let platform = Platform::new(vendor, config, BuildInfo::detect(&args.project))?;
    let outcome = drive(&platform, &args, &browsers).await;
    if let Err(e) = platform.close().await {
        warn!("Closing platform: {}", e);
    }

    let display = outcome?;
    let status = display.report.status;
    print_item(&display, format);
    if status == RunStatus::Messy {
        print_warning("tunnel died during the run; remote sessions may still be open");
        std::process::exit(2);
    }
    Ok(())
}

async fn drive(platform: &Platform, args: &RunArgs, browsers: &[Browser]) -> Result<RunDisplay> {
    let caps = capabilities(args);
    if caps.local {
        platform.open(std::slice::from_ref(&caps)).await?;
    }

    let id = platform
        .run_multiple(&args.url, browsers, &caps)
        .await
        .context("failed to start run")?;
    info!("Run {} started on {} browser(s)", id, browsers.len());

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let interval = Duration::from_secs(args.poll_interval.max(1));
    loop {
        let report = platform.status(&id).await?;
        debug!("Run {}: {:?}", id, report);
        if report.status != RunStatus::Running {
            break;
        }
        if Instant::now() >= deadline {
            warn!("Run {} still running after {}s, stopping it", id, args.timeout);
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping run {}", id);
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    let screenshots = platform.stop(&id, args.screenshot).await?;
    let report = platform.status(&id).await?;
    Ok(RunDisplay {
        id,
        report,
        screenshots,
    })
}
