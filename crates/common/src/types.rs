//! Core types for crossrun

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Cross-browser cloud vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    BrowserStack,
    SauceLabs,
    CrossBrowserTesting,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [
        Vendor::BrowserStack,
        Vendor::SauceLabs,
        Vendor::CrossBrowserTesting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::BrowserStack => "browserstack",
            Vendor::SauceLabs => "saucelabs",
            Vendor::CrossBrowserTesting => "crossbrowsertesting",
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Vendor {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                crate::Error::Input(format!(
                    "vendor '{}' is not supported, valid options are: {}",
                    s,
                    Vendor::ALL.map(|v| v.as_str()).join(", ")
                ))
            })
    }
}

/// Browser/OS selection for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Browser {
    pub browser: String,
    #[serde(default)]
    pub browser_version: Option<String>,
    pub os: String,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

impl Browser {
    pub fn new(browser: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            browser: browser.into(),
            browser_version: None,
            os: os.into(),
            os_version: None,
            device: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.browser_version = Some(version.into());
        self
    }

    pub fn with_os_version(mut self, version: impl Into<String>) -> Self {
        self.os_version = Some(version.into());
        self
    }
}

impl std::fmt::Display for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.browser)?;
        if let Some(v) = &self.browser_version {
            write!(f, " {}", v)?;
        }
        write!(f, " on {}", self.os)?;
        if let Some(v) = &self.os_version {
            write!(f, " {}", v)?;
        }
        if let Some(d) = &self.device {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

/// How a tunnel is told apart from other tunnels of the same vendor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelIdentifier {
    /// No identifier flag at all; at most one such tunnel may run.
    #[default]
    None,
    /// Identifier flag requested without a value; a fresh one is generated.
    Generate,
    Named(String),
}

/// Tunnel arguments carried by capabilities requesting a local tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelOptions {
    #[serde(default)]
    pub identifier: TunnelIdentifier,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub selenium_port: Option<u16>,
    /// Passed through verbatim after the generated arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Validated capabilities for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Route the remote browser through a local tunnel
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub tunnel: TunnelOptions,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Vendor-specific capabilities merged into the job request as-is
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Capabilities {
    pub fn local(identifier: TunnelIdentifier) -> Self {
        Self {
            local: true,
            tunnel: TunnelOptions {
                identifier,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Canonical job status; ordering follows the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queue,
    Running,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queue => write!(f, "queue"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// OS process state as seen by a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Tunnel column of a run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    None,
    Running,
    Stopped,
}

impl From<ProcessStatus> for TunnelStatus {
    fn from(s: ProcessStatus) -> Self {
        match s {
            ProcessStatus::Running => TunnelStatus::Running,
            ProcessStatus::Stopped => TunnelStatus::Stopped,
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::None => write!(f, "none"),
            TunnelStatus::Running => write!(f, "running"),
            TunnelStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Aggregate run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
    /// Jobs are done (or stranded) but the tunnel died before the run was
    /// stopped; remote sessions may be orphaned.
    Messy,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Messy => write!(f, "messy"),
        }
    }
}

/// Result of `Platform::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub jobs: Vec<JobStatus>,
    pub tunnel: TunnelStatus,
}

/// Build identifier triple attached to every job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub project: String,
    pub test: String,
    pub build: String,
}

impl BuildInfo {
    pub fn new(
        project: impl Into<String>,
        test: impl Into<String>,
        build: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            test: test.into(),
            build: build.into(),
        }
    }

    /// Derive the triple from the CI environment, or a random build id
    /// when not running under a known CI.
    pub fn detect(project: impl Into<String>) -> Self {
        Self::from_lookup(project, |key| std::env::var(key).ok())
    }

    fn from_lookup(project: impl Into<String>, env: impl Fn(&str) -> Option<String>) -> Self {
        let project = project.into();

        // (test name var, build id var)
        const CI_VARS: [(&str, &str); 3] = [
            ("GITHUB_WORKFLOW", "GITHUB_RUN_ID"),
            ("CIRCLE_JOB", "CIRCLE_BUILD_NUM"),
            ("TRAVIS_JOB_NAME", "TRAVIS_JOB_NUMBER"),
        ];

        for (test_var, build_var) in CI_VARS {
            if let Some(build) = env(build_var) {
                let test = env(test_var).unwrap_or_else(|| project.clone());
                return Self { project, test, build };
            }
        }

        Self {
            test: project.clone(),
            project,
            build: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Session name shown in vendor dashboards
    pub fn session_name(&self) -> String {
        format!("{} - {} - {}", self.project, self.test, self.build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_vendor_parse() {
        assert_eq!("SauceLabs".parse::<Vendor>().unwrap(), Vendor::SauceLabs);
        let err = "testingbot".parse::<Vendor>().unwrap_err().to_string();
        assert!(err.starts_with("vendor 'testingbot'"));
        assert!(err.contains("valid options are: browserstack, saucelabs, crossbrowsertesting"));
    }

    #[test]
    fn test_job_status_ordering() {
        assert!(JobStatus::Queue < JobStatus::Running);
        assert!(JobStatus::Running < JobStatus::Stopped);
        assert!(JobStatus::Stopped.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_report_serialization() {
        let report = RunReport {
            status: RunStatus::Messy,
            jobs: vec![JobStatus::Stopped, JobStatus::Queue],
            tunnel: TunnelStatus::None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "messy");
        assert_eq!(json["jobs"][1], "queue");
        assert_eq!(json["tunnel"], "none");
    }

    #[test]
    fn test_build_info_from_ci() {
        let env: HashMap<&str, &str> =
            [("CIRCLE_BUILD_NUM", "77"), ("CIRCLE_JOB", "unit")].into_iter().collect();
        let info = BuildInfo::from_lookup("site", |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(info, BuildInfo::new("site", "unit", "77"));
    }

    #[test]
    fn test_build_info_random_fallback() {
        let a = BuildInfo::from_lookup("site", |_| None);
        let b = BuildInfo::from_lookup("site", |_| None);
        assert_eq!(a.project, "site");
        assert_ne!(a.build, b.build);
    }

    #[test]
    fn test_browser_display() {
        let b = Browser::new("chrome", "Windows").with_version("120").with_os_version("11");
        assert_eq!(b.to_string(), "chrome 120 on Windows 11");
    }
}
