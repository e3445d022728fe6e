//! Discovery of tunnel processes already running on this machine

use super::flavor::TunnelFlavor;
use crossrun_common::{Error, Result};
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tracing::trace;

/// A tunnel process found in the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub pid: u32,
    /// Arguments after the tunnel executable
    pub args: Vec<String>,
    pub identifier: Option<String>,
}

/// Lists processes running a given tunnel executable
pub struct Manager {
    flavor: &'static TunnelFlavor,
    binary_name: OsString,
}

impl Manager {
    /// Matches processes whose executable has the same file name as `binary`
    pub fn new(flavor: &'static TunnelFlavor, binary: &Path) -> Self {
        let binary_name = binary
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from(flavor.executable_name()));
        Self {
            flavor,
            binary_name,
        }
    }

    pub async fn running(&self) -> Result<Vec<TunnelInfo>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .await
            .map_err(|e| Error::ProcessLifecycle(format!("failed to list processes: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ProcessLifecycle(format!(
                "ps exited with {}",
                output.status
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let found = self.parse_listing(&listing);
        trace!("{} running {:?} processes", found.len(), self.binary_name);
        Ok(found)
    }

    pub async fn with_id(&self) -> Result<Vec<TunnelInfo>> {
        Ok(self
            .running()
            .await?
            .into_iter()
            .filter(|t| t.identifier.is_some())
            .collect())
    }

    pub async fn without_id(&self) -> Result<Vec<TunnelInfo>> {
        Ok(self
            .running()
            .await?
            .into_iter()
            .filter(|t| t.identifier.is_none())
            .collect())
    }

    /// Parse `ps -eo pid=,args=` output. Scripts show up as
    /// `/bin/sh /path/to/binary ...`, so the executable may be any token.
    pub fn parse_listing(&self, listing: &str) -> Vec<TunnelInfo> {
        listing
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                let pid = tokens.next()?.parse::<u32>().ok()?;
                let argv: Vec<&str> = tokens.collect();

                let exe = argv.iter().position(|token| {
                    Path::new(token)
                        .file_name()
                        .is_some_and(|name| name == self.binary_name.as_os_str())
                })?;

                let args: Vec<String> = argv[exe + 1..].iter().map(|s| s.to_string()).collect();
                let identifier = TunnelFlavor::flag_value(&args, self.flavor.identifier_flag)
                    .map(str::to_string);
                Some(TunnelInfo {
                    pid,
                    args,
                    identifier,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossrun_common::Vendor;

    const LISTING: &str = "\
    1 /sbin/init
  412 /opt/crossrun/bin/sc --user a --api-key k --tunnel-identifier build-9 --se-port 4446
  413 /bin/sh /tmp/t/sc --user a --api-key k
  414 vim sc.log
  500 /usr/bin/scp file host:
";

    fn manager() -> Manager {
        Manager::new(
            TunnelFlavor::for_vendor(Vendor::SauceLabs),
            Path::new("/opt/crossrun/bin/sc"),
        )
    }

    #[test]
    fn test_parse_listing() {
        let found = manager().parse_listing(LISTING);
        assert_eq!(found.len(), 2);

        assert_eq!(found[0].pid, 412);
        assert_eq!(found[0].identifier.as_deref(), Some("build-9"));
        assert_eq!(found[0].args[0], "--user");

        assert_eq!(found[1].pid, 413);
        assert_eq!(found[1].identifier, None);
    }

    #[test]
    fn test_ignores_garbage_lines() {
        let found = manager().parse_listing("\n  PID ARGS\nnot-a-pid sc\n");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_no_match_for_unique_name() {
        let manager = Manager::new(
            TunnelFlavor::for_vendor(Vendor::SauceLabs),
            Path::new("/nowhere/sc-that-never-runs-0f3a"),
        );
        assert!(manager.running().await.unwrap().is_empty());
    }
}
