//! Tunnel Commands

use anyhow::Result;
use clap::Args;
use crossrun_common::Vendor;
use crossrun_engine::tunnel::{Manager, TunnelFlavor, TunnelInfo};
use crossrun_engine::TunnelBinary;
use serde::Serialize;
use std::path::Path;

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct TunnelsArgs {
    /// Vendor whose tunnels to list
    #[arg(long, env = "CROSSRUN_VENDOR")]
    pub vendor: String,

    /// Only tunnels started with an identifier
    #[arg(long, conflicts_with = "anonymous")]
    pub identified: bool,

    /// Only tunnels started without an identifier
    #[arg(long)]
    pub anonymous: bool,
}

/// Tunnel process for display; secrets are masked
#[derive(Serialize)]
pub struct TunnelDisplay {
    pub pid: u32,
    pub identifier: Option<String>,
    pub command: String,
}

impl TunnelDisplay {
    fn new(flavor: &TunnelFlavor, binary: &str, info: TunnelInfo) -> Self {
        Self {
            pid: info.pid,
            command: flavor.redacted_command(binary, &info.args),
            identifier: info.identifier,
        }
    }
}

impl TableDisplay for TunnelDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["PID", "Identifier", "Command"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.pid.to_string(),
            self.identifier.clone().unwrap_or_else(|| "-".to_string()),
            self.command.clone(),
        ]
    }
}

pub async fn execute(args: TunnelsArgs, config: Option<&Path>, format: OutputFormat) -> Result<()> {
    let vendor: Vendor = args.vendor.parse()?;
    let config = super::load_config_without_credentials(vendor, config)?;
    let binary = config
        .tunnel
        .binary_path
        .clone()
        .unwrap_or_else(|| TunnelBinary::new(vendor, config.bin_path()).path());

    let flavor = TunnelFlavor::for_vendor(vendor);
    let manager = Manager::new(flavor, &binary);
    let found = if args.identified {
        manager.with_id().await?
    } else if args.anonymous {
        manager.without_id().await?
    } else {
        manager.running().await?
    };

    let name = flavor.executable_name();
    let displays: Vec<TunnelDisplay> = found
        .into_iter()
        .map(|info| TunnelDisplay::new(flavor, &name, info))
        .collect();
    print_list(&displays, format);
    Ok(())
}
