//! Tunnel Binary Commands

use anyhow::Result;
use clap::Subcommand;
use crossrun_common::{archive, Vendor};
use crossrun_engine::TunnelBinary;
use serde::Serialize;
use std::path::Path;

use crate::output::{print_item, print_message, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum BinaryCommands {
    /// Download the vendor's tunnel binary unless a verified copy is cached
    Ensure {
        /// Vendor (browserstack, saucelabs, crossbrowsertesting)
        vendor: String,

        /// Download from this URL instead of the vendor's
        #[arg(long)]
        source: Option<String>,
    },

    /// Show where the tunnel binary is cached
    Path {
        vendor: String,
    },

    /// Delete the cached tunnel binary
    Remove {
        vendor: String,
    },
}

/// Cached binary for display
#[derive(Serialize)]
pub struct BinaryDisplay {
    pub vendor: String,
    pub path: String,
    pub sha256: String,
}

impl TableDisplay for BinaryDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Vendor", "Path", "SHA256"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.vendor.clone(), self.path.clone(), self.sha256.clone()]
    }
}

fn binary_for(vendor: Vendor, config: Option<&Path>) -> Result<TunnelBinary> {
    let config = super::load_config_without_credentials(vendor, config)?;
    Ok(TunnelBinary::new(vendor, config.bin_path()))
}

pub async fn execute(cmd: BinaryCommands, config: Option<&Path>, format: OutputFormat) -> Result<()> {
    match cmd {
        BinaryCommands::Ensure { vendor, source } => {
            let vendor: Vendor = vendor.parse()?;
            let mut binary = binary_for(vendor, config)?;
            if let Some(url) = source {
                binary = binary.with_source(url);
            }
            let path = binary.ensure().await?;
            let sha256 = archive::compute_file_sha256(&path)?;
            print_item(
                &BinaryDisplay {
                    vendor: vendor.to_string(),
                    path: path.display().to_string(),
                    sha256,
                },
                format,
            );
        }

        BinaryCommands::Path { vendor } => {
            let vendor: Vendor = vendor.parse()?;
            let path = binary_for(vendor, config)?.path();
            print_message(&path.display().to_string(), format);
        }

        BinaryCommands::Remove { vendor } => {
            let vendor: Vendor = vendor.parse()?;
            binary_for(vendor, config)?.remove().await?;
            print_success(&format!("Removed cached {} tunnel binary", vendor));
        }
    }

    Ok(())
}
