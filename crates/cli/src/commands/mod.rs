//! CLI Commands

pub mod binary;
pub mod run;
pub mod tunnels;

use anyhow::{Context, Result};
use crossrun_common::Vendor;
use crossrun_engine::{Credentials, EngineConfig};
use std::path::Path;

/// Engine configuration from `path` if given, else defaults with the
/// vendor's credentials taken from the environment.
pub fn load_config(vendor: Vendor, path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let credentials = Credentials::from_env(vendor)?;
            Ok(EngineConfig::new(credentials))
        }
    }
}

/// Configuration for commands that never authenticate
pub fn load_config_without_credentials(vendor: Vendor, path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(_) => load_config(vendor, path),
        None => Ok(EngineConfig::new(
            Credentials::from_env(vendor).unwrap_or_else(|_| Credentials::new("", "")),
        )),
    }
}
