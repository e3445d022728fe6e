//! Tunnel binary cache
//!
//! The vendor executable is downloaded once into the bin directory and
//! verified against a `.sha256` sidecar on every later use. Concurrent
//! callers in one process share a single download.

use crate::tunnel::TunnelFlavor;
use crossrun_common::archive::{self, ArchiveKind};
use crossrun_common::{Error, Result, Vendor};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct TunnelBinary {
    flavor: &'static TunnelFlavor,
    dir: PathBuf,
    source: Option<String>,
    http: reqwest::Client,
    ready: Mutex<Option<PathBuf>>,
}

impl TunnelBinary {
    pub fn new(vendor: Vendor, dir: PathBuf) -> Self {
        Self {
            flavor: TunnelFlavor::for_vendor(vendor),
            dir,
            source: None,
            http: reqwest::Client::new(),
            ready: Mutex::new(None),
        }
    }

    /// Download from `url` instead of the vendor's site
    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source = Some(url.into());
        self
    }

    /// Where the executable lives once installed
    pub fn path(&self) -> PathBuf {
        self.dir.join(self.flavor.executable_name())
    }

    fn sidecar(&self) -> PathBuf {
        self.dir
            .join(format!("{}.sha256", self.flavor.executable_name()))
    }

    fn url(&self) -> Result<String> {
        match &self.source {
            Some(url) => Ok(url.clone()),
            None => self.flavor.download_url().map(str::to_string).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "no {} tunnel download for {}",
                    self.flavor.vendor,
                    std::env::consts::OS
                ))
            }),
        }
    }

    /// Path to a verified executable, downloading it if needed
    pub async fn ensure(&self) -> Result<PathBuf> {
        let mut ready = self.ready.lock().await;
        if let Some(path) = ready.as_ref() {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let path = self.path();
        if path.exists() && self.verify(&path)? {
            *ready = Some(path.clone());
            return Ok(path);
        }

        self.download(&path).await?;
        *ready = Some(path.clone());
        Ok(path)
    }

    /// Check the cached file against its sidecar. A file without a sidecar
    /// was placed there by hand and is adopted as-is.
    fn verify(&self, path: &Path) -> Result<bool> {
        let actual = archive::compute_file_sha256(path)?;
        let sidecar = self.sidecar();

        let expected = match std::fs::read_to_string(&sidecar) {
            Ok(content) => archive::parse_sha256_file(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Adopting {:?} without digest", path);
                self.write_sidecar(&actual)?;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        if expected.as_deref() == Some(actual.as_str()) {
            Ok(true)
        } else {
            warn!(
                "Cached tunnel binary {:?} does not match its digest, downloading again",
                path
            );
            Ok(false)
        }
    }

    fn write_sidecar(&self, digest: &str) -> Result<()> {
        std::fs::write(
            self.sidecar(),
            format!("{}  {}\n", digest, self.flavor.executable_name()),
        )?;
        Ok(())
    }

    async fn download(&self, dest: &Path) -> Result<()> {
        let url = self.url()?;
        info!("Downloading {} tunnel from {}", self.flavor.vendor, url);

        let data = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let kind = ArchiveKind::from_url(&url);
        let entry = self.flavor.executable_name();
        let target = dest.to_path_buf();
        let installed = tokio::task::spawn_blocking(move || {
            archive::extract_executable(kind, &data, &entry, &target)
        })
        .await
        .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;

        let digest = archive::compute_file_sha256(&installed)?;
        self.write_sidecar(&digest)?;
        info!("Installed {:?} (sha256 {})", installed, digest);
        Ok(())
    }

    /// Delete the cached executable and its digest
    pub async fn remove(&self) -> Result<()> {
        let mut ready = self.ready.lock().await;
        *ready = None;
        for path in [self.path(), self.sidecar()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
