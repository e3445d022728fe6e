//! Tunnel binary archives
//!
//! Vendors ship their tunnel executables as zip or tar.gz downloads. This
//! module pulls the one executable we need out of such an archive and
//! provides the digest helpers used to verify the cached copy.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Archive format of a vendor download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    /// The download is the executable itself
    Raw,
}

impl ArchiveKind {
    /// Guess the format from a download URL
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.ends_with(".zip") {
            ArchiveKind::Zip
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else {
            ArchiveKind::Raw
        }
    }
}

/// Extract the entry whose file name is `entry_name` into `dest` and mark
/// it executable. Returns `dest`.
pub fn extract_executable(
    kind: ArchiveKind,
    data: &[u8],
    entry_name: &str,
    dest: &Path,
) -> Result<PathBuf> {
    let bytes = match kind {
        ArchiveKind::Raw => data.to_vec(),
        ArchiveKind::Zip => read_zip_entry(data, entry_name)?,
        ArchiveKind::TarGz => read_tar_entry(data, entry_name)?,
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write next to the destination and rename so a concurrent reader never
    // sees a half-written executable.
    let tmp = dest.with_extension("partial");
    {
        let mut out = File::create(&tmp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
    }
    set_executable(&tmp)?;
    std::fs::rename(&tmp, dest)?;

    debug!("Extracted {} ({} bytes) to {:?}", entry_name, bytes.len(), dest);
    Ok(dest.to_path_buf())
}

fn check_entry_path(name: &str) -> Result<()> {
    if Path::new(name)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Archive(format!("path traversal in entry {}", name)));
    }
    Ok(())
}

fn matches_entry(path: &Path, entry_name: &str) -> bool {
    path.file_name().is_some_and(|n| n == entry_name)
}

fn read_zip_entry(data: &[u8], entry_name: &str) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        check_entry_path(&name)?;

        if !file.is_dir() && matches_entry(Path::new(&name), entry_name) {
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }

    Err(Error::Archive(format!("{} not found in zip archive", entry_name)))
}

fn read_tar_entry(data: &[u8], entry_name: &str) -> Result<Vec<u8>> {
    let gz = flate2::read::GzDecoder::new(Cursor::new(data));
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        check_entry_path(&entry_path.to_string_lossy())?;

        if entry.header().entry_type().is_file() && matches_entry(&entry_path, entry_name) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }

    Err(Error::Archive(format!("{} not found in tarball", entry_name)))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Parse a .sha256 file, supporting formats:
/// - "<hash>  <filename>"
/// - "<hash>"
pub fn parse_sha256_file(content: &str) -> Option<String> {
    let line = content.lines().next()?.trim();
    let hash = line.split_whitespace().next()?;
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_lowercase())
    } else {
        None
    }
}

/// Compute SHA256 hash of data
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA256 hash of a file
pub fn compute_file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
