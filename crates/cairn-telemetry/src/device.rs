//! Device identity
//!
//! The device id stamped into every record (`context.did`) and sent with each
//! batch. The default provider derives it from a salted hash of the machine's
//! MAC address, so it is stable per install but not linkable across installs.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::get_telemetry_dir;

/// Source of the device id
pub trait DeviceInfo: Send + Sync {
    fn device_id(&self) -> String;
}

/// Device id backed by a cached, salted machine hash
#[derive(Debug, Clone)]
pub struct LocalDeviceInfo {
    device_id: String,
}

impl LocalDeviceInfo {
    /// Load the cached id from the user telemetry dir, generating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&get_telemetry_dir()?)
    }

    /// Load or generate the id under an explicit state directory
    pub fn load_from(dir: &Path) -> Result<Self> {
        Ok(Self {
            device_id: get_or_generate_device_id(dir)?,
        })
    }
}

impl DeviceInfo for LocalDeviceInfo {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

/// Get or generate the anonymous device id stored in `dir`
///
/// The id is a SHA256 hash of:
/// - MAC address (or hostname as fallback)
/// - Random UUID salt (stored beside the id)
pub fn get_or_generate_device_id(dir: &Path) -> Result<String> {
    fs::create_dir_all(dir)?;
    let device_id_path = dir.join("device_id");

    if let Some(id) = read_trimmed(&device_id_path) {
        return Ok(id);
    }

    let device_id = generate_device_id(dir)?;
    fs::write(&device_id_path, &device_id)
        .with_context(|| format!("Failed to write {}", device_id_path.display()))?;
    tracing::debug!(path = %device_id_path.display(), "generated device id");

    Ok(device_id)
}

fn generate_device_id(dir: &Path) -> Result<String> {
    let machine_identifier = get_machine_identifier();
    let salt = get_or_create_salt(dir)?;

    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(machine_identifier.as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

/// Stable machine identifier: MAC address, hostname, or a random UUID
fn get_machine_identifier() -> String {
    if let Ok(Some(mac)) = mac_address::get_mac_address() {
        return mac.to_string();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(hostname) = hostname.to_str() {
            if !hostname.is_empty() {
                return hostname.to_string();
            }
        }
    }

    // Not stable across runs, the cached id covers that
    Uuid::new_v4().to_string()
}

fn get_or_create_salt(dir: &Path) -> Result<String> {
    let salt_path: PathBuf = dir.join("salt");

    if let Some(salt) = read_trimmed(&salt_path) {
        return Ok(salt);
    }

    let salt = Uuid::new_v4().to_string();
    fs::write(&salt_path, &salt).context("Failed to write salt file")?;

    Ok(salt)
}

fn read_trimmed(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_device_id_is_stable() {
        let dir = TempDir::new().unwrap();
        let id1 = get_or_generate_device_id(dir.path()).unwrap();
        let id2 = get_or_generate_device_id(dir.path()).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_salt_makes_ids_unlinkable() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();

        let id1 = get_or_generate_device_id(first.path()).unwrap();
        let id2 = get_or_generate_device_id(second.path()).unwrap();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_cached_id_wins() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("device_id"), "cached-id\n").unwrap();

        let info = LocalDeviceInfo::load_from(dir.path()).unwrap();
        assert_eq!(info.device_id(), "cached-id");
    }
}
