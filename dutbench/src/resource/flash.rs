//! Firmware flashing.

use {
    crate::{
        error::{Error, Result},
        resource::ResourceInfo,
    },
    log::{debug, info},
    sha2::{Digest, Sha256},
    std::{fs, io, path::Path},
};

/// Writes a binary to a resource.
pub trait Flasher: Send + Sync {
    /// Flash `binary` onto `target`. Returns `true` when the target changed.
    fn flash(&self, binary: &Path, target: &ResourceInfo) -> Result<bool>;

    /// Hash identifying the binary's content.
    fn content_hash(&self, binary: &Path) -> Result<String> {
        let mut file = fs::File::open(binary)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Flashes by copying the binary onto the board's mass-storage mount point.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFlasher;

impl Flasher for CopyFlasher {
    fn flash(&self, binary: &Path, target: &ResourceInfo) -> Result<bool> {
        let mount = target.mount_point.as_deref().ok_or_else(|| {
            Error::ResourceInit(format!("{} has no mount point to flash", target.resource_id))
        })?;
        let file_name = binary.file_name().ok_or_else(|| {
            Error::ResourceInit(format!("{} is not a file", binary.display()))
        })?;
        let destination = mount.join(file_name);
        info!(
            "Flashing {} to {} ({})",
            binary.display(),
            target.resource_id,
            destination.display()
        );
        fs::copy(binary, &destination).map_err(|e| {
            Error::ResourceInit(format!(
                "flashing {} to {} failed: {e}",
                binary.display(),
                target.resource_id
            ))
        })?;
        Ok(true)
    }
}

/// Whether a target last flashed with `last_hash` needs `target_hash`.
pub fn flash_needed(last_hash: Option<&str>, target_hash: &str, force: bool) -> bool {
    if force {
        debug!("Forced flash");
        return true;
    }
    last_hash != Some(target_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fw.bin");
        fs::write(&bin, b"abc").unwrap();
        let hash = CopyFlasher.content_hash(&bin).unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_flash_needed() {
        assert!(flash_needed(None, "aa", false));
        assert!(!flash_needed(Some("aa"), "aa", false));
        assert!(flash_needed(Some("aa"), "aa", true));
        assert!(flash_needed(Some("bb"), "aa", false));
    }

    #[test]
    fn test_copy_flasher() {
        let source = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        let bin = source.path().join("fw.bin");
        fs::write(&bin, b"image").unwrap();
        let target = ResourceInfo::new("0240").with_mount_point(mount.path());
        assert!(CopyFlasher.flash(&bin, &target).unwrap());
        assert_eq!(fs::read(mount.path().join("fw.bin")).unwrap(), b"image");
        assert!(CopyFlasher.flash(&bin, &ResourceInfo::new("x")).is_err());
    }
}
