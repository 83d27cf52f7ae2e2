use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::utils::error::AppResult;

/// Sibling temp file for `path`: the full file name plus `.tmp`, so files
/// sharing a stem never share a temp file.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replace `path` with `contents` via a temp file and rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    let tmp = temp_path(path);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_keeps_the_extension() {
        assert_eq!(temp_path(Path::new("/var/lib/state.bin")), PathBuf::from("/var/lib/state.bin.tmp"));
        assert_ne!(temp_path(Path::new("state.bin")), temp_path(Path::new("state.json")));
    }

    #[test]
    fn write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert!(!temp_path(&path).exists());
    }
}
