//! Write-then-rename file replacement

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `contents`.
///
/// The data goes to a temporary file in the same directory and is renamed
/// over the target, so readers see either the old file or the new one, never
/// a truncated mix.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_ref())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("weather.csv");

        write_atomic(&path, "time,rain\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "time,rain\n");

        write_atomic(&path, "time,cloudcover\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "time,cloudcover\n");

        // Only the target remains, no temp files
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_failed_replace_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("report.md");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep.txt"), "previous").unwrap();

        assert!(write_atomic(&target, "new").is_err());
        assert!(target.is_dir());
        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "previous");

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
