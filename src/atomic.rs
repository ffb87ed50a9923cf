/// All-or-nothing file writes
///
/// Data is written to a temporary file next to the destination, synced, and
/// renamed into place. Readers observe either the previous file or the
/// complete new one; a failure at any step leaves no partial file behind
/// (the temporary is removed when dropped).
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(data))
}

/// Like [`write_atomic`], streaming the content through `fill`
pub fn write_atomic_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    fill(temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/file.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_failed_fill_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifact.json");

        let result = write_atomic_with(&path, |file| {
            file.write_all(b"{\"partial\":")?;
            Err(io::Error::other("interrupted"))
        });

        assert!(result.is_err());
        assert!(!path.exists());
        // Only the destination directory itself remains, no stray temporaries
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
