/// File digests for file-reference inputs
///
/// Files are hashed by what they contain (or, with the timestamp method, by
/// mtime and size), never by where they live, so moving or copying an input
/// keeps its fingerprint while editing it does not.
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Stream the file through SHA-256 without loading it whole
pub fn hash_file_content(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    if file.metadata()?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "is a directory, not a file",
        ));
    }

    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest of modification time and size
pub fn hash_file_stamp(path: &Path) -> io::Result<String> {
    let metadata = fs::metadata(path)?;
    if metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "is a directory, not a file",
        ));
    }

    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut hasher = Sha256::new();
    hasher.update(mtime.as_nanos().to_le_bytes());
    hasher.update(metadata.len().to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_content_ignores_location() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.nii");
        fs::create_dir(temp.path().join("moved")).unwrap();
        let b = temp.path().join("moved/b.nii");
        fs::write(&a, "voxels").unwrap();
        fs::write(&b, "voxels").unwrap();

        assert_eq!(hash_file_content(&a).unwrap(), hash_file_content(&b).unwrap());

        fs::write(&b, "edited voxels").unwrap();
        assert_ne!(hash_file_content(&a).unwrap(), hash_file_content(&b).unwrap());
    }

    #[test]
    fn test_hash_larger_than_buffer() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        let data = vec![7u8; READ_BUFFER_SIZE * 3 + 11];
        fs::write(&path, &data).unwrap();

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(hash_file_content(&path).unwrap(), expected);
    }

    #[test]
    fn test_directories_and_missing_files_fail() {
        let temp = TempDir::new().unwrap();
        assert!(hash_file_content(temp.path()).is_err());
        assert!(hash_file_stamp(temp.path()).is_err());
        assert!(hash_file_content(&temp.path().join("missing")).is_err());
    }
}
