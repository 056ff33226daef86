use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Length of the hash prefix used in emitted file names.
pub const SHORT_HASH_LEN: usize = 8;

/// Compute the BLAKE3 hash of a file, returning the hex-encoded digest.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn blake3_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hash an ordered sequence of parts.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// produce different digests.
#[must_use]
pub fn blake3_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_hex().to_string()
}

/// First [`SHORT_HASH_LEN`] characters of a hex digest.
#[must_use]
pub fn short(hex: &str) -> &str {
    &hex[..hex.len().min(SHORT_HASH_LEN)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_blake3_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let hash = blake3_file(file.path()).unwrap();

        // Known BLAKE3 hash of "hello world"
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_blake3_bytes_matches_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"export const x = 1;").unwrap();
        file.flush().unwrap();

        assert_eq!(
            blake3_file(file.path()).unwrap(),
            blake3_bytes(b"export const x = 1;")
        );
    }

    #[test]
    fn test_blake3_parts_is_boundary_sensitive() {
        assert_ne!(blake3_parts(["ab", "c"]), blake3_parts(["a", "bc"]));
        assert_eq!(blake3_parts(["a", "b"]), blake3_parts(["a", "b"]));
    }

    #[test]
    fn test_short() {
        let hash = blake3_bytes(b"x");
        assert_eq!(short(&hash).len(), SHORT_HASH_LEN);
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_blake3_file_not_found() {
        let result = blake3_file(Path::new("/nonexistent/file"));
        assert!(result.is_err());
    }
}
