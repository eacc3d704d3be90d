use std::path::Path;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use crate::core::{Result, UploadError};

/// Read block size used while hashing.
pub const FINGERPRINT_BLOCK_SIZE: usize = 64 * 1024;

/// Computes the hex SHA-256 digest of a file's full content.
///
/// The file is streamed in [`FINGERPRINT_BLOCK_SIZE`] blocks, so memory use
/// does not grow with file size. Any read failure, including one in the middle
/// of the scan, is reported as a file operation error.
pub async fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| UploadError::file_op(path, "open", e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FINGERPRINT_BLOCK_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| UploadError::file_op(path, "hash", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn fingerprint_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn identical_bytes_share_a_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        // Larger than one block so the streaming path is exercised.
        let data: Vec<u8> = (0..FINGERPRINT_BLOCK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("renamed copy.mp4");
        std::fs::write(&a, &data).unwrap();
        std::fs::write(&b, &data).unwrap();

        let fa = fingerprint_file(&a).await.unwrap();
        assert_eq!(fa, fingerprint_file(&a).await.unwrap());
        assert_eq!(fa, fingerprint_file(&b).await.unwrap());
        assert_eq!(fa, fingerprint_bytes(&data));
        assert_eq!(fa.len(), 64);
    }

    #[tokio::test]
    async fn different_bytes_differ() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        std::fs::write(&a, b"clip one").unwrap();
        std::fs::write(&b, b"clip two").unwrap();

        assert_ne!(fingerprint_file(&a).await.unwrap(), fingerprint_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_a_file_operation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint_file(&dir.path().join("gone.mp4")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOperation);
    }
}
