use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{DigestAlgorithm, ExpectedDigest};
use crate::error::ScenarioLinkError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Streams `path` through the digest and returns lowercase hex.
pub fn compute(path: &Path, algorithm: DigestAlgorithm) -> Result<String, ScenarioLinkError> {
    let file = File::open(path)
        .map_err(|err| ScenarioLinkError::Storage(format!("open {}: {err}", path.display())))?;
    let reader = BufReader::with_capacity(CHUNK_SIZE, file);
    match algorithm {
        DigestAlgorithm::Md5 => hash_reader::<Md5, _>(reader, path),
        DigestAlgorithm::Sha256 => hash_reader::<Sha256, _>(reader, path),
    }
}

/// True when the file's digest equals `expected`. A mismatch is not an
/// error; only an unreadable file is.
pub fn verify(path: &Path, expected: &ExpectedDigest) -> Result<bool, ScenarioLinkError> {
    let actual = compute(path, expected.algorithm)?;
    let matches = actual == expected.hex;
    if matches {
        debug!(file = %path.display(), digest = %expected, "checksum verified");
    } else {
        warn!(file = %path.display(), expected = %expected, actual = %actual, "checksum mismatch");
    }
    Ok(matches)
}

fn hash_reader<D: Digest, R: Read>(mut reader: R, path: &Path) -> Result<String, ScenarioLinkError> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| ScenarioLinkError::Storage(format!("read {}: {err}", path.display())))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn md5_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fragment.zip");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = compute(&path, DigestAlgorithm::Md5).unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn verify_is_case_insensitive_and_reports_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fragment.zip");
        std::fs::write(&path, b"hello world").unwrap();

        let upper: ExpectedDigest = "md5:5EB63BBBE01EEED093CB22BB8F5ACDC3".parse().unwrap();
        assert!(verify(&path, &upper).unwrap());

        let other: ExpectedDigest = "md5:00000000000000000000000000000000".parse().unwrap();
        assert!(!verify(&path, &other).unwrap());
    }

    #[test]
    fn sha256_larger_than_one_chunk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("big.bin");
        std::fs::write(&path, vec![0u8; CHUNK_SIZE * 3 + 17]).unwrap();
        let streamed = compute(&path, DigestAlgorithm::Sha256).unwrap();
        let direct = hex::encode(Sha256::digest(vec![0u8; CHUNK_SIZE * 3 + 17]));
        assert_eq!(streamed, direct);
    }

    #[test]
    fn unreadable_file_is_storage_error() {
        let temp = tempfile::tempdir().unwrap();
        let expected: ExpectedDigest = "md5:5eb63bbbe01eeed093cb22bb8f5acdc3".parse().unwrap();
        let err = verify(&temp.path().join("missing.zip"), &expected).unwrap_err();
        assert_matches!(err, ScenarioLinkError::Storage(_));
    }
}
