//! Streams a file's bytes through an incremental hasher and renders the result as a
//! 64-character lowercase hex digest. Pure function of file contents.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum DigestError {
    Io(io::Error),
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::Io(e) => write!(f, "digest: {e}"),
        }
    }
}

impl std::error::Error for DigestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DigestError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for DigestError {
    fn from(e: io::Error) -> Self {
        DigestError::Io(e)
    }
}

/// Computes the content digest of `path`, reading in ~1 MiB chunks so arbitrarily large
/// files need not be resident in memory.
pub fn digest_file(path: &Path) -> Result<String, DigestError> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
