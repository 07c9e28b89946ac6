// SPDX-License-Identifier: CEPL-1.0
use std::path::{Path, PathBuf};
use std::{fs, io};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to read shader `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("shader `{}` is empty", path.display())]
    Empty { path: PathBuf },
    #[error("shader `{}` is {len} bytes, not a whole number of 32-bit words", path.display())]
    Misaligned { path: PathBuf, len: usize },
}

/// Compiled shader bytecode, kept opaque. Only the length is checked.
#[derive(Clone, Debug)]
pub struct ShaderBlob {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl ShaderBlob {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShaderError> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path).map_err(|source| ShaderError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("shader {} -> {} bytes", path.display(), bytes.len());
        Self::from_bytes(path, bytes)
    }

    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<Self, ShaderError> {
        let path = path.into();
        if bytes.is_empty() {
            return Err(ShaderError::Empty { path });
        }
        if bytes.len() % 4 != 0 {
            return Err(ShaderError::Misaligned {
                path,
                len: bytes.len(),
            });
        }
        Ok(Self { path, bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lumen-shader-tests-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_bytes_verbatim() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 1, 2, 3, 4];
        let path = scratch_file("ok.spv", &bytes);
        let blob = ShaderBlob::load(&path).unwrap();
        assert_eq!(blob.bytes(), &bytes);
        assert_eq!(blob.len(), 8);
        assert_eq!(blob.path(), path.as_path());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ShaderBlob::load("does/not/exist.spv").unwrap_err();
        assert!(matches!(err, ShaderError::Io { .. }));
        assert!(err.to_string().contains("does/not/exist.spv"));
    }

    #[test]
    fn rejects_empty_and_misaligned_blobs() {
        let empty = scratch_file("empty.spv", &[]);
        assert!(matches!(
            ShaderBlob::load(&empty),
            Err(ShaderError::Empty { .. })
        ));

        let err = ShaderBlob::from_bytes("odd.spv", vec![0; 6]).unwrap_err();
        assert!(matches!(err, ShaderError::Misaligned { len: 6, .. }));
    }
}
