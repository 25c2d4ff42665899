//! Compiled compute-kernel binaries.
//!
//! A kernel is an opaque sequence of 32-bit SPIR-V words. Nothing here parses
//! or validates the words; they are handed to the driver unchanged.

use std::fs;
use std::path::{Path, PathBuf};

/// Error raised while loading a kernel binary from disk.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Failed opening kernel {path:?} for reading: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Kernel binary is empty")]
    Empty,
}

/// A pre-compiled compute kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBinary {
    words: Vec<u32>,
}

impl KernelBinary {
    /// Wrap words already in memory (e.g. embedded at build time).
    pub fn from_words(words: Vec<u32>) -> Result<Self, KernelError> {
        if words.is_empty() {
            return Err(KernelError::Empty);
        }
        Ok(Self { words })
    }

    /// Reinterpret raw bytes as native-endian words.
    ///
    /// A trailing partial word is zero-padded.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KernelError> {
        let mut words = vec![0u32; bytes.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        Self::from_words(words)
    }

    /// Read a kernel binary file into memory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| KernelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded kernel {:?} ({} bytes)", path, bytes.len());
        Self::from_bytes(&bytes)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Size of the binary in bytes, as passed to the driver.
    pub fn byte_len(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }
}

impl From<KernelBinary> for Vec<u32> {
    fn from(kernel: KernelBinary) -> Self {
        kernel.words
    }
}
