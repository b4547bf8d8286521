//! Cluster decompressors.
//!
//! A physical cluster is either stored verbatim ([`ClusterFormat::Plain`])
//! or holds one LZ4 block right-aligned in the cluster, preceded by zero
//! padding ([`ClusterFormat::Lz4`]).

use lz4_flex::block::DecompressError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zro_error::{Result, ZroError};
use zro_types::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterFormat {
    Plain,
    Lz4,
}

impl ClusterFormat {
    #[must_use]
    pub fn from_compressed(compressed: bool) -> Self {
        if compressed { Self::Lz4 } else { Self::Plain }
    }
}

/// Turns the raw bytes of one physical cluster into logical bytes.
pub trait Decompressor: Send + Sync + fmt::Debug {
    fn format(&self) -> ClusterFormat;

    /// Fill all of `out` with the first `out.len()` logical bytes of the
    /// cluster `input`.
    fn decompress(&self, input: &[u8], out: &mut [u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCopy;

impl Decompressor for PlainCopy {
    fn format(&self) -> ClusterFormat {
        ClusterFormat::Plain
    }

    fn decompress(&self, input: &[u8], out: &mut [u8]) -> Result<()> {
        let src = input.get(..out.len()).ok_or_else(|| {
            ZroError::Format(format!(
                "plain cluster holds {} bytes, {} requested",
                input.len(),
                out.len()
            ))
        })?;
        out.copy_from_slice(src);
        Ok(())
    }
}

/// LZ4 block decompression via `lz4_flex`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Decompressor;

impl Lz4Decompressor {
    fn decode_err(err: &DecompressError) -> ZroError {
        ZroError::Format(format!("lz4 cluster: {err}"))
    }

    /// Decode a block that produces more than `out.len()` bytes.
    fn decompress_prefix(src: &[u8], out: &mut [u8]) -> Result<()> {
        let limit = src
            .len()
            .saturating_mul(255)
            .saturating_add(PAGE_SIZE)
            .max(out.len());
        let mut capacity = out.len().saturating_mul(2).max(PAGE_SIZE);
        loop {
            let mut buf = vec![0_u8; capacity];
            match lz4_flex::block::decompress_into(src, &mut buf) {
                Ok(written) => {
                    let n = written.min(out.len());
                    out[..n].copy_from_slice(&buf[..n]);
                    out[n..].fill(0);
                    return Ok(());
                }
                Err(DecompressError::OutputTooSmall { .. }) if capacity < limit => {
                    capacity = capacity.saturating_mul(2).min(limit);
                }
                Err(err) => return Err(Self::decode_err(&err)),
            }
        }
    }
}

impl Decompressor for Lz4Decompressor {
    fn format(&self) -> ClusterFormat {
        ClusterFormat::Lz4
    }

    fn decompress(&self, input: &[u8], out: &mut [u8]) -> Result<()> {
        let start = input
            .iter()
            .position(|b| *b != 0)
            .ok_or_else(|| ZroError::Format("lz4 cluster holds only padding".into()))?;
        let src = &input[start..];
        match lz4_flex::block::decompress_into(src, out) {
            Ok(written) => {
                // A short final extent decodes to fewer bytes than the window.
                out[written..].fill(0);
                Ok(())
            }
            Err(DecompressError::OutputTooSmall { .. }) => Self::decompress_prefix(src, out),
            Err(err) => Err(Self::decode_err(&err)),
        }
    }
}

/// Decompressor per cluster format.
#[derive(Debug, Clone)]
pub struct DecompressorRegistry {
    by_format: HashMap<ClusterFormat, Arc<dyn Decompressor>>,
}

impl Default for DecompressorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_format: HashMap::new(),
        };
        registry.register(Arc::new(PlainCopy));
        registry.register(Arc::new(Lz4Decompressor));
        registry
    }
}

impl DecompressorRegistry {
    /// Install `decompressor`, replacing any previous one for its format.
    pub fn register(&mut self, decompressor: Arc<dyn Decompressor>) {
        self.by_format.insert(decompressor.format(), decompressor);
    }

    pub fn get(&self, format: ClusterFormat) -> Result<&Arc<dyn Decompressor>> {
        self.by_format
            .get(&format)
            .ok_or_else(|| ZroError::NotSupported(format!("no decompressor for {format:?}")))
    }
}
