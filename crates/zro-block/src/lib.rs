#![forbid(unsafe_code)]
//! Block layer of the zro read path.
//!
//! Provides the byte/block device traits, the [`Page`] frame shared by every
//! cache, the [`PageCache`] abstraction, the [`BlockMetaAccessor`] used by
//! the extent resolver and the [`BlockReader`] used to submit batched reads
//! of compressed clusters.

pub mod cache;
pub mod meta;
pub mod page;
pub mod reader;

pub use cache::{MemPageCache, PageCache};
pub use meta::BlockMetaAccessor;
pub use page::{MappingId, Page, PageOwner, PagePool};
pub use reader::{
    BlockReader, DeviceBlockReader, ReadCallback, ReadCompletion, ReadRequest, ReaderStats,
    ThreadedBlockReader,
};

use parking_lot::RwLock;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use zro_error::{Result, ZroError};
use zro_types::{BLOCK_SIZE, BlockNumber};

/// Byte-addressed, read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| ZroError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| ZroError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(ZroError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device, mainly for images built in tests.
#[derive(Debug, Default)]
pub struct MemByteDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Overwrite part of the image (test fixtures corrupting records).
    pub fn patch(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| ZroError::Format("range overflow".into()))?;
        let mut image = self.bytes.write();
        if end > image.len() {
            return Err(ZroError::Format("patch out of bounds".into()));
        }
        image[offset..end].copy_from_slice(bytes);
        drop(image);
        Ok(())
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset =
            usize::try_from(offset).map_err(|_| ZroError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| ZroError::Format("range overflow".into()))?;
        let bytes = self.bytes.read();
        if end > bytes.len() {
            return Err(ZroError::Format(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[offset..end]);
        drop(bytes);
        Ok(())
    }
}

/// Block-addressed, read-only device with [`BLOCK_SIZE`] blocks.
pub trait BlockDevice: Send + Sync {
    /// Read block `block` into `buf` (`buf.len()` MUST equal [`BLOCK_SIZE`]).
    fn read_block_into(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size = BLOCK_SIZE as u64;
        let remainder = len % block_size;
        if remainder != 0 {
            return Err(ZroError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_count: len / block_size,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block_into(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(ZroError::Format(format!(
                "read_block buffer size mismatch: got={} expected={BLOCK_SIZE}",
                buf.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(ZroError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let offset = block
            .to_byte_offset()
            .ok_or_else(|| ZroError::Format("block offset overflow".to_owned()))?;
        self.inner.read_exact_at(offset, buf)
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK_SIZE)
            .map(|i| u8::try_from(i / BLOCK_SIZE).unwrap_or(0xFF))
            .collect()
    }

    #[test]
    fn byte_block_device_reads_blocks() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(image(4))).expect("device");
        assert_eq!(dev.block_count(), 4);

        let mut buf = vec![0_u8; BLOCK_SIZE];
        dev.read_block_into(BlockNumber(2), &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 2));

        let err = dev
            .read_block_into(BlockNumber(4), &mut buf)
            .expect_err("out of range");
        assert!(matches!(err, ZroError::Format(_)));
    }

    #[test]
    fn unaligned_image_is_rejected() {
        let err = ByteBlockDevice::new(MemByteDevice::new(vec![0; BLOCK_SIZE + 1]))
            .expect_err("unaligned");
        assert!(err.to_string().contains("not block-aligned"));
    }

    #[test]
    fn patch_rewrites_bytes() {
        let dev = MemByteDevice::new(vec![0; 16]);
        dev.patch(4, &[9, 9]).expect("patch");
        let mut buf = [0_u8; 3];
        dev.read_exact_at(3, &mut buf).expect("read");
        assert_eq!(buf, [0, 9, 9]);
        assert!(dev.patch(15, &[1, 2]).is_err());
    }

    #[test]
    fn file_byte_device_reads() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&image(2)).expect("write image");
        tmp.flush().expect("flush");

        let dev = ByteBlockDevice::new(FileByteDevice::open(tmp.path()).expect("open"))
            .expect("device");
        let mut buf = vec![0_u8; BLOCK_SIZE];
        dev.read_block_into(BlockNumber(1), &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 1));
        assert!(dev.inner().read_exact_at(2 * BLOCK_SIZE as u64, &mut buf).is_err());
    }
}
