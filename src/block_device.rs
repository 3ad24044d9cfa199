/*
 * This file is part of blockfs.
 *
 * blockfs is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * blockfs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * blockfs. If not, see <https://www.gnu.org/licenses/>.
 */

//! The fixed-block byte container the engine is built on.
//!
//! The core never reaches below this trait: it only ever reads, writes and
//! syncs whole blocks. Two implementations are provided — a real file on
//! disk, and an in-memory buffer used by the test suite so it does not pay
//! for filesystem I/O on every assertion.

use crate::error::{FsError, FsResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size in bytes of a single block. Fixed for the lifetime of an image.
pub const BLOCK_SIZE: usize = 512;

/// A block-granular byte container backing a mounted filesystem.
///
/// Block indices are 0-based across the entire device.
pub trait BlockDevice {
    /// Reads exactly `BLOCK_SIZE` bytes from block `block` into `buf`.
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()>;

    /// Writes exactly `BLOCK_SIZE` bytes from `buf` to block `block`.
    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()>;

    /// Durably flushes pending writes to the backing medium.
    fn sync(&mut self) -> FsResult<()>;

    /// Total number of addressable blocks on the device.
    fn block_count(&self) -> u32;

    /// Total size of the device in bytes.
    fn size(&self) -> u64 {
        self.block_count() as u64 * BLOCK_SIZE as u64
    }

    fn check_range(&self, block: u32) -> FsResult<()> {
        if block >= self.block_count() {
            return Err(FsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block {block} out of range (device has {} blocks)", self.block_count()),
            )));
        }
        Ok(())
    }
}

/// A [`BlockDevice`] backed by a real file on disk.
///
/// Mirrors `attach`/`detach` from the spec: [`FileBlockDevice::create`]
/// truncates/extends the backing file and treats it as empty,
/// [`FileBlockDevice::open`] opens an existing image and infers its size.
/// A backing length that is not a multiple of `BLOCK_SIZE` leaves the
/// trailing partial block invisible to callers, per contract.
pub struct FileBlockDevice {
    file: File,
    blocks: u32,
    name: String,
}

impl FileBlockDevice {
    /// Truncates or extends the file at `path` to `size` bytes and treats
    /// it as a freshly empty device. `size` must be a multiple of
    /// `BLOCK_SIZE`.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        Ok(Self {
            file,
            blocks: (size / BLOCK_SIZE as u64) as u32,
            name: path.as_ref().display().to_string(),
        })
    }

    /// Opens an existing image file, inferring its block count from its
    /// length on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            blocks: (len / BLOCK_SIZE as u64) as u32,
            name: path.as_ref().display().to_string(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.name
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        self.check_range(block)?;
        self.file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        self.check_range(block)?;
        self.file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> FsResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }
}

/// An in-memory [`BlockDevice`], used by the test suite.
#[derive(Debug)]
pub struct MemBlockDevice {
    data: Vec<u8>,
    blocks: u32,
}

impl MemBlockDevice {
    pub fn new(blocks: u32) -> Self {
        Self {
            data: vec![0u8; blocks as usize * BLOCK_SIZE],
            blocks,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        self.check_range(block)?;
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        self.check_range(block)?;
        let start = block as usize * BLOCK_SIZE;
        self.data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_a_block() {
        let mut dev = MemBlockDevice::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0xAB;
        buf[BLOCK_SIZE - 1] = 0xCD;
        dev.write_block(2, &buf).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut out).unwrap();
        assert_eq!(buf, out);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let mut dev = MemBlockDevice::new(2);
        let buf = [0u8; BLOCK_SIZE];
        assert!(dev.write_block(2, &buf).is_err());
        let mut out = [0u8; BLOCK_SIZE];
        assert!(dev.read_block(5, &mut out).is_err());
    }

    #[test]
    fn file_device_create_then_open_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");

        let mut dev = FileBlockDevice::create(&path, 4 * BLOCK_SIZE as u64).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        buf[10] = 42;
        dev.write_block(1, &buf).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let mut reopened = FileBlockDevice::open(&path).unwrap();
        assert_eq!(reopened.block_count(), 4);
        let mut out = [0u8; BLOCK_SIZE];
        reopened.read_block(1, &mut out).unwrap();
        assert_eq!(out[10], 42);
    }

    #[test]
    fn file_device_truncates_partial_trailing_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");
        // Deliberately not a multiple of BLOCK_SIZE.
        let size = 3 * BLOCK_SIZE as u64 + 100;
        let dev = FileBlockDevice::create(&path, size).unwrap();
        assert_eq!(dev.block_count(), 3);
    }
}
