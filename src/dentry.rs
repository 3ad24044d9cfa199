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

//! Fixed-size directory entries, two per block, scanned linearly.

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, FsResult};
use crate::inode::INVALID_INODE;
use crate::path::{self, MAX_FILENAME};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// On-disk size of a single directory entry.
pub const DENTRY_SIZE: usize = 256;

/// Directory entries packed into one block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    fn from_u8(v: u8) -> FsResult<Self> {
        match v {
            1 => Ok(FileType::File),
            2 => Ok(FileType::Directory),
            other => Err(FsError::Corrupt(format!("unknown dentry file type {other}"))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FileType::File => 1,
            FileType::Directory => 2,
        }
    }
}

/// A single directory entry: which inode a name refers to, and its type.
///
/// A slot with `inode_num == INVALID_INODE` is free space within the
/// directory's data blocks, left behind by `remove`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_num: u32,
    pub name: String,
    pub file_type: FileType,
}

impl DirEntry {
    /// Builds an entry, validating `name` the same way every other path
    /// component is validated.
    pub fn new(inode_num: u32, name: &str, file_type: FileType) -> FsResult<Self> {
        if !is_valid_name(name) {
            return Err(FsError::Invalid(format!("invalid directory entry name {name:?}")));
        }
        Ok(Self {
            inode_num,
            name: name.to_string(),
            file_type,
        })
    }

    /// Builds `.`/`..` entries, bypassing the normal name validator since
    /// those names are otherwise illegal anywhere else in a path.
    pub(crate) fn new_reserved(inode_num: u32, name: &str, file_type: FileType) -> Self {
        Self {
            inode_num,
            name: name.to_string(),
            file_type,
        }
    }

    fn free_slot() -> Self {
        Self {
            inode_num: INVALID_INODE,
            name: String::new(),
            file_type: FileType::File,
        }
    }

    pub fn is_free(&self) -> bool {
        self.inode_num == INVALID_INODE
    }

    /// Structural validity: occupied slot, non-empty name within the
    /// on-disk name field. `file_type` can't be anything but `FILE`/`DIR`
    /// once deserialized, so that part of the check is enforced by the
    /// type system rather than at runtime here.
    pub fn is_valid(&self) -> bool {
        !self.is_free() && !self.name.is_empty() && self.name.len() <= MAX_FILENAME
    }

    pub fn serialize(&self) -> FsResult<[u8; DENTRY_SIZE]> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > MAX_FILENAME {
            return Err(FsError::Invalid("directory entry name too long".into()));
        }
        let mut buf = [0u8; DENTRY_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            cursor.write_u32::<LittleEndian>(self.inode_num).unwrap();
            cursor.write_u8(name_bytes.len() as u8).unwrap();
            cursor.write_u8(self.file_type.as_u8()).unwrap();
        }
        buf[6..6 + name_bytes.len()].copy_from_slice(name_bytes);
        Ok(buf)
    }

    pub fn deserialize(bytes: &[u8]) -> FsResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let inode_num = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u8()? as usize;
        let file_type_byte = cursor.read_u8()?;
        if inode_num == INVALID_INODE {
            return Ok(Self::free_slot());
        }
        if name_len > MAX_FILENAME {
            return Err(FsError::Corrupt("directory entry name_len out of range".into()));
        }
        let name = String::from_utf8(bytes[6..6 + name_len].to_vec())
            .map_err(|_| FsError::Corrupt("directory entry name is not valid UTF-8".into()))?;
        Ok(Self {
            inode_num,
            name,
            file_type: FileType::from_u8(file_type_byte)?,
        })
    }
}

/// True for any name legal as a directory entry. `.` and `..` are
/// reserved and always rejected here; they only ever reach a block
/// through [`DirEntry::new_reserved`]. Same rules as
/// [`path::filename_is_valid`].
pub fn is_valid_name(name: &str) -> bool {
    path::filename_is_valid(name)
}

fn read_block_entries(device: &mut dyn BlockDevice, block: u32) -> FsResult<Vec<DirEntry>> {
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_block(block, &mut buf)?;
    (0..ENTRIES_PER_BLOCK)
        .map(|i| DirEntry::deserialize(&buf[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE]))
        .collect()
}

fn write_block_entries(device: &mut dyn BlockDevice, block: u32, entries: &[DirEntry]) -> FsResult<()> {
    debug_assert_eq!(entries.len(), ENTRIES_PER_BLOCK);
    let mut buf = [0u8; BLOCK_SIZE];
    for (i, entry) in entries.iter().enumerate() {
        let serialized = entry.serialize()?;
        buf[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE].copy_from_slice(&serialized);
    }
    device.write_block(block, &buf)
}

/// Scans `blocks` (a directory's data blocks, in order) for `name`.
pub fn find(device: &mut dyn BlockDevice, blocks: &[u32], name: &str) -> FsResult<Option<DirEntry>> {
    for &block in blocks {
        for entry in read_block_entries(device, block)? {
            if !entry.is_free() && entry.name == name {
                return Ok(Some(entry));
            }
        }
    }
    Ok(None)
}

/// Lists every live entry across `blocks`, in on-disk order.
pub fn list(device: &mut dyn BlockDevice, blocks: &[u32]) -> FsResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    for &block in blocks {
        for entry in read_block_entries(device, block)? {
            if !entry.is_free() {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

/// Inserts `entry` into the first free slot across `blocks`.
///
/// Returns `Ok(true)` if inserted, `Ok(false)` if every block is full and
/// the caller needs to allocate a new data block and retry. Never
/// inserts a duplicate name.
pub fn add(device: &mut dyn BlockDevice, blocks: &[u32], entry: DirEntry) -> FsResult<bool> {
    if find(device, blocks, &entry.name)?.is_some() {
        return Err(FsError::Exists);
    }
    for &block in blocks {
        let mut existing = read_block_entries(device, block)?;
        if let Some(slot) = existing.iter_mut().find(|e| e.is_free()) {
            *slot = entry;
            write_block_entries(device, block, &existing)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Clears the entry named `name`, turning its slot back into free space.
/// Returns the removed entry's inode number, or `NotFound` if absent.
pub fn remove(device: &mut dyn BlockDevice, blocks: &[u32], name: &str) -> FsResult<u32> {
    for &block in blocks {
        let mut existing = read_block_entries(device, block)?;
        if let Some(slot) = existing.iter_mut().find(|e| !e.is_free() && e.name == name) {
            let inode_num = slot.inode_num;
            *slot = DirEntry::free_slot();
            write_block_entries(device, block, &existing)?;
            return Ok(inode_num);
        }
    }
    Err(FsError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;

    #[test]
    fn dentry_fits_exactly_in_256_bytes() {
        let entry = DirEntry::new(5, "file.txt", FileType::File).unwrap();
        assert_eq!(entry.serialize().unwrap().len(), DENTRY_SIZE);
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let entry = DirEntry::new(9, "subdir", FileType::Directory).unwrap();
        let bytes = entry.serialize().unwrap();
        let restored = DirEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, restored);
    }

    #[test]
    fn reserved_names_bypass_validator() {
        let dot = DirEntry::new_reserved(1, ".", FileType::Directory);
        let bytes = dot.serialize().unwrap();
        let restored = DirEntry::deserialize(&bytes).unwrap();
        assert_eq!(dot, restored);
    }

    #[test]
    fn new_rejects_bad_names() {
        assert!(DirEntry::new(1, "a/b", FileType::File).is_err());
        assert!(DirEntry::new(1, "", FileType::File).is_err());
        assert!(DirEntry::new(1, ".", FileType::Directory).is_err());
        assert!(DirEntry::new(1, "..", FileType::Directory).is_err());
    }

    #[test]
    fn add_find_remove_round_trip() {
        let mut dev = MemBlockDevice::new(4);
        let blocks = vec![1u32];
        let entry = DirEntry::new(2, "a.txt", FileType::File).unwrap();
        assert!(add(&mut dev, &blocks, entry.clone()).unwrap());
        assert_eq!(find(&mut dev, &blocks, "a.txt").unwrap(), Some(entry));

        let removed = remove(&mut dev, &blocks, "a.txt").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(find(&mut dev, &blocks, "a.txt").unwrap(), None);
    }

    #[test]
    fn add_rejects_duplicate_names() {
        let mut dev = MemBlockDevice::new(4);
        let blocks = vec![1u32];
        let entry = DirEntry::new(2, "a.txt", FileType::File).unwrap();
        add(&mut dev, &blocks, entry.clone()).unwrap();
        assert!(matches!(add(&mut dev, &blocks, entry), Err(FsError::Exists)));
    }

    #[test]
    fn add_reports_full_block_for_caller_to_grow() {
        let mut dev = MemBlockDevice::new(4);
        let blocks = vec![1u32];
        for i in 0..ENTRIES_PER_BLOCK {
            let entry = DirEntry::new(10 + i as u32, &format!("f{i}"), FileType::File).unwrap();
            assert!(add(&mut dev, &blocks, entry).unwrap());
        }
        let overflow = DirEntry::new(99, "one_too_many", FileType::File).unwrap();
        assert!(!add(&mut dev, &blocks, overflow).unwrap());
    }

    #[test]
    fn list_skips_free_slots() {
        let mut dev = MemBlockDevice::new(4);
        let blocks = vec![1u32];
        let entry = DirEntry::new(2, "a.txt", FileType::File).unwrap();
        add(&mut dev, &blocks, entry).unwrap();
        let listed = list(&mut dev, &blocks).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.txt");
    }
}
