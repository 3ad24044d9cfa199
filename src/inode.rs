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

//! The inode table: fixed-size per-file/directory metadata records,
//! addressed by inode number and packed several per block.

use crate::bitmap::Bitmap;
use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, FsResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// On-disk size of a single inode record.
pub const INODE_SIZE: usize = 128;

/// Inode numbers are 1-based; 0 marks "no inode" everywhere in the engine.
pub const INVALID_INODE: u32 = 0;

/// The root directory always occupies this inode number.
pub const ROOT_INODE: u32 = 1;

/// Direct block pointers carried in every inode.
pub const DIRECT_BLOCKS: usize = 12;

/// Entries in the single indirect block (`BLOCK_SIZE / size_of::<u32>()`).
pub const INDIRECT_ENTRIES: usize = BLOCK_SIZE / 4;

/// Largest file size representable with 12 direct blocks plus one
/// single-indirect block.
pub const MAX_FILE_SIZE: u64 = ((DIRECT_BLOCKS + INDIRECT_ENTRIES) * BLOCK_SIZE) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Free,
    File,
    Directory,
}

impl InodeType {
    fn from_u8(v: u8) -> FsResult<Self> {
        match v {
            0 => Ok(InodeType::Free),
            1 => Ok(InodeType::File),
            2 => Ok(InodeType::Directory),
            other => Err(FsError::Corrupt(format!("unknown inode type {other}"))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InodeType::Free => 0,
            InodeType::File => 1,
            InodeType::Directory => 2,
        }
    }
}

/// A single inode record: type, size, permission bits, and the block
/// pointers that locate its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub inode_type: InodeType,
    pub perms: u16,
    pub links_count: u16,
    pub size: u32,
    pub blocks_used: u32,
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: u32,
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
}

impl Inode {
    pub fn new_free() -> Self {
        Self {
            inode_type: InodeType::Free,
            perms: 0,
            links_count: 0,
            size: 0,
            blocks_used: 0,
            direct: [INVALID_INODE; DIRECT_BLOCKS],
            indirect: INVALID_INODE,
            created: 0,
            modified: 0,
            accessed: 0,
        }
    }

    pub fn new(inode_type: InodeType, perms: u16, now: i64) -> Self {
        Self {
            inode_type,
            perms,
            links_count: 1,
            size: 0,
            blocks_used: 0,
            direct: [INVALID_INODE; DIRECT_BLOCKS],
            indirect: INVALID_INODE,
            created: now,
            modified: now,
            accessed: now,
        }
    }

    pub fn is_free(&self) -> bool {
        self.inode_type == InodeType::Free
    }

    fn block_offset(inode_num: u32, inode_table_start: u32) -> (u32, usize) {
        let inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u32;
        // Inode numbers are 1-based.
        let index = inode_num - 1;
        let block = inode_table_start + index / inodes_per_block;
        let offset = (index % inodes_per_block) as usize * INODE_SIZE;
        (block, offset)
    }

    /// Reads inode `inode_num` out of the inode table.
    pub fn read(device: &mut dyn BlockDevice, inode_table_start: u32, inode_num: u32) -> FsResult<Self> {
        if inode_num == INVALID_INODE {
            return Err(FsError::Invalid("inode 0 is reserved".into()));
        }
        let (block, offset) = Self::block_offset(inode_num, inode_table_start);
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block, &mut buf)?;
        Self::deserialize(&buf[offset..offset + INODE_SIZE])
    }

    /// Writes this inode into slot `inode_num`, read-modify-writing the
    /// enclosing block since several inodes share one block.
    pub fn write(&self, device: &mut dyn BlockDevice, inode_table_start: u32, inode_num: u32) -> FsResult<()> {
        if inode_num == INVALID_INODE {
            return Err(FsError::Invalid("inode 0 is reserved".into()));
        }
        let (block, offset) = Self::block_offset(inode_num, inode_table_start);
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block, &mut buf)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(&self.serialize());
        device.write_block(block, &buf)
    }

    /// Allocates a free inode number from `bitmap`, marking it used. The
    /// caller is responsible for persisting the bitmap and writing an
    /// initialized record into the slot.
    pub fn alloc(bitmap: &mut Bitmap) -> FsResult<u32> {
        let index = bitmap.find_first_free().ok_or(FsError::NoSpace)?;
        bitmap.set(index)?;
        Ok(index)
    }

    /// Frees all data blocks owned by `inode` plus the inode slot itself,
    /// clearing both bitmaps. Returns the number of data blocks released.
    pub fn free(
        device: &mut dyn BlockDevice,
        inode_table_start: u32,
        inode_num: u32,
        inode: &Inode,
        block_bitmap: &mut Bitmap,
        inode_bitmap: &mut Bitmap,
    ) -> FsResult<u32> {
        let mut freed = 0u32;
        for &b in inode.direct.iter() {
            if b != INVALID_INODE {
                block_bitmap.clear(b)?;
                freed += 1;
            }
        }
        if inode.indirect != INVALID_INODE {
            let mut buf = [0u8; BLOCK_SIZE];
            device.read_block(inode.indirect, &mut buf)?;
            let mut cursor = Cursor::new(&buf[..]);
            for _ in 0..INDIRECT_ENTRIES {
                let b = cursor.read_u32::<LittleEndian>()?;
                if b != INVALID_INODE {
                    block_bitmap.clear(b)?;
                    freed += 1;
                }
            }
            block_bitmap.clear(inode.indirect)?;
            freed += 1;
        }
        inode_bitmap.clear(inode_num)?;
        Self::new_free().write(device, inode_table_start, inode_num)?;
        Ok(freed)
    }

    pub fn serialize(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u8(self.inode_type.as_u8()).unwrap();
        cursor.write_u16::<LittleEndian>(self.perms).unwrap();
        cursor.write_u16::<LittleEndian>(self.links_count).unwrap();
        cursor.write_u32::<LittleEndian>(self.size).unwrap();
        cursor.write_u32::<LittleEndian>(self.blocks_used).unwrap();
        for &b in self.direct.iter() {
            cursor.write_u32::<LittleEndian>(b).unwrap();
        }
        cursor.write_u32::<LittleEndian>(self.indirect).unwrap();
        cursor.write_i64::<LittleEndian>(self.created).unwrap();
        cursor.write_i64::<LittleEndian>(self.modified).unwrap();
        cursor.write_i64::<LittleEndian>(self.accessed).unwrap();
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> FsResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let inode_type = InodeType::from_u8(cursor.read_u8()?)?;
        let perms = cursor.read_u16::<LittleEndian>()?;
        let links_count = cursor.read_u16::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let blocks_used = cursor.read_u32::<LittleEndian>()?;
        let mut direct = [0u32; DIRECT_BLOCKS];
        for slot in direct.iter_mut() {
            *slot = cursor.read_u32::<LittleEndian>()?;
        }
        let indirect = cursor.read_u32::<LittleEndian>()?;
        let created = cursor.read_i64::<LittleEndian>()?;
        let modified = cursor.read_i64::<LittleEndian>()?;
        let accessed = cursor.read_i64::<LittleEndian>()?;
        Ok(Self {
            inode_type,
            perms,
            links_count,
            size,
            blocks_used,
            direct,
            indirect,
            created,
            modified,
            accessed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;

    #[test]
    fn inode_fits_exactly_in_128_bytes() {
        let inode = Inode::new(InodeType::File, 0o644, 100);
        assert_eq!(inode.serialize().len(), INODE_SIZE);
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let mut inode = Inode::new(InodeType::Directory, 0o755, 99);
        inode.direct[0] = 42;
        inode.indirect = 7;
        inode.size = 1024;
        let bytes = inode.serialize();
        let restored = Inode::deserialize(&bytes).unwrap();
        assert_eq!(inode, restored);
    }

    #[test]
    fn read_write_through_table() {
        let mut dev = MemBlockDevice::new(16);
        let table_start = 4;
        let inode = Inode::new(InodeType::File, 0o600, 5);
        inode.write(&mut dev, table_start, ROOT_INODE).unwrap();
        let restored = Inode::read(&mut dev, table_start, ROOT_INODE).unwrap();
        assert_eq!(inode, restored);
    }

    #[test]
    fn multiple_inodes_share_a_block_without_clobbering() {
        let mut dev = MemBlockDevice::new(16);
        let table_start = 2;
        let a = Inode::new(InodeType::File, 0o600, 1);
        let b = Inode::new(InodeType::Directory, 0o755, 2);
        a.write(&mut dev, table_start, 1).unwrap();
        b.write(&mut dev, table_start, 2).unwrap();
        assert_eq!(Inode::read(&mut dev, table_start, 1).unwrap(), a);
        assert_eq!(Inode::read(&mut dev, table_start, 2).unwrap(), b);
    }

    #[test]
    fn free_clears_direct_and_indirect_blocks() {
        let mut dev = MemBlockDevice::new(32);
        let table_start = 4;
        let mut inode = Inode::new(InodeType::File, 0o644, 1);
        inode.direct[0] = 20;
        inode.direct[1] = 21;
        inode.indirect = 22;
        let mut indirect_buf = [0u8; BLOCK_SIZE];
        {
            let mut cursor = Cursor::new(&mut indirect_buf[..]);
            cursor.write_u32::<LittleEndian>(23).unwrap();
        }
        dev.write_block(22, &indirect_buf).unwrap();
        inode.write(&mut dev, table_start, 5).unwrap();

        let mut block_bitmap = Bitmap::new(32);
        for b in [20, 21, 22, 23] {
            block_bitmap.set(b).unwrap();
        }
        let mut inode_bitmap = Bitmap::new(16);
        inode_bitmap.set(5).unwrap();

        let freed = Inode::free(&mut dev, table_start, 5, &inode, &mut block_bitmap, &mut inode_bitmap).unwrap();
        assert_eq!(freed, 4);
        assert!(!block_bitmap.get(20).unwrap());
        assert!(!block_bitmap.get(23).unwrap());
        assert!(!inode_bitmap.get(5).unwrap());

        let reread = Inode::read(&mut dev, table_start, 5).unwrap();
        assert!(reread.is_free());
    }

    #[test]
    fn alloc_skips_already_used_slots() {
        let mut bitmap = Bitmap::new(8);
        bitmap.set(1).unwrap();
        let allocated = Inode::alloc(&mut bitmap).unwrap();
        assert_eq!(allocated, 2);
    }
}
