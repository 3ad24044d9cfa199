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

//! The filesystem core: format, mount, path resolution, and the
//! file/directory operations built on top of the lower layers.

use crate::bitmap::Bitmap;
use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::dentry::{self, DirEntry, FileType};
use crate::error::{FsError, FsResult};
use crate::inode::{
    Inode, InodeType, DIRECT_BLOCKS, INDIRECT_ENTRIES, INVALID_INODE, MAX_FILE_SIZE, ROOT_INODE,
};
use crate::path;
use crate::superblock::Superblock;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace, warn};
use std::io::Cursor;

bitflags! {
    /// Flags an [`OpenFile`] was opened with, gating which operations are
    /// permitted on it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const RDONLY = 0x01;
        const WRONLY = 0x02;
        const RDWR   = 0x03;
        const CREAT  = 0x08;
        const APPEND = 0x10;
        const TRUNC  = 0x20;
    }
}

impl OpenFlags {
    /// `RDWR`'s bits are the union of `RDONLY` and `WRONLY`, so a plain
    /// `contains` check against each bit tells read/write access apart
    /// without special-casing `RDWR` itself.
    fn readable(self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    fn writable(self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

/// Origin a [`Filesystem::seek`] offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A handle to an open inode: which inode, what it was opened with, and
/// where the next read/write will occur.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub inode_num: u32,
    pub flags: OpenFlags,
    pub offset: u64,
}

/// A read-only snapshot of the mounted filesystem's aggregate state,
/// supplementing the distilled spec with the `fsinfo` shell command's
/// data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub mount_count: u32,
}

/// A mounted filesystem: the backing device, its superblock, and the two
/// free-space bitmaps kept resident in memory and persisted on every
/// change.
#[derive(Debug)]
pub struct Filesystem<D: BlockDevice> {
    device: D,
    sb: Superblock,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
    current_dir_inode: u32,
}

fn validate_perms(perms: u16) -> FsResult<()> {
    if perms & !0o777 != 0 {
        return Err(FsError::Invalid(format!("permission bits {perms:#o} out of range")));
    }
    Ok(())
}

impl<D: BlockDevice> Filesystem<D> {
    /// Formats `device` as a brand-new, empty filesystem and mounts it.
    ///
    /// Lays out the superblock, both bitmaps and the inode table, then
    /// creates the root directory inode with `.` and `..` both pointing
    /// at itself. If any step after the root inode allocation fails, the
    /// inode and any block allocated for it are released before the
    /// error is returned.
    pub fn format(mut device: D, total_inodes: u32, now: i64) -> FsResult<Self> {
        let total_blocks = device.block_count();
        let sb = Superblock::init(total_blocks, total_inodes, now)?;

        let block_bitmap = Bitmap::new(sb.total_blocks);
        let inode_bitmap = Bitmap::new(sb.total_inodes);

        sb.write(&mut device)?;
        let mut fs = Self {
            device,
            sb,
            block_bitmap,
            inode_bitmap,
            current_dir_inode: ROOT_INODE,
        };
        // The region before first_data_block is never handed out by
        // alloc_block: mark it used up front so the bitmap and the
        // superblock's free_blocks counter agree from the start.
        fs.block_bitmap.set_range(0, fs.sb.first_data_block)?;
        // Inode 0 is permanently reserved and never handed out by
        // alloc_inode; mark it used so the inode bitmap matches that.
        fs.inode_bitmap.set(0)?;
        fs.persist_block_bitmap()?;
        fs.persist_inode_bitmap()?;

        match fs.create_root_directory(now) {
            Ok(()) => Ok(fs),
            Err(e) => Err(e),
        }
    }

    /// Allocates the root inode and its single data block, with `.`/`..`
    /// entries. Every fallible step after the root inode allocation is
    /// paired with a compensating free so a failure anywhere in the
    /// sequence leaves neither the inode nor its block marked used.
    fn create_root_directory(&mut self, now: i64) -> FsResult<()> {
        let root_num = self.alloc_inode()?;
        debug_assert_eq!(root_num, ROOT_INODE);

        let result: FsResult<u32> = (|| {
            let mut root = Inode::new(InodeType::Directory, 0o755, now);
            root.links_count = 2;

            let block = self.alloc_block()?;
            if let Err(e) = self.zero_block(block) {
                let _ = self.free_block(block);
                return Err(e);
            }
            root.direct[0] = block;
            root.blocks_used = 1;
            root.size = BLOCK_SIZE as u32;

            let dot = DirEntry::new_reserved(ROOT_INODE, ".", FileType::Directory);
            let dotdot = DirEntry::new_reserved(ROOT_INODE, "..", FileType::Directory);
            if let Err(e) = dentry::add(&mut self.device, &[block], dot) {
                let _ = self.free_block(block);
                return Err(e);
            }
            if let Err(e) = dentry::add(&mut self.device, &[block], dotdot) {
                let _ = self.free_block(block);
                return Err(e);
            }
            if let Err(e) = root.write(&mut self.device, self.sb.inode_table_start, root_num) {
                let _ = self.free_block(block);
                return Err(e);
            }
            Ok(block)
        })();

        match result {
            Ok(block) => {
                debug!("formatted root directory at inode {root_num}, block {block}");
                Ok(())
            }
            Err(e) => {
                let _ = self.inode_bitmap.clear(root_num);
                self.sb.free_inodes += 1;
                let _ = self.persist_inode_bitmap();
                Err(e)
            }
        }
    }

    /// Mounts an already-formatted device: reads and validates the
    /// superblock and both bitmaps, bumps the mount counter, and persists
    /// the updated superblock.
    pub fn mount(mut device: D, now: i64) -> FsResult<Self> {
        let mut sb = Superblock::read(&mut device)?;
        let block_bitmap = read_bitmap(&mut device, sb.block_bitmap_start, sb.block_bitmap_blocks, sb.total_blocks)?;
        let inode_bitmap = read_bitmap(&mut device, sb.inode_bitmap_start, sb.inode_bitmap_blocks, sb.total_inodes)?;

        // Treat the persisted counters as a cache: recompute from the
        // bitmaps themselves so a stale superblock can't drift from the
        // authoritative allocation state.
        sb.free_blocks = block_bitmap.count_free();
        sb.free_inodes = inode_bitmap.count_free();

        sb.mount_count += 1;
        sb.last_mount_time = now;
        sb.write(&mut device)?;

        trace!("mounted filesystem, mount_count={}", sb.mount_count);
        Ok(Self {
            device,
            sb,
            block_bitmap,
            inode_bitmap,
            current_dir_inode: ROOT_INODE,
        })
    }

    /// Flushes the superblock and syncs the backing device. No in-memory
    /// state needs writing back beyond this: every bitmap and inode
    /// mutation is persisted immediately as it happens.
    pub fn unmount(mut self) -> FsResult<D> {
        self.sb.write(&mut self.device)?;
        self.device.sync()?;
        Ok(self.device)
    }

    pub fn info(&self) -> FsInfo {
        FsInfo {
            block_size: self.sb.block_size,
            total_blocks: self.sb.total_blocks,
            free_blocks: self.sb.free_blocks,
            total_inodes: self.sb.total_inodes,
            free_inodes: self.sb.free_inodes,
            mount_count: self.sb.mount_count,
        }
    }

    // ---- bitmap / block bookkeeping -------------------------------------

    fn persist_block_bitmap(&mut self) -> FsResult<()> {
        write_bitmap(&mut self.device, self.sb.block_bitmap_start, &self.block_bitmap)?;
        self.sb.write(&mut self.device)
    }

    fn persist_inode_bitmap(&mut self) -> FsResult<()> {
        write_bitmap(&mut self.device, self.sb.inode_bitmap_start, &self.inode_bitmap)?;
        self.sb.write(&mut self.device)
    }

    fn alloc_block(&mut self) -> FsResult<u32> {
        let index = self.block_bitmap.find_first_free().ok_or(FsError::NoSpace)?;
        self.block_bitmap.set(index)?;
        self.sb.free_blocks -= 1;
        self.persist_block_bitmap()?;
        trace!("allocated block {index}, {} free remain", self.sb.free_blocks);
        Ok(index)
    }

    fn free_block(&mut self, block: u32) -> FsResult<()> {
        self.block_bitmap.clear(block)?;
        self.sb.free_blocks += 1;
        self.persist_block_bitmap()?;
        trace!("freed block {block}, {} free remain", self.sb.free_blocks);
        Ok(())
    }

    fn alloc_inode(&mut self) -> FsResult<u32> {
        let num = Inode::alloc(&mut self.inode_bitmap)?;
        self.sb.free_inodes -= 1;
        self.persist_inode_bitmap()?;
        Ok(num)
    }

    fn zero_block(&mut self, block: u32) -> FsResult<()> {
        self.device.write_block(block, &[0u8; BLOCK_SIZE])
    }

    // ---- inode access -----------------------------------------------------

    fn read_inode(&mut self, inode_num: u32) -> FsResult<Inode> {
        Inode::read(&mut self.device, self.sb.inode_table_start, inode_num)
    }

    fn write_inode(&mut self, inode_num: u32, inode: &Inode) -> FsResult<()> {
        inode.write(&mut self.device, self.sb.inode_table_start, inode_num)
    }

    /// Full ordered list of data blocks an inode currently owns.
    fn data_blocks(&mut self, inode: &Inode) -> FsResult<Vec<u32>> {
        let mut blocks: Vec<u32> = inode
            .direct
            .iter()
            .copied()
            .filter(|&b| b != INVALID_INODE)
            .collect();
        if inode.indirect != INVALID_INODE {
            let mut buf = [0u8; BLOCK_SIZE];
            self.device.read_block(inode.indirect, &mut buf)?;
            let mut cursor = Cursor::new(&buf[..]);
            for _ in 0..INDIRECT_ENTRIES {
                let b = cursor.read_u32::<LittleEndian>()?;
                if b != INVALID_INODE {
                    blocks.push(b);
                }
            }
        }
        Ok(blocks)
    }

    /// Returns the block backing logical block index `logical`, allocating
    /// and zero-filling one (and the indirect block, if needed) when
    /// absent. Mutates `inode`; the caller persists it.
    fn ensure_block(&mut self, inode: &mut Inode, logical: usize) -> FsResult<u32> {
        if logical < DIRECT_BLOCKS {
            if inode.direct[logical] == INVALID_INODE {
                let block = self.alloc_block()?;
                if let Err(e) = self.zero_block(block) {
                    let _ = self.free_block(block);
                    return Err(e);
                }
                inode.direct[logical] = block;
                inode.blocks_used += 1;
            }
            return Ok(inode.direct[logical]);
        }

        let indirect_index = logical - DIRECT_BLOCKS;
        if indirect_index >= INDIRECT_ENTRIES {
            return Err(FsError::NoSpace);
        }

        // Track whether this call allocates the indirect block itself, so a
        // failure further down (reading the now-dangling indirect block, or
        // allocating the data block it would point to) can free it back
        // out instead of leaving it marked used with nothing referencing
        // it.
        let fresh_indirect = inode.indirect == INVALID_INODE;
        if fresh_indirect {
            let block = self.alloc_block()?;
            if let Err(e) = self.zero_block(block) {
                let _ = self.free_block(block);
                return Err(e);
            }
            inode.indirect = block;
            inode.blocks_used += 1;
        }

        match self.alloc_indirect_entry(inode.indirect, indirect_index) {
            Ok((block, true)) => {
                inode.blocks_used += 1;
                Ok(block)
            }
            Ok((block, false)) => Ok(block),
            Err(e) => {
                if fresh_indirect {
                    let _ = self.free_block(inode.indirect);
                    inode.indirect = INVALID_INODE;
                    inode.blocks_used -= 1;
                }
                Err(e)
            }
        }
    }

    /// Returns the data block pointed to by `indirect_index` within
    /// `indirect_block`, allocating and wiring one in if the slot is empty.
    /// The `bool` is true exactly when a new block was allocated, so the
    /// caller can decide whether `blocks_used` should change.
    fn alloc_indirect_entry(&mut self, indirect_block: u32, indirect_index: usize) -> FsResult<(u32, bool)> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(indirect_block, &mut buf)?;
        let existing = {
            let mut cursor = Cursor::new(&buf[indirect_index * 4..indirect_index * 4 + 4]);
            cursor.read_u32::<LittleEndian>()?
        };
        if existing != INVALID_INODE {
            return Ok((existing, false));
        }

        let block = self.alloc_block()?;
        if let Err(e) = self.zero_block(block) {
            let _ = self.free_block(block);
            return Err(e);
        }
        {
            let mut cursor = Cursor::new(&mut buf[indirect_index * 4..indirect_index * 4 + 4]);
            cursor.write_u32::<LittleEndian>(block).unwrap();
        }
        self.device.write_block(indirect_block, &buf)?;
        Ok((block, true))
    }

    /// Zeros the on-disk pointer entry for `indirect_index` within
    /// `indirect_block`, so a freed data block leaves no dangling
    /// reference behind.
    fn clear_indirect_entry(&mut self, indirect_block: u32, indirect_index: usize) -> FsResult<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(indirect_block, &mut buf)?;
        {
            let mut cursor = Cursor::new(&mut buf[indirect_index * 4..indirect_index * 4 + 4]);
            cursor.write_u32::<LittleEndian>(INVALID_INODE).unwrap();
        }
        self.device.write_block(indirect_block, &buf)
    }

    /// Reverts a successful [`Filesystem::ensure_block`] call whose caller
    /// failed a later step: frees the data block (and, if it was freshly
    /// allocated in the same call, the indirect block too), clearing the
    /// on-disk indirect pointer entry when the indirect block survives so
    /// no dangling reference remains. Only valid when `block` was freshly
    /// allocated by that `ensure_block` call, which holds for directory
    /// growth (`logical` always indexes past every existing block) but not
    /// for arbitrary sparse writes.
    fn undo_ensure_block(&mut self, inode: &mut Inode, logical: usize, block: u32, fresh_indirect: bool) {
        if logical < DIRECT_BLOCKS {
            inode.direct[logical] = INVALID_INODE;
            inode.blocks_used = inode.blocks_used.saturating_sub(1);
            let _ = self.free_block(block);
            return;
        }

        let indirect_index = logical - DIRECT_BLOCKS;
        let indirect_block = inode.indirect;
        if fresh_indirect {
            inode.indirect = INVALID_INODE;
            inode.blocks_used = inode.blocks_used.saturating_sub(2);
            let _ = self.free_block(block);
            let _ = self.free_block(indirect_block);
        } else {
            inode.blocks_used = inode.blocks_used.saturating_sub(1);
            let _ = self.clear_indirect_entry(indirect_block, indirect_index);
            let _ = self.free_block(block);
        }
    }

    /// Inserts `entry` into `dir_inode`'s data blocks, allocating and
    /// zero-filling a new block if every existing one is full. Persists
    /// `dir_inode` only when it actually changes.
    fn dir_add_entry(&mut self, dir_num: u32, dir_inode: &mut Inode, entry: DirEntry) -> FsResult<()> {
        let blocks = self.data_blocks(dir_inode)?;
        if dentry::add(&mut self.device, &blocks, entry.clone())? {
            return Ok(());
        }

        let logical = blocks.len();
        let indirect_before = dir_inode.indirect;
        let new_block = self.ensure_block(dir_inode, logical)?;
        let fresh_indirect = indirect_before == INVALID_INODE && dir_inode.indirect != INVALID_INODE;

        let result: FsResult<()> = (|| {
            dir_inode.size += BLOCK_SIZE as u32;
            self.write_inode(dir_num, dir_inode)?;

            let mut grown = blocks.clone();
            grown.push(new_block);
            if !dentry::add(&mut self.device, &grown, entry.clone())? {
                return Err(FsError::Generic("directory entry did not fit after growth".into()));
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.undo_ensure_block(dir_inode, logical, new_block, fresh_indirect);
            // write_inode may already have persisted dir_inode referencing
            // the block we just freed; re-persist the reverted state so no
            // on-disk pointer survives pointing at a now-free block.
            let _ = self.write_inode(dir_num, dir_inode);
            return Err(e);
        }
        Ok(())
    }

    // ---- path resolution ---------------------------------------------------

    /// Resolves `path` to an inode number by walking component by
    /// component from the root.
    pub fn path_to_inode(&mut self, path: &str) -> FsResult<u32> {
        if !path::is_valid(path) {
            return Err(FsError::Invalid(format!("invalid path {path:?}")));
        }
        let normalized = path::normalize(path);
        if normalized == "/" {
            return Ok(ROOT_INODE);
        }
        let mut current = if path::is_absolute(&normalized) {
            ROOT_INODE
        } else {
            self.current_dir_inode
        };
        for component in path::components(&normalized) {
            let inode = self.read_inode(current)?;
            if inode.inode_type != InodeType::Directory {
                return Err(FsError::Invalid(format!("{component} is not a directory")));
            }
            let blocks = self.data_blocks(&inode)?;
            let entry = dentry::find(&mut self.device, &blocks, component)?
                .ok_or(FsError::NotFound)?;
            current = entry.inode_num;
        }
        Ok(current)
    }

    /// The inode of the current working directory, set to [`ROOT_INODE`]
    /// on format and mount and changed only by [`Filesystem::cd`].
    pub fn current_dir_inode(&self) -> u32 {
        self.current_dir_inode
    }

    /// Changes the current directory to `path` (absolute or relative to
    /// the existing current directory), after verifying it resolves to a
    /// directory.
    pub fn cd(&mut self, path: &str) -> FsResult<()> {
        let inode_num = self.path_to_inode(path)?;
        let inode = self.read_inode(inode_num)?;
        if inode.inode_type != InodeType::Directory {
            return Err(FsError::Invalid(format!("{path} is not a directory")));
        }
        self.current_dir_inode = inode_num;
        Ok(())
    }

    /// The absolute path of the current directory.
    pub fn pwd(&mut self) -> FsResult<String> {
        self.inode_to_path(self.current_dir_inode)
    }

    /// Reconstructs an absolute path to `target` by searching the
    /// directory tree from the root. Hard-linked files may have several
    /// valid paths; this returns the first one found in directory-listing
    /// order.
    pub fn inode_to_path(&mut self, target: u32) -> FsResult<String> {
        if target == ROOT_INODE {
            return Ok("/".to_string());
        }
        self.search_tree(ROOT_INODE, "", target)
            .and_then(|opt| opt.ok_or(FsError::NotFound))
    }

    fn search_tree(&mut self, dir_num: u32, prefix: &str, target: u32) -> FsResult<Option<String>> {
        let dir_inode = self.read_inode(dir_num)?;
        let blocks = self.data_blocks(&dir_inode)?;
        let entries = dentry::list(&mut self.device, &blocks)?;

        for entry in &entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.inode_num == target {
                return Ok(Some(format!("{prefix}/{}", entry.name)));
            }
        }
        for entry in &entries {
            if entry.name == "." || entry.name == ".." || entry.file_type != FileType::Directory {
                continue;
            }
            let next_prefix = format!("{prefix}/{}", entry.name);
            if let Some(found) = self.search_tree(entry.inode_num, &next_prefix, target)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // ---- file data ----------------------------------------------------------

    /// Opens `path` per `flags`, optionally creating it (`CREAT`) and/or
    /// truncating it (`TRUNC`). `perms` is only consulted on creation.
    pub fn open(&mut self, path: &str, flags: OpenFlags, perms: u16, now: i64) -> FsResult<OpenFile> {
        let inode_num = match self.path_to_inode(path) {
            Ok(num) => num,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                self.create(path, perms, now)?
            }
            Err(e) => return Err(e),
        };

        let inode = self.read_inode(inode_num)?;
        if inode.inode_type != InodeType::File {
            return Err(FsError::Invalid("cannot open a directory for reading or writing".into()));
        }

        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
            let mut inode = inode;
            self.truncate(inode_num, &mut inode)?;
        }

        let offset = if flags.contains(OpenFlags::APPEND) {
            self.read_inode(inode_num)?.size as u64
        } else {
            0
        };
        Ok(OpenFile { inode_num, flags, offset })
    }

    fn truncate(&mut self, inode_num: u32, inode: &mut Inode) -> FsResult<()> {
        for b in inode.direct.iter_mut() {
            if *b != INVALID_INODE {
                self.free_block(*b)?;
                *b = INVALID_INODE;
            }
        }
        if inode.indirect != INVALID_INODE {
            let mut buf = [0u8; BLOCK_SIZE];
            self.device.read_block(inode.indirect, &mut buf)?;
            let mut cursor = Cursor::new(&buf[..]);
            for _ in 0..INDIRECT_ENTRIES {
                let b = cursor.read_u32::<LittleEndian>()?;
                if b != INVALID_INODE {
                    self.free_block(b)?;
                }
            }
            self.free_block(inode.indirect)?;
            inode.indirect = INVALID_INODE;
        }
        inode.size = 0;
        inode.blocks_used = 0;
        self.write_inode(inode_num, inode)
    }

    /// Reads up to `buf.len()` bytes starting at `file.offset`, advancing
    /// it. Unallocated blocks within the file's size (sparse holes) read
    /// back as zero. Updates and persists `accessed_time` to `now`.
    pub fn read(&mut self, file: &mut OpenFile, buf: &mut [u8], now: i64) -> FsResult<usize> {
        if !file.flags.readable() {
            return Err(FsError::Permission);
        }
        let mut inode = self.read_inode(file.inode_num)?;
        let remaining = (inode.size as u64).saturating_sub(file.offset);
        let to_read = buf.len().min(remaining as usize);
        let mut done = 0usize;

        while done < to_read {
            let abs_offset = file.offset + done as u64;
            let logical = (abs_offset / BLOCK_SIZE as u64) as usize;
            let within = (abs_offset % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - within).min(to_read - done);

            let block = self.block_for_read(&inode, logical)?;
            match block {
                Some(b) => {
                    let mut block_buf = [0u8; BLOCK_SIZE];
                    self.device.read_block(b, &mut block_buf)?;
                    buf[done..done + chunk].copy_from_slice(&block_buf[within..within + chunk]);
                }
                None => {
                    buf[done..done + chunk].fill(0);
                }
            }
            done += chunk;
        }

        file.offset += done as u64;
        inode.accessed = now;
        self.write_inode(file.inode_num, &inode)?;
        Ok(done)
    }

    fn block_for_read(&mut self, inode: &Inode, logical: usize) -> FsResult<Option<u32>> {
        if logical < DIRECT_BLOCKS {
            let b = inode.direct[logical];
            return Ok(if b == INVALID_INODE { None } else { Some(b) });
        }
        let indirect_index = logical - DIRECT_BLOCKS;
        if inode.indirect == INVALID_INODE || indirect_index >= INDIRECT_ENTRIES {
            return Ok(None);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(inode.indirect, &mut buf)?;
        let mut cursor = Cursor::new(&buf[indirect_index * 4..indirect_index * 4 + 4]);
        let b = cursor.read_u32::<LittleEndian>()?;
        Ok(if b == INVALID_INODE { None } else { Some(b) })
    }

    /// Writes `buf` at `file.offset`, allocating blocks as needed and
    /// advancing the offset. Rejected outright with [`FsError::NoSpace`],
    /// writing nothing, if it would grow the file past [`MAX_FILE_SIZE`].
    pub fn write(&mut self, file: &mut OpenFile, buf: &[u8], now: i64) -> FsResult<usize> {
        if !file.flags.writable() {
            return Err(FsError::Permission);
        }
        if file.offset + buf.len() as u64 > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let mut inode = self.read_inode(file.inode_num)?;
        let mut done = 0usize;
        let mut write_err = None;

        while done < buf.len() {
            let abs_offset = file.offset + done as u64;
            let logical = (abs_offset / BLOCK_SIZE as u64) as usize;
            let within = (abs_offset % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - within).min(buf.len() - done);

            let block = match self.ensure_block(&mut inode, logical) {
                Ok(b) => b,
                Err(e) => {
                    write_err = Some(e);
                    break;
                }
            };
            let mut block_buf = [0u8; BLOCK_SIZE];
            if let Err(e) = self.device.read_block(block, &mut block_buf) {
                write_err = Some(e);
                break;
            }
            block_buf[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
            if let Err(e) = self.device.write_block(block, &block_buf) {
                write_err = Some(e);
                break;
            }

            done += chunk;
        }

        // Bytes written and blocks allocated so far are kept even on a
        // mid-write failure (short-write semantics), so the partial state
        // is always persisted before surfacing any error.
        file.offset += done as u64;
        inode.size = inode.size.max(file.offset as u32);
        inode.modified = now;
        self.write_inode(file.inode_num, &inode)?;

        match write_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    /// Repositions `file.offset` per `whence`, rejecting results outside
    /// `[0, MAX_FILE_SIZE]`.
    pub fn seek(&mut self, file: &mut OpenFile, offset: i64, whence: Whence) -> FsResult<u64> {
        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => file.offset as i64,
            Whence::End => self.read_inode(file.inode_num)?.size as i64,
        };
        let new_offset = base
            .checked_add(offset)
            .ok_or_else(|| FsError::Invalid("seek overflow".into()))?;
        if new_offset < 0 || new_offset as u64 > MAX_FILE_SIZE {
            return Err(FsError::Invalid("seek offset out of range".into()));
        }
        file.offset = new_offset as u64;
        Ok(file.offset)
    }

    // ---- namespace mutations -------------------------------------------------

    fn split_parent(&mut self, path: &str) -> FsResult<(u32, String)> {
        let normalized = path::normalize(path);
        if normalized == "/" {
            return Err(FsError::Invalid("root has no parent to create it in".into()));
        }
        let name = path::basename(&normalized);
        if name == "." || name == ".." {
            return Err(FsError::Invalid(format!("{name:?} is reserved")));
        }
        let parent_path = path::dirname(&normalized);
        let parent_num = self.path_to_inode(&parent_path)?;
        Ok((parent_num, name))
    }

    /// Creates a regular file at `path`. Rolls back the freshly allocated
    /// inode if inserting its directory entry fails.
    pub fn create(&mut self, path: &str, perms: u16, now: i64) -> FsResult<u32> {
        validate_perms(perms)?;
        let (parent_num, name) = self.split_parent(path)?;
        let mut parent = self.read_inode(parent_num)?;
        if parent.inode_type != InodeType::Directory {
            return Err(FsError::Invalid("parent is not a directory".into()));
        }
        let parent_blocks = self.data_blocks(&parent)?;
        if dentry::find(&mut self.device, &parent_blocks, &name)?.is_some() {
            return Err(FsError::Exists);
        }

        let inode_num = self.alloc_inode()?;
        let inode = Inode::new(InodeType::File, perms, now);
        if let Err(e) = self.write_inode(inode_num, &inode) {
            self.release_inode(inode_num)?;
            return Err(e);
        }

        let entry = DirEntry::new(inode_num, &name, FileType::File)?;
        if let Err(e) = self.dir_add_entry(parent_num, &mut parent, entry) {
            self.release_inode(inode_num)?;
            return Err(e);
        }
        debug!("created file {path:?} at inode {inode_num}");
        Ok(inode_num)
    }

    /// Creates a directory at `path` with its own `.`/`..` entries.
    pub fn mkdir(&mut self, path: &str, perms: u16, now: i64) -> FsResult<u32> {
        validate_perms(perms)?;
        let (parent_num, name) = self.split_parent(path)?;
        let mut parent = self.read_inode(parent_num)?;
        if parent.inode_type != InodeType::Directory {
            return Err(FsError::Invalid("parent is not a directory".into()));
        }
        let parent_blocks = self.data_blocks(&parent)?;
        if dentry::find(&mut self.device, &parent_blocks, &name)?.is_some() {
            return Err(FsError::Exists);
        }

        let inode_num = self.alloc_inode()?;
        let mut inode = Inode::new(InodeType::Directory, perms, now);
        inode.links_count = 2;

        let result: FsResult<()> = (|| {
            let block = self.alloc_block()?;
            if let Err(e) = self.zero_block(block) {
                let _ = self.free_block(block);
                return Err(e);
            }
            inode.direct[0] = block;
            inode.blocks_used = 1;
            inode.size = BLOCK_SIZE as u32;

            let dot = DirEntry::new_reserved(inode_num, ".", FileType::Directory);
            let dotdot = DirEntry::new_reserved(parent_num, "..", FileType::Directory);
            if let Err(e) = dentry::add(&mut self.device, &[block], dot) {
                let _ = self.free_block(block);
                return Err(e);
            }
            if let Err(e) = dentry::add(&mut self.device, &[block], dotdot) {
                let _ = self.free_block(block);
                return Err(e);
            }
            if let Err(e) = self.write_inode(inode_num, &inode) {
                let _ = self.free_block(block);
                return Err(e);
            }

            // From here on the new directory's own inode is fully
            // persisted, so a failure releases it (and transitively its
            // block) the ordinary way via release_inode below.
            let entry = DirEntry::new(inode_num, &name, FileType::Directory)?;
            self.dir_add_entry(parent_num, &mut parent, entry)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                parent.links_count += 1;
                self.write_inode(parent_num, &parent)?;
                debug!("created directory {path:?} at inode {inode_num}");
                Ok(inode_num)
            }
            Err(e) => {
                // release_inode reads the inode back from disk: the
                // closure above only reaches here after that read would
                // see either an untouched slot (for failures before
                // write_inode, already cleaned up by the arms above) or
                // the fully persisted directory inode, so no leaked block
                // is left unaccounted for.
                self.release_inode(inode_num)?;
                Err(e)
            }
        }
    }

    /// Removes the directory entry for `path` and, if that was the last
    /// link to a file, releases the inode and its blocks.
    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let (parent_num, name) = self.split_parent(path)?;
        let parent = self.read_inode(parent_num)?;
        let parent_blocks = self.data_blocks(&parent)?;

        let entry = dentry::find(&mut self.device, &parent_blocks, &name)?.ok_or(FsError::NotFound)?;
        if entry.file_type == FileType::Directory {
            return Err(FsError::Invalid("use rmdir for directories".into()));
        }

        dentry::remove(&mut self.device, &parent_blocks, &name)?;
        let mut inode = self.read_inode(entry.inode_num)?;
        inode.links_count = inode.links_count.saturating_sub(1);
        if inode.links_count == 0 {
            Inode::free(
                &mut self.device,
                self.sb.inode_table_start,
                entry.inode_num,
                &inode,
                &mut self.block_bitmap,
                &mut self.inode_bitmap,
            )?;
            self.sb.free_inodes = self.inode_bitmap.count_free();
            self.sb.free_blocks = self.block_bitmap.count_free();
            self.persist_block_bitmap()?;
            self.persist_inode_bitmap()?;
        } else {
            self.write_inode(entry.inode_num, &inode)?;
        }
        Ok(())
    }

    /// Removes an empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        let (parent_num, name) = self.split_parent(path)?;
        let parent = self.read_inode(parent_num)?;
        let parent_blocks = self.data_blocks(&parent)?;

        let entry = dentry::find(&mut self.device, &parent_blocks, &name)?.ok_or(FsError::NotFound)?;
        if entry.file_type != FileType::Directory {
            return Err(FsError::Invalid("use unlink for files".into()));
        }

        let dir_inode = self.read_inode(entry.inode_num)?;
        let dir_blocks = self.data_blocks(&dir_inode)?;
        let entries = dentry::list(&mut self.device, &dir_blocks)?;
        if entries.iter().any(|e| e.name != "." && e.name != "..") {
            return Err(FsError::Generic("directory not empty".into()));
        }

        dentry::remove(&mut self.device, &parent_blocks, &name)?;
        Inode::free(
            &mut self.device,
            self.sb.inode_table_start,
            entry.inode_num,
            &dir_inode,
            &mut self.block_bitmap,
            &mut self.inode_bitmap,
        )?;
        self.sb.free_inodes = self.inode_bitmap.count_free();
        self.sb.free_blocks = self.block_bitmap.count_free();
        self.persist_block_bitmap()?;
        self.persist_inode_bitmap()?;

        let mut parent = self.read_inode(parent_num)?;
        parent.links_count = parent.links_count.saturating_sub(1);
        self.write_inode(parent_num, &parent)?;
        debug!("removed empty directory {path:?}");
        Ok(())
    }

    /// Creates an additional name for the file at `existing_path`,
    /// pointing at the same inode. Hard links to directories are
    /// rejected to keep the tree acyclic.
    pub fn link(&mut self, existing_path: &str, new_path: &str) -> FsResult<()> {
        let inode_num = self.path_to_inode(existing_path)?;
        let mut inode = self.read_inode(inode_num)?;
        if inode.inode_type != InodeType::File {
            return Err(FsError::Invalid("cannot hard-link a directory".into()));
        }

        let (parent_num, name) = self.split_parent(new_path)?;
        let mut parent = self.read_inode(parent_num)?;
        if parent.inode_type != InodeType::Directory {
            return Err(FsError::Invalid("parent is not a directory".into()));
        }
        let parent_blocks = self.data_blocks(&parent)?;
        if dentry::find(&mut self.device, &parent_blocks, &name)?.is_some() {
            return Err(FsError::Exists);
        }

        let entry = DirEntry::new(inode_num, &name, FileType::File)?;
        self.dir_add_entry(parent_num, &mut parent, entry)?;

        inode.links_count += 1;
        self.write_inode(inode_num, &inode)?;
        Ok(())
    }

    /// Returns a copy of the inode found at `path`.
    pub fn stat(&mut self, path: &str) -> FsResult<Inode> {
        let inode_num = self.path_to_inode(path)?;
        self.read_inode(inode_num)
    }

    /// Lists the entries of the directory at `path`.
    pub fn list(&mut self, path: &str) -> FsResult<Vec<DirEntry>> {
        let inode_num = self.path_to_inode(path)?;
        let inode = self.read_inode(inode_num)?;
        if inode.inode_type != InodeType::Directory {
            return Err(FsError::Invalid("not a directory".into()));
        }
        let blocks = self.data_blocks(&inode)?;
        dentry::list(&mut self.device, &blocks)
    }

    fn release_inode(&mut self, inode_num: u32) -> FsResult<()> {
        let inode = self.read_inode(inode_num)?;
        Inode::free(
            &mut self.device,
            self.sb.inode_table_start,
            inode_num,
            &inode,
            &mut self.block_bitmap,
            &mut self.inode_bitmap,
        )?;
        self.sb.free_inodes = self.inode_bitmap.count_free();
        self.sb.free_blocks = self.block_bitmap.count_free();
        self.persist_block_bitmap()?;
        self.persist_inode_bitmap()?;
        warn!("rolled back inode {inode_num} after a failed operation");
        Ok(())
    }
}

fn read_bitmap(device: &mut dyn BlockDevice, start: u32, blocks: u32, bits: u32) -> FsResult<Bitmap> {
    let mut bytes = Vec::with_capacity(blocks as usize * BLOCK_SIZE);
    let mut buf = [0u8; BLOCK_SIZE];
    for i in 0..blocks {
        device.read_block(start + i, &mut buf)?;
        bytes.extend_from_slice(&buf);
    }
    bytes.truncate(((bits as usize) + 7) / 8);
    Ok(Bitmap::from_bytes(bytes, bits))
}

fn write_bitmap(device: &mut dyn BlockDevice, start: u32, bitmap: &Bitmap) -> FsResult<()> {
    let bytes = bitmap.as_bytes();
    let mut offset = 0;
    let mut block_index = start;
    while offset < bytes.len() {
        let mut buf = [0u8; BLOCK_SIZE];
        let chunk = (bytes.len() - offset).min(BLOCK_SIZE);
        buf[..chunk].copy_from_slice(&bytes[offset..offset + chunk]);
        device.write_block(block_index, &buf)?;
        offset += chunk;
        block_index += 1;
    }
    Ok(())
}
