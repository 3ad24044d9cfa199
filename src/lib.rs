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

//! A block-addressable, Unix-inspired filesystem engine over a
//! fixed-size disk image.
//!
//! The engine owns everything from the superblock down to directory
//! entries, and is agnostic to what backs its blocks: a real file
//! ([`block_device::FileBlockDevice`]) or memory
//! ([`block_device::MemBlockDevice`]). It does not talk to a kernel VFS,
//! a shell, or any process boundary — a caller drives it directly.

pub mod bitmap;
pub mod block_device;
pub mod dentry;
pub mod error;
pub mod fs;
pub mod inode;
pub mod path;
pub mod superblock;

pub use block_device::{BlockDevice, FileBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use dentry::{DirEntry, FileType};
pub use error::{FsError, FsResult};
pub use fs::{Filesystem, FsInfo, OpenFile, OpenFlags, Whence};
pub use inode::{Inode, InodeType, INVALID_INODE, MAX_FILE_SIZE, ROOT_INODE};
pub use superblock::Superblock;
