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

//! Formats a disk image file as a fresh blockfs filesystem.
//!
//! A thin wrapper around [`blockfs::Filesystem::format`]; all the actual
//! layout work happens in the library.

use blockfs::{BlockDevice, FileBlockDevice, Filesystem, Superblock, BLOCK_SIZE};
use clap::Parser;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "mkfs-blockfs", about = "Format a file as a blockfs image")]
struct Args {
    /// Path to the image file to create (truncated/extended as needed).
    image: String,

    /// Size of the image in bytes. Rounded down to a multiple of the
    /// block size.
    #[arg(short, long, default_value_t = 1024 * 1024)]
    size: u64,

    /// Number of inodes to reserve. Defaults to a count derived from the
    /// image size.
    #[arg(short = 'n', long)]
    inodes: Option<u32>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn run(args: Args) -> blockfs::FsResult<()> {
    let size = (args.size / BLOCK_SIZE as u64) * BLOCK_SIZE as u64;
    let device = FileBlockDevice::create(&args.image, size)?;
    let total_inodes = args
        .inodes
        .unwrap_or_else(|| Superblock::derive_inode_count(device.block_count()));
    let fs = Filesystem::format(device, total_inodes, now())?;
    let info = fs.info();
    fs.unmount()?;

    println!(
        "formatted {} ({} blocks, {} inodes, {} free blocks)",
        args.image, info.total_blocks, info.total_inodes, info.free_blocks
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mkfs-blockfs: {e}");
            ExitCode::FAILURE
        }
    }
}
