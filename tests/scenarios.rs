//! End-to-end lifecycle scenarios: format a real file-backed image, mount
//! it, operate, and unmount, exercising the properties spelled out for
//! the engine as a whole rather than any single module in isolation.

use blockfs::{FileBlockDevice, Filesystem, OpenFlags, Whence};

fn image(dir: &tempfile::TempDir, blocks: u32) -> FileBlockDevice {
    let path = dir.path().join("scenario.img");
    FileBlockDevice::create(&path, blocks as u64 * blockfs::BLOCK_SIZE as u64).unwrap()
}

#[test]
fn round_trip_small_file_across_unmount() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);

    let mut fs = Filesystem::format(device, 64, 1).unwrap();
    fs.create("/greeting.txt", 0o644, 2).unwrap();
    let mut file = fs.open("/greeting.txt", OpenFlags::RDWR, 0, 2).unwrap();
    fs.write(&mut file, b"hello, blockfs", 3).unwrap();
    let device = fs.unmount().unwrap();

    let mut fs = Filesystem::mount(device, 4).unwrap();
    let mut file = fs.open("/greeting.txt", OpenFlags::RDONLY, 0, 5).unwrap();
    let mut buf = [0u8; 14];
    fs.read(&mut file, &mut buf, 6).unwrap();
    assert_eq!(&buf, b"hello, blockfs");
}

#[test]
fn hard_link_semantics_share_data_until_last_unlink() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    fs.create("/a.txt", 0o644, 2).unwrap();
    let mut file = fs.open("/a.txt", OpenFlags::RDWR, 0, 2).unwrap();
    fs.write(&mut file, b"shared", 2).unwrap();
    fs.link("/a.txt", "/b.txt").unwrap();

    let stat_a = fs.stat("/a.txt").unwrap();
    let stat_b = fs.stat("/b.txt").unwrap();
    assert_eq!(stat_a.links_count, 2);
    assert_eq!(stat_b.links_count, 2);

    fs.unlink("/a.txt").unwrap();
    assert!(fs.path_to_inode("/a.txt").is_err());

    let mut file = fs.open("/b.txt", OpenFlags::RDONLY, 0, 3).unwrap();
    let mut buf = [0u8; 6];
    fs.read(&mut file, &mut buf, 4).unwrap();
    assert_eq!(&buf, b"shared");
}

#[test]
fn unlink_releases_space_on_last_link() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    let free_before = fs.info().free_blocks;
    fs.create("/solo.txt", 0o644, 2).unwrap();
    let mut file = fs.open("/solo.txt", OpenFlags::RDWR, 0, 2).unwrap();
    fs.write(&mut file, &vec![0xAB; 4096], 2).unwrap();
    assert!(fs.info().free_blocks < free_before);

    fs.unlink("/solo.txt").unwrap();
    assert_eq!(fs.info().free_blocks, free_before);
}

#[test]
fn directory_emptiness_gates_rmdir() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    fs.mkdir("/docs", 0o755, 2).unwrap();
    assert!(fs.rmdir("/docs").is_ok());

    fs.mkdir("/docs", 0o755, 3).unwrap();
    fs.create("/docs/readme.txt", 0o644, 4).unwrap();
    assert!(fs.rmdir("/docs").is_err());
    fs.unlink("/docs/readme.txt").unwrap();
    assert!(fs.rmdir("/docs").is_ok());
}

#[test]
fn path_normalization_matches_cd_equivalent_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    fs.mkdir("/a", 0o755, 1).unwrap();
    fs.mkdir("/a/b", 0o755, 2).unwrap();
    let inode = fs.create("/a/b/c.txt", 0o644, 3).unwrap();

    let direct = fs.path_to_inode("/a/b/c.txt").unwrap();
    let via_dotdot = fs.path_to_inode("/a/./b/../b/c.txt").unwrap();
    let via_root = fs.path_to_inode("/a/b/../../a/b/c.txt").unwrap();
    assert_eq!(direct, inode);
    assert_eq!(via_dotdot, inode);
    assert_eq!(via_root, inode);
}

#[test]
fn cd_navigation_matches_spec_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 256);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    fs.mkdir("/dir1", 0o755, 1).unwrap();
    fs.mkdir("/dir1/dir2", 0o755, 2).unwrap();

    fs.cd("/dir1/dir2").unwrap();
    fs.cd("./").unwrap();
    fs.cd("../..").unwrap();
    assert_eq!(fs.current_dir_inode(), blockfs::ROOT_INODE);

    assert!(fs.cd("/does_not_exist").is_err());

    fs.create("/f", 0o644, 3).unwrap();
    assert!(fs.cd("/f").is_err());
}

#[test]
fn sparse_file_boundary_reads_back_zeroed() {
    let dir = tempfile::tempdir().unwrap();
    let device = image(&dir, 512);
    let mut fs = Filesystem::format(device, 64, 1).unwrap();

    fs.create("/sparse.bin", 0o644, 1).unwrap();
    let mut file = fs.open("/sparse.bin", OpenFlags::RDWR, 0, 1).unwrap();
    // Land just past the 12 direct blocks, forcing the indirect block
    // into existence, then write a marker at the very boundary.
    let boundary = (12 * blockfs::BLOCK_SIZE) as i64;
    fs.seek(&mut file, boundary, Whence::Start).unwrap();
    fs.write(&mut file, b"X", 2).unwrap();

    let mut file = fs.open("/sparse.bin", OpenFlags::RDONLY, 0, 3).unwrap();
    let mut buf = vec![0xFFu8; boundary as usize];
    let read = fs.read(&mut file, &mut buf, 4).unwrap();
    assert_eq!(read, boundary as usize);
    assert!(buf.iter().all(|&b| b == 0));

    fs.seek(&mut file, boundary, Whence::Start).unwrap();
    let mut marker = [0u8; 1];
    fs.read(&mut file, &mut marker, 5).unwrap();
    assert_eq!(marker, *b"X");
}
