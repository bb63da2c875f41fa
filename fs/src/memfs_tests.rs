//! In-memory filesystem regression tests.

extern crate alloc;

use alloc::boxed::Box;

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, pass};

use crate::dirent::{EntType, FileSystem, FsError};
use crate::memfs::{DIRENTS_PER_BLOCK, Memfs};

fn make_fs() -> &'static Memfs {
    Box::leak(Box::new(Memfs::new(64, 128)))
}

pub fn test_empty_image_has_root() -> TestResult {
    let fs = make_fs();
    let root = fs.root();
    assert_eq_test!(root.kind, EntType::Dir, "root is a directory");
    assert_test!(root.ls().unwrap().is_empty(), "and empty");
    pass!()
}

pub fn test_mkdir_and_lookup() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/etc").unwrap();
    fs.mkdir("/etc/conf.d").unwrap();

    let etc = fs.stat("/etc").unwrap();
    assert_eq_test!(etc.kind, EntType::Dir, "created directory resolves");
    let nested = fs.stat("/etc/conf.d").unwrap();
    assert_eq_test!(nested.kind, EntType::Dir, "nested directory resolves");

    assert_eq_test!(
        fs.mkdir("/etc").err(),
        Some(FsError::AlreadyExists),
        "duplicate refused"
    );
    assert_eq_test!(
        fs.mkdir("/missing/parent/dir").err(),
        Some(FsError::NotFound),
        "parents are not implied"
    );
    pass!()
}

pub fn test_file_roundtrip() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/data").unwrap();
    fs.create_file("/data/greeting", b"hello memfs").unwrap();

    let file = fs.stat("/data/greeting").unwrap();
    assert_eq_test!(file.kind, EntType::File, "file type");
    assert_eq_test!(file.size, 11, "size recorded");
    assert_eq_test!(&file.read(0, 64).unwrap()[..], b"hello memfs", "contents");
    assert_eq_test!(&file.read(6, 64).unwrap()[..], b"memfs", "offset read");
    pass!()
}

pub fn test_multi_block_file() -> TestResult {
    let fs = make_fs();
    let payload: alloc::vec::Vec<u8> = (0..1500u32).map(|i| (i % 241) as u8).collect();
    fs.create_file("/big", &payload).unwrap();

    let file = fs.stat("/big").unwrap();
    assert_eq_test!(file.size, 1500, "spans three blocks");
    let back = file.read(0, 1500).unwrap();
    assert_eq_test!(back.len(), 1500, "full read");
    assert_test!(back == payload, "content intact across blocks");

    // Straddling read across the first block boundary.
    let window = file.read(500, 100).unwrap();
    assert_eq_test!(window.len(), 100, "window length");
    assert_eq_test!(window[0], (500 % 241) as u8, "window start");
    assert_eq_test!(window[99], (599 % 241) as u8, "window end");
    pass!()
}

pub fn test_rmdir_requires_empty() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/tmp").unwrap();
    fs.create_file("/tmp/file", b"x").unwrap();

    assert_eq_test!(
        fs.rmdir("/tmp").err(),
        Some(FsError::NotEmpty),
        "occupied directory refused"
    );
    // Root is never removable.
    assert_test!(fs.rmdir("/").is_err(), "root refused");
    pass!()
}

pub fn test_rmdir_releases_and_name_is_reusable() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/scratch").unwrap();
    fs.rmdir("/scratch").unwrap();

    assert_eq_test!(
        fs.stat("/scratch").err(),
        Some(FsError::NotFound),
        "gone after rmdir"
    );
    assert_test!(fs.mkdir("/scratch").is_ok(), "name reusable");
    pass!()
}

pub fn test_hardlinks_block_rmdir_of_parent_content() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/a").unwrap();
    fs.create_file("/a/orig", b"shared").unwrap();
    fs.link("/a/orig", "/a/alias").unwrap();

    let alias = fs.stat("/a/alias").unwrap();
    assert_eq_test!(&alias.read(0, 16).unwrap()[..], b"shared", "alias reads the file");
    pass!()
}

pub fn test_directory_grows_past_one_block() -> TestResult {
    let fs = make_fs();
    fs.mkdir("/many").unwrap();
    // More entries than one 16-pointer directory block holds.
    for i in 0..DIRENTS_PER_BLOCK + 4 {
        let mut name = alloc::string::String::from("/many/d");
        name.push((b'a' + (i / 10) as u8) as char);
        name.push((b'0' + (i % 10) as u8) as char);
        fs.mkdir(&name).unwrap();
    }

    let listing = fs.stat("/many").unwrap().ls().unwrap();
    assert_eq_test!(listing.len(), DIRENTS_PER_BLOCK + 4, "all entries listed");
    pass!()
}

define_test_suite!(
    memfs,
    [
        test_empty_image_has_root,
        test_mkdir_and_lookup,
        test_file_roundtrip,
        test_multi_block_file,
        test_rmdir_requires_empty,
        test_rmdir_releases_and_name_is_reusable,
        test_hardlinks_block_rmdir_of_parent_content,
        test_directory_grows_past_one_block,
    ]
);
