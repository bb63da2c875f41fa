//! FAT driver regression tests.
//!
//! A small FAT12 volume is assembled in memory and walked end to end;
//! table decoding for all three variants is exercised directly.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::dirent::{EntType, FileSystem, FsError};
use crate::disk::{BLOCK_SIZE, MemDisk};
use crate::fat::{Fat, FatType, decode_fat_entry};

// -----------------------------------------------------------------------------
// Image construction: 64 sectors, 512 B each, 1 FAT sector, 1 root sector.
// Layout: [0] BPB  [1] FAT  [2] root dir  [3..] data (cluster 2 = sector 3).
// -----------------------------------------------------------------------------

const SECTORS: usize = 64;

fn set_fat12(table: &mut [u8], cluster: usize, value: u16) {
    let offset = cluster + cluster / 2;
    if cluster % 2 == 0 {
        table[offset] = (value & 0xFF) as u8;
        table[offset + 1] = (table[offset + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
    } else {
        table[offset] = (table[offset] & 0x0F) | (((value & 0x0F) as u8) << 4);
        table[offset + 1] = (value >> 4) as u8;
    }
}

fn short_entry(name: &[u8; 11], attrib: u8, cluster: u16, size: u32) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0..11].copy_from_slice(name);
    entry[11] = attrib;
    entry[26..28].copy_from_slice(&cluster.to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
    entry
}

/// One VFAT long-name entry carrying 13 UCS-2 units.
fn lfn_entry(sequence: u8, chars: &[u16; 13]) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0] = sequence;
    entry[11] = 0x0F;
    for (i, off) in [1usize, 3, 5, 7, 9].iter().enumerate() {
        entry[*off..*off + 2].copy_from_slice(&chars[i].to_le_bytes());
    }
    for (i, off) in [14usize, 16, 18, 20, 22, 24].iter().enumerate() {
        entry[*off..*off + 2].copy_from_slice(&chars[5 + i].to_le_bytes());
    }
    for (i, off) in [28usize, 30].iter().enumerate() {
        entry[*off..*off + 2].copy_from_slice(&chars[11 + i].to_le_bytes());
    }
    entry
}

fn lfn_units(text: &str) -> [u16; 13] {
    let mut units = [0xFFFFu16; 13];
    let mut terminated = false;
    for (i, slot) in units.iter_mut().enumerate() {
        match text.encode_utf16().nth(i) {
            Some(u) => *slot = u,
            None if !terminated => {
                *slot = 0;
                terminated = true;
            }
            None => {}
        }
    }
    units
}

fn build_image() -> Vec<u8> {
    let mut image = alloc::vec![0u8; SECTORS * BLOCK_SIZE];

    // --- BPB (sector 0) ---
    image[11..13].copy_from_slice(&512u16.to_le_bytes()); // bytes/sector
    image[13] = 1; // sectors/cluster
    image[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
    image[16] = 1; // FATs
    image[17..19].copy_from_slice(&16u16.to_le_bytes()); // root entries
    image[19..21].copy_from_slice(&(SECTORS as u16).to_le_bytes());
    image[22..24].copy_from_slice(&1u16.to_le_bytes()); // FAT sectors
    image[510] = 0x55;
    image[511] = 0xAA;

    // --- FAT (sector 1) ---
    {
        let fat = &mut image[512..1024];
        set_fat12(fat, 0, 0xFF8);
        set_fat12(fat, 1, 0xFFF);
        set_fat12(fat, 2, 0xFFF); // HELLO.TXT — single cluster
        set_fat12(fat, 3, 0xFFF); // SUB directory
        set_fat12(fat, 4, 0xFFF); // WORLD.TXT
        set_fat12(fat, 5, 6); // BIG.BIN spans clusters 5 → 6
        set_fat12(fat, 6, 0xFFF);
    }

    // --- Root directory (sector 2) ---
    let root = 2 * BLOCK_SIZE;
    image[root..root + 32]
        .copy_from_slice(&short_entry(b"HELLO   TXT", 0x20, 2, 9));
    image[root + 32..root + 64].copy_from_slice(&short_entry(b"SUB        ", 0x10, 3, 0));
    image[root + 64..root + 96].copy_from_slice(&short_entry(b"BIG     BIN", 0x20, 5, 700));

    // --- Cluster 2 (sector 3): HELLO.TXT ---
    let data = 3 * BLOCK_SIZE;
    image[data..data + 9].copy_from_slice(b"hello fat");

    // --- Cluster 3 (sector 4): the SUB directory ---
    let sub = 4 * BLOCK_SIZE;
    let mut dot = short_entry(b".          ", 0x10, 3, 0);
    image[sub..sub + 32].copy_from_slice(&dot);
    dot = short_entry(b"..         ", 0x10, 0, 0);
    image[sub + 32..sub + 64].copy_from_slice(&dot);
    // "World File.txt" as a two-entry LFN chain ahead of the 8.3 entry:
    // the last fragment (sequence 0x42) first, then the 13-unit fragment.
    image[sub + 64..sub + 96].copy_from_slice(&lfn_entry(0x42, &lfn_units("t")));
    image[sub + 96..sub + 128]
        .copy_from_slice(&lfn_entry(0x01, &lfn_units_full("World File.tx")));
    image[sub + 128..sub + 160].copy_from_slice(&short_entry(b"WORLD   TXT", 0x20, 4, 5));

    // --- Cluster 4 (sector 5): WORLD.TXT ---
    let world = 5 * BLOCK_SIZE;
    image[world..world + 5].copy_from_slice(b"world");

    // --- Clusters 5/6 (sectors 6, 7): BIG.BIN, 700 bytes ---
    for i in 0..700usize {
        image[6 * BLOCK_SIZE + i] = (i % 251) as u8;
    }

    image
}

/// Thirteen units with no terminator (a full LFN fragment).
fn lfn_units_full(text: &str) -> [u16; 13] {
    let mut units = [0xFFFFu16; 13];
    for (i, u) in text.encode_utf16().take(13).enumerate() {
        units[i] = u;
    }
    units
}

fn mount_image() -> Result<&'static Fat, FsError> {
    let image: &'static [u8] = Box::leak(build_image().into_boxed_slice());
    let device: &'static MemDisk = Box::leak(Box::new(MemDisk::new(image)));
    let fat = Fat::mount(device)?;
    Ok(Box::leak(Box::new(fat)))
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

pub fn test_fat_entry_decoding_all_widths() -> TestResult {
    // FAT12, even cluster: low 12 bits of the 16-bit window.
    assert_eq_test!(
        decode_fat_entry(&[0x34, 0xA2], 2, FatType::Fat12),
        0x234,
        "fat12 even"
    );
    // FAT12, odd cluster: high 12 bits.
    assert_eq_test!(
        decode_fat_entry(&[0xA4, 0x56], 3, FatType::Fat12),
        0x56A,
        "fat12 odd"
    );
    assert_eq_test!(
        decode_fat_entry(&[0x22, 0x11], 7, FatType::Fat16),
        0x1122,
        "fat16"
    );
    // FAT32 masks the top nibble.
    assert_eq_test!(
        decode_fat_entry(&[0x44, 0x33, 0x22, 0xF1], 7, FatType::Fat32),
        0x0122_3344,
        "fat32 masked"
    );
    pass!()
}

pub fn test_mount_detects_fat12() -> TestResult {
    let fat = match mount_image() {
        Ok(f) => f,
        Err(e) => return fail!("mount: {:?}", e),
    };
    assert_eq_test!(fat.fat_type, FatType::Fat12, "small volume is FAT12");
    assert_test!(fat.cluster_count() < 4085, "cluster count in FAT12 range");
    pass!()
}

pub fn test_root_listing() -> TestResult {
    let fat = mount_image().unwrap();
    let root = fat.root();
    let entries = match root.ls() {
        Ok(e) => e,
        Err(e) => return fail!("ls: {:?}", e),
    };
    assert_eq_test!(entries.len(), 3, "three root entries");

    let hello = entries.iter().find(|e| e.name == "HELLO.TXT").unwrap();
    assert_eq_test!(hello.kind, EntType::File, "file type");
    assert_eq_test!(hello.size, 9, "size from the entry");

    let sub = entries.iter().find(|e| e.name == "SUB").unwrap();
    assert_eq_test!(sub.kind, EntType::Dir, "directory type");
    pass!()
}

pub fn test_file_read() -> TestResult {
    let fat = mount_image().unwrap();
    let hello = fat.stat("/HELLO.TXT").unwrap();
    let data = hello.read(0, 64).unwrap();
    assert_eq_test!(&data[..], b"hello fat", "contents");

    // Offset reads.
    let tail = hello.read(6, 64).unwrap();
    assert_eq_test!(&tail[..], b"fat", "offset read");
    assert_test!(hello.read(100, 4).unwrap().is_empty(), "past EOF reads empty");
    pass!()
}

pub fn test_multi_cluster_read_follows_chain() -> TestResult {
    let fat = mount_image().unwrap();
    let big = fat.stat("/BIG.BIN").unwrap();
    assert_eq_test!(big.size, 700, "size spans two clusters");

    let data = big.read(0, 700).unwrap();
    assert_eq_test!(data.len(), 700, "whole file");
    // Verify content across the cluster boundary at byte 512.
    assert_eq_test!(data[511], (511 % 251) as u8, "last byte of cluster 5");
    assert_eq_test!(data[512], (512 % 251) as u8, "first byte of cluster 6");
    pass!()
}

pub fn test_long_name_chain() -> TestResult {
    let fat = mount_image().unwrap();
    let sub = fat.stat("/SUB").unwrap();
    let entries = sub.ls().unwrap();

    // "." and ".." are hidden; only the long-named file remains.
    assert_eq_test!(entries.len(), 1, "one visible entry");
    assert_eq_test!(entries[0].name.as_str(), "World File.txt", "assembled long name");
    assert_eq_test!(entries[0].size, 5, "8.3 entry supplies metadata");

    let world = fat.stat("/SUB/World File.txt").unwrap();
    assert_eq_test!(&world.read(0, 16).unwrap()[..], b"world", "contents");
    pass!()
}

pub fn test_relative_stat() -> TestResult {
    let fat = mount_image().unwrap();
    let sub = fat.stat("/SUB").unwrap();
    let world = sub.stat("World File.txt").unwrap();
    assert_eq_test!(world.size, 5, "resolved relative to the directory");

    assert_eq_test!(
        fat.stat("/SUB/missing").err(),
        Some(FsError::NotFound),
        "missing child"
    );
    assert_eq_test!(
        fat.stat("/HELLO.TXT/inner").err(),
        Some(FsError::NotDir),
        "file used as directory"
    );
    pass!()
}

pub fn test_case_insensitive_lookup() -> TestResult {
    let fat = mount_image().unwrap();
    assert_test!(fat.stat("/hello.txt").is_ok(), "8.3 names match any case");
    pass!()
}

pub fn test_bad_boot_sector_rejected() -> TestResult {
    let mut image = build_image();
    image[510] = 0;
    let leaked: &'static [u8] = Box::leak(image.into_boxed_slice());
    let device: &'static MemDisk = Box::leak(Box::new(MemDisk::new(leaked)));
    assert_test!(Fat::mount(device).is_err(), "missing signature rejected");
    pass!()
}

define_test_suite!(
    fat,
    [
        test_fat_entry_decoding_all_widths,
        test_mount_detects_fat12,
        test_root_listing,
        test_file_read,
        test_multi_cluster_read_follows_chain,
        test_long_name_chain,
        test_relative_stat,
        test_case_insensitive_lookup,
        test_bad_boot_sector_rejected,
    ]
);
