//! Read-only FAT12/16/32 driver.
//!
//! Understands the BPB, 8.3 directory entries, VFAT long-name chains and
//! cluster chains. The variant is derived from the data-area cluster count
//! exactly as the specification prescribes (< 4085 → FAT12, < 65525 →
//! FAT16, else FAT32); nothing in the boot sector's ASCII label is
//! trusted.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use keel_lib::klog_debug;

use super::dirent::{Dirent, EntType, FileSystem, FsError, path_components};
use super::disk::BlockDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// End-of-chain minimum markers per variant.
const FAT12_EOC: u32 = 0xFF8;
const FAT16_EOC: u32 = 0xFFF8;
const FAT32_EOC: u32 = 0x0FFF_FFF8;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

const DIR_ENTRY_SIZE: usize = 32;

/// Sentinel "cluster" naming the FAT12/16 fixed root directory area.
const ROOT_SENTINEL: u64 = 0;

pub struct Fat {
    device: &'static dyn BlockDevice,
    pub fat_type: FatType,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    /// FAT12/16 only: fixed root directory geometry.
    root_dir_sectors: u32,
    root_lba: u64,
    /// FAT32 only: the root directory's first cluster.
    root_cluster: u32,
    data_lba: u64,
    cluster_count: u32,
}

impl Fat {
    /// Probe the boot sector and construct a driver.
    pub fn mount(device: &'static dyn BlockDevice) -> Result<Self, FsError> {
        let bpb = device.read(0, 1).ok_or(FsError::IoError)?;
        if bpb.len() < 512 || bpb[510] != 0x55 || bpb[511] != 0xAA {
            return Err(FsError::IoError);
        }

        let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u32;
        let sectors_per_cluster = bpb[13] as u32;
        let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u32;
        let fat_count = bpb[16] as u32;
        let root_entries = u16::from_le_bytes([bpb[17], bpb[18]]) as u32;
        let total_sectors_16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u32;
        let fat_size_16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u32;
        let total_sectors_32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]);
        let fat_size_32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]);
        let root_cluster = u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]);

        if bytes_per_sector == 0 || sectors_per_cluster == 0 || fat_count == 0 {
            return Err(FsError::IoError);
        }

        let fat_size_sectors = if fat_size_16 != 0 { fat_size_16 } else { fat_size_32 };
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };

        let root_dir_sectors =
            (root_entries * 32).div_ceil(bytes_per_sector);
        let root_lba = (reserved_sectors + fat_count * fat_size_sectors) as u64;
        let data_lba = root_lba + root_dir_sectors as u64;
        let data_sectors = total_sectors
            .saturating_sub(reserved_sectors + fat_count * fat_size_sectors + root_dir_sectors);
        let cluster_count = data_sectors / sectors_per_cluster;

        let fat_type = if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65_525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        klog_debug!(
            "fat: {:?}, {} clusters of {} bytes, root at lba {}",
            fat_type,
            cluster_count,
            sectors_per_cluster * bytes_per_sector,
            root_lba
        );

        Ok(Self {
            device,
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            root_dir_sectors,
            root_lba,
            root_cluster,
            data_lba,
            cluster_count,
        })
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    fn cluster_to_lba(&self, cluster: u32) -> u64 {
        self.data_lba + ((cluster - 2) * self.sectors_per_cluster) as u64
    }

    fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>, FsError> {
        self.device
            .read(self.cluster_to_lba(cluster), self.sectors_per_cluster as usize)
            .ok_or(FsError::IoError)
    }

    /// Follow the FAT to the next cluster of a chain.
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>, FsError> {
        let fat_offset = match self.fat_type {
            FatType::Fat12 => cluster as usize + cluster as usize / 2,
            FatType::Fat16 => cluster as usize * 2,
            FatType::Fat32 => cluster as usize * 4,
        };
        let sector = self.reserved_sectors as u64 + (fat_offset / self.bytes_per_sector as usize) as u64;
        let within = fat_offset % self.bytes_per_sector as usize;
        // A FAT12 entry can straddle a sector boundary.
        let straddles =
            self.fat_type == FatType::Fat12 && within == self.bytes_per_sector as usize - 1;
        let count = if straddles { 2 } else { 1 };
        let table = self.device.read(sector, count).ok_or(FsError::IoError)?;

        let entry = decode_fat_entry(&table[within..], cluster, self.fat_type);
        let eoc = match self.fat_type {
            FatType::Fat12 => FAT12_EOC,
            FatType::Fat16 => FAT16_EOC,
            FatType::Fat32 => FAT32_EOC,
        };
        if entry >= eoc || entry == 0 {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// Read a whole directory: either the fixed FAT12/16 root area or a
    /// cluster chain.
    fn read_directory(&self, block: u64) -> Result<Vec<u8>, FsError> {
        if block == ROOT_SENTINEL && self.fat_type != FatType::Fat32 {
            return self
                .device
                .read(self.root_lba, self.root_dir_sectors as usize)
                .ok_or(FsError::IoError);
        }

        let mut cluster = if block == ROOT_SENTINEL {
            self.root_cluster
        } else {
            block as u32
        };
        let mut out = Vec::new();
        loop {
            out.extend_from_slice(&self.read_cluster(cluster)?);
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Parse the raw bytes of one directory into entries, assembling
    /// long-name chains.
    fn parse_directory(&'static self, raw: &[u8], dir_block: u64) -> Vec<Dirent> {
        let mut out = Vec::new();
        let mut long_name: Vec<u16> = Vec::new();

        for entry in raw.chunks_exact(DIR_ENTRY_SIZE) {
            match entry[0] {
                0x00 => break,     // end of directory
                0xE5 => {
                    long_name.clear(); // deleted
                    continue;
                }
                _ => {}
            }

            let attrib = entry[11];
            if attrib & ATTR_LONG_NAME == ATTR_LONG_NAME {
                // VFAT: 13 UCS-2 units per entry, chain stored last-first.
                let mut units = [0u16; 13];
                for (i, off) in [1usize, 3, 5, 7, 9].iter().enumerate() {
                    units[i] = u16::from_le_bytes([entry[*off], entry[*off + 1]]);
                }
                for (i, off) in [14usize, 16, 18, 20, 22, 24].iter().enumerate() {
                    units[5 + i] = u16::from_le_bytes([entry[*off], entry[*off + 1]]);
                }
                for (i, off) in [28usize, 30].iter().enumerate() {
                    units[11 + i] = u16::from_le_bytes([entry[*off], entry[*off + 1]]);
                }
                let mut prefix: Vec<u16> = units
                    .iter()
                    .copied()
                    .take_while(|&u| u != 0x0000 && u != 0xFFFF)
                    .collect();
                prefix.extend_from_slice(&long_name);
                long_name = prefix;
                continue;
            }

            let name = if long_name.is_empty() {
                short_name(entry)
            } else {
                let assembled: String = long_name
                    .iter()
                    .map(|&u| char::from_u32(u as u32).unwrap_or('?'))
                    .collect();
                long_name.clear();
                assembled
            };

            if name == "." || name == ".." {
                continue;
            }

            let kind = if attrib & ATTR_VOLUME_ID != 0 {
                EntType::VolumeId
            } else if attrib & ATTR_DIRECTORY != 0 {
                EntType::Dir
            } else {
                EntType::File
            };

            let cluster_hi = u16::from_le_bytes([entry[20], entry[21]]) as u32;
            let cluster_lo = u16::from_le_bytes([entry[26], entry[27]]) as u32;
            let first_cluster = (cluster_hi << 16) | cluster_lo;
            let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]) as u64;

            out.push(Dirent {
                fs: self,
                name,
                kind,
                block: first_cluster as u64,
                parent: dir_block,
                size,
            });
        }
        out
    }
}

/// Decode one FAT table entry. `bytes` starts at the entry's first byte.
pub fn decode_fat_entry(bytes: &[u8], cluster: u32, fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => {
            let raw = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
            if cluster & 1 == 0 { raw & 0x0FFF } else { raw >> 4 }
        }
        FatType::Fat16 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        FatType::Fat32 => {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x0FFF_FFFF
        }
    }
}

/// Decode an 8.3 name: trim-padded base, optional extension.
fn short_name(entry: &[u8]) -> String {
    let base: String = entry[0..8]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .into();
    let ext: String = entry[8..11]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .into();
    if ext.is_empty() {
        base
    } else {
        let mut out = base;
        out.push('.');
        out.push_str(&ext);
        out
    }
}

impl FileSystem for Fat {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn root(&'static self) -> Dirent {
        Dirent {
            fs: self,
            name: String::from("/"),
            kind: EntType::Dir,
            block: ROOT_SENTINEL,
            parent: ROOT_SENTINEL,
            size: 0,
        }
    }

    fn stat(&'static self, path: &str) -> Result<Dirent, FsError> {
        let root = self.root();
        self.stat_from(&root, path)
    }

    fn stat_from(&self, from: &Dirent, path: &str) -> Result<Dirent, FsError> {
        let mut current = from.clone();
        for component in path_components(path) {
            if !current.is_dir() {
                return Err(FsError::NotDir);
            }
            let entries = self.ls(&current)?;
            current = entries
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component))
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    fn ls(&self, dirent: &Dirent) -> Result<Vec<Dirent>, FsError> {
        if !dirent.is_dir() {
            return Err(FsError::NotDir);
        }
        let raw = self.read_directory(dirent.block)?;
        // SAFETY of the 'static self: FAT instances are leaked at mount
        // time and never torn down.
        let this: &'static Fat = unsafe { &*(self as *const Fat) };
        Ok(this.parse_directory(&raw, dirent.block))
    }

    fn read(&self, dirent: &Dirent, pos: u64, n: u64) -> Result<Vec<u8>, FsError> {
        if !dirent.is_file() {
            return Err(FsError::NotFile);
        }
        if pos >= dirent.size {
            return Ok(Vec::new());
        }
        let end = (pos + n).min(dirent.size);
        let cluster_size = self.cluster_size() as u64;

        let mut out = Vec::new();
        let mut cluster = dirent.block as u32;
        let mut offset = 0u64;
        while offset < end {
            if cluster < 2 {
                return Err(FsError::IoError);
            }
            if offset + cluster_size > pos {
                let data = self.read_cluster(cluster)?;
                let lo = pos.saturating_sub(offset) as usize;
                let hi = ((end - offset).min(cluster_size)) as usize;
                out.extend_from_slice(&data[lo..hi]);
            }
            offset += cluster_size;
            if offset >= end {
                break;
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(out)
    }
}
