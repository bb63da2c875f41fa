//! The in-memory filesystem.
//!
//! A pinned image format: superblock, inode table, one bitmap per inode
//! and data-block space, and fixed-size directory blocks holding sixteen
//! inode pointers each. Path lookup descends directory blocks; `mkdir`
//! allocates an inode and links it into the parent; `rmdir` requires an
//! empty directory with no extra hardlinks.
//!
//! Internals sit behind a lock so the mounted (shared) handle can serve
//! reads while the maintenance calls mutate.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use keel_lib::IrqMutex;

use super::dirent::{Dirent, EntType, FileSystem, FsError, path_components};

pub const MEMFS_MAGIC: u32 = 0x6B66_736D; // "mskf"
pub const MEMFS_BLOCK_SIZE: usize = 512;
/// Sixteen 32-byte entries per directory block.
pub const DIRENTS_PER_BLOCK: usize = 16;
const DIR_ENTRY_SIZE: usize = 32;
const NAME_MAX: usize = 27;
/// Direct blocks per inode; no indirection in a pinned image.
const DIRECT_BLOCKS: usize = 8;

const KIND_FREE: u8 = 0;
const KIND_FILE: u8 = 1;
const KIND_DIR: u8 = 2;

#[derive(Clone, Copy)]
struct Inode {
    kind: u8,
    /// Hardlink count: 1 for the parent link, +1 per extra link.
    nlink: u16,
    size: u32,
    blocks: [u32; DIRECT_BLOCKS],
}

impl Inode {
    const FREE: Self = Self {
        kind: KIND_FREE,
        nlink: 0,
        size: 0,
        blocks: [0; DIRECT_BLOCKS],
    };
}

struct Superblock {
    magic: u32,
    num_inodes: u32,
    num_blocks: u32,
    root_inode: u32,
}

struct MemfsInner {
    sb: Superblock,
    inode_bitmap: Vec<u8>,
    block_bitmap: Vec<u8>,
    inodes: Vec<Inode>,
    data: Vec<u8>,
}

pub struct Memfs {
    inner: IrqMutex<MemfsInner>,
}

fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    bitmap[(idx / 8) as usize] & (1 << (idx % 8)) != 0
}

fn bitmap_set(bitmap: &mut [u8], idx: u32, value: bool) {
    let byte = &mut bitmap[(idx / 8) as usize];
    if value {
        *byte |= 1 << (idx % 8);
    } else {
        *byte &= !(1 << (idx % 8));
    }
}

fn bitmap_find_free(bitmap: &[u8], limit: u32) -> Option<u32> {
    (0..limit).find(|&i| !bitmap_get(bitmap, i))
}

impl MemfsInner {
    fn block(&self, idx: u32) -> &[u8] {
        let start = idx as usize * MEMFS_BLOCK_SIZE;
        &self.data[start..start + MEMFS_BLOCK_SIZE]
    }

    fn block_mut(&mut self, idx: u32) -> &mut [u8] {
        let start = idx as usize * MEMFS_BLOCK_SIZE;
        &mut self.data[start..start + MEMFS_BLOCK_SIZE]
    }

    fn alloc_inode(&mut self) -> Result<u32, FsError> {
        let idx =
            bitmap_find_free(&self.inode_bitmap, self.sb.num_inodes).ok_or(FsError::NoSpace)?;
        bitmap_set(&mut self.inode_bitmap, idx, true);
        self.inodes[idx as usize] = Inode::FREE;
        Ok(idx)
    }

    fn alloc_block(&mut self) -> Result<u32, FsError> {
        let idx =
            bitmap_find_free(&self.block_bitmap, self.sb.num_blocks).ok_or(FsError::NoSpace)?;
        bitmap_set(&mut self.block_bitmap, idx, true);
        self.block_mut(idx).fill(0);
        Ok(idx)
    }

    fn free_inode(&mut self, idx: u32) {
        bitmap_set(&mut self.inode_bitmap, idx, false);
        self.inodes[idx as usize] = Inode::FREE;
    }

    /// Iterate a directory's entries: `(block, slot, inode, name)`.
    fn dir_entries(&self, dir: u32) -> Vec<(u32, usize, u32, String)> {
        let mut out = Vec::new();
        let inode = self.inodes[dir as usize];
        for &block in inode.blocks.iter().filter(|&&b| b != 0) {
            let bytes = self.block(block);
            for slot in 0..DIRENTS_PER_BLOCK {
                let entry = &bytes[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE];
                let child = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                if child == 0 {
                    continue;
                }
                let len = entry[4] as usize;
                let name: String = entry[5..5 + len.min(NAME_MAX)]
                    .iter()
                    .map(|&b| b as char)
                    .collect();
                out.push((block, slot, child - 1, name));
            }
        }
        out
    }

    fn find_child(&self, dir: u32, name: &str) -> Option<u32> {
        self.dir_entries(dir)
            .into_iter()
            .find(|(_, _, _, n)| n == name)
            .map(|(_, _, inode, _)| inode)
    }

    /// Add a `name → child` link in `dir`, growing the directory by one
    /// block when every slot is taken.
    fn add_link(&mut self, dir: u32, name: &str, child: u32) -> Result<(), FsError> {
        if name.len() > NAME_MAX {
            return Err(FsError::InvalidPath);
        }

        // An existing free slot first.
        for block_slot in 0..DIRECT_BLOCKS {
            let block = self.inodes[dir as usize].blocks[block_slot];
            if block == 0 {
                continue;
            }
            for slot in 0..DIRENTS_PER_BLOCK {
                let start = slot * DIR_ENTRY_SIZE;
                if self.block(block)[start] == 0
                    && self.block(block)[start + 1] == 0
                    && self.block(block)[start + 2] == 0
                    && self.block(block)[start + 3] == 0
                {
                    self.write_link(block, slot, name, child);
                    return Ok(());
                }
            }
        }

        // Grow the directory.
        let free_slot = self.inodes[dir as usize]
            .blocks
            .iter()
            .position(|&b| b == 0)
            .ok_or(FsError::NoSpace)?;
        let block = self.alloc_block()?;
        self.inodes[dir as usize].blocks[free_slot] = block;
        self.inodes[dir as usize].size += MEMFS_BLOCK_SIZE as u32;
        self.write_link(block, 0, name, child);
        Ok(())
    }

    fn write_link(&mut self, block: u32, slot: usize, name: &str, child: u32) {
        let start = slot * DIR_ENTRY_SIZE;
        let bytes = self.block_mut(block);
        // Inode pointers are stored +1 so 0 stays the free marker.
        bytes[start..start + 4].copy_from_slice(&(child + 1).to_le_bytes());
        bytes[start + 4] = name.len() as u8;
        for (i, b) in name.bytes().take(NAME_MAX).enumerate() {
            bytes[start + 5 + i] = b;
        }
    }

    fn remove_link(&mut self, dir: u32, name: &str) -> Result<u32, FsError> {
        let entry = self
            .dir_entries(dir)
            .into_iter()
            .find(|(_, _, _, n)| n == name)
            .ok_or(FsError::NotFound)?;
        let (block, slot, child, _) = entry;
        let start = slot * DIR_ENTRY_SIZE;
        self.block_mut(block)[start..start + DIR_ENTRY_SIZE].fill(0);
        Ok(child)
    }

    fn lookup(&self, path: &str) -> Result<u32, FsError> {
        let mut current = self.sb.root_inode;
        for component in path_components(path) {
            if self.inodes[current as usize].kind != KIND_DIR {
                return Err(FsError::NotDir);
            }
            current = self.find_child(current, component).ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    /// Parent inode and final component of `path`.
    fn lookup_parent<'p>(&self, path: &'p str) -> Result<(u32, &'p str), FsError> {
        let mut components: Vec<&str> = path_components(path).collect();
        let leaf = components.pop().ok_or(FsError::InvalidPath)?;
        let mut current = self.sb.root_inode;
        for component in components {
            if self.inodes[current as usize].kind != KIND_DIR {
                return Err(FsError::NotDir);
            }
            current = self.find_child(current, component).ok_or(FsError::NotFound)?;
        }
        Ok((current, leaf))
    }
}

impl Memfs {
    /// Create an empty image with the given table sizes.
    pub fn new(num_inodes: u32, num_blocks: u32) -> Self {
        let mut inner = MemfsInner {
            sb: Superblock {
                magic: MEMFS_MAGIC,
                num_inodes,
                num_blocks,
                root_inode: 0,
            },
            inode_bitmap: alloc::vec![0; num_inodes.div_ceil(8) as usize],
            block_bitmap: alloc::vec![0; num_blocks.div_ceil(8) as usize],
            inodes: alloc::vec![Inode::FREE; num_inodes as usize],
            data: alloc::vec![0; num_blocks as usize * MEMFS_BLOCK_SIZE],
        };

        // Block 0 is reserved so 0 can mean "no block" in inode tables.
        bitmap_set(&mut inner.block_bitmap, 0, true);

        // The root directory.
        bitmap_set(&mut inner.inode_bitmap, 0, true);
        inner.inodes[0] = Inode {
            kind: KIND_DIR,
            nlink: 1,
            size: 0,
            blocks: [0; DIRECT_BLOCKS],
        };

        Self {
            inner: IrqMutex::new(inner),
        }
    }

    pub fn magic(&self) -> u32 {
        self.inner.lock().sb.magic
    }

    /// Create a directory. The parent must already exist.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.lookup_parent(path)?;
        if inner.inodes[parent as usize].kind != KIND_DIR {
            return Err(FsError::NotDir);
        }
        if inner.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let inode = inner.alloc_inode()?;
        inner.inodes[inode as usize] = Inode {
            kind: KIND_DIR,
            nlink: 1,
            size: 0,
            blocks: [0; DIRECT_BLOCKS],
        };
        match inner.add_link(parent, name, inode) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.free_inode(inode);
                Err(e)
            }
        }
    }

    /// Remove an empty directory with no extra hardlinks.
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let inode = inner.lookup(path)?;
        if inode == inner.sb.root_inode {
            return Err(FsError::InvalidPath);
        }
        if inner.inodes[inode as usize].kind != KIND_DIR {
            return Err(FsError::NotDir);
        }
        if !inner.dir_entries(inode).is_empty() {
            return Err(FsError::NotEmpty);
        }
        if inner.inodes[inode as usize].nlink > 1 {
            return Err(FsError::NotEmpty);
        }

        let (parent, name) = inner.lookup_parent(path)?;
        inner.remove_link(parent, name)?;
        // Release the directory's blocks and the inode itself.
        for block_idx in 0..DIRECT_BLOCKS {
            let block = inner.inodes[inode as usize].blocks[block_idx];
            if block != 0 {
                bitmap_set(&mut inner.block_bitmap, block, false);
            }
        }
        inner.free_inode(inode);
        Ok(())
    }

    /// Create a file with the given contents (image population).
    pub fn create_file(&self, path: &str, contents: &[u8]) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.lookup_parent(path)?;
        if inner.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if contents.len() > DIRECT_BLOCKS * MEMFS_BLOCK_SIZE {
            return Err(FsError::NoSpace);
        }

        let inode = inner.alloc_inode()?;
        let mut blocks = [0u32; DIRECT_BLOCKS];
        for (i, chunk) in contents.chunks(MEMFS_BLOCK_SIZE).enumerate() {
            let block = inner.alloc_block()?;
            inner.block_mut(block)[..chunk.len()].copy_from_slice(chunk);
            blocks[i] = block;
        }
        inner.inodes[inode as usize] = Inode {
            kind: KIND_FILE,
            nlink: 1,
            size: contents.len() as u32,
            blocks,
        };
        inner.add_link(parent, name, inode)
    }

    /// Add an extra hardlink to an existing file.
    pub fn link(&self, existing: &str, new_path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let inode = inner.lookup(existing)?;
        if inner.inodes[inode as usize].kind != KIND_FILE {
            return Err(FsError::NotFile);
        }
        let (parent, name) = inner.lookup_parent(new_path)?;
        if inner.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        inner.add_link(parent, name, inode)?;
        inner.inodes[inode as usize].nlink += 1;
        Ok(())
    }

    fn dirent_for(&'static self, inode: u32, name: String, parent: u32) -> Dirent {
        let inner = self.inner.lock();
        let node = inner.inodes[inode as usize];
        Dirent {
            fs: self,
            name,
            kind: match node.kind {
                KIND_DIR => EntType::Dir,
                KIND_FILE => EntType::File,
                _ => EntType::Invalid,
            },
            block: inode as u64,
            parent: parent as u64,
            size: node.size as u64,
        }
    }
}

impl FileSystem for Memfs {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn root(&'static self) -> Dirent {
        self.dirent_for(0, String::from("/"), 0)
    }

    fn stat(&'static self, path: &str) -> Result<Dirent, FsError> {
        let root = self.root();
        self.stat_from(&root, path)
    }

    fn stat_from(&self, from: &Dirent, path: &str) -> Result<Dirent, FsError> {
        let this: &'static Memfs = unsafe { &*(self as *const Memfs) };
        let mut current = from.clone();
        for component in path_components(path) {
            if !current.is_dir() {
                return Err(FsError::NotDir);
            }
            let child = {
                let inner = this.inner.lock();
                inner
                    .find_child(current.block as u32, component)
                    .ok_or(FsError::NotFound)?
            };
            current = this.dirent_for(child, String::from(component), current.block as u32);
        }
        Ok(current)
    }

    fn ls(&self, dirent: &Dirent) -> Result<Vec<Dirent>, FsError> {
        if !dirent.is_dir() {
            return Err(FsError::NotDir);
        }
        let this: &'static Memfs = unsafe { &*(self as *const Memfs) };
        let entries = {
            let inner = this.inner.lock();
            inner.dir_entries(dirent.block as u32)
        };
        Ok(entries
            .into_iter()
            .map(|(_, _, inode, name)| this.dirent_for(inode, name, dirent.block as u32))
            .collect())
    }

    fn read(&self, dirent: &Dirent, pos: u64, n: u64) -> Result<Vec<u8>, FsError> {
        if !dirent.is_file() {
            return Err(FsError::NotFile);
        }
        let inner = self.inner.lock();
        let inode = inner.inodes[dirent.block as usize];
        if pos >= inode.size as u64 {
            return Ok(Vec::new());
        }
        let end = (pos + n).min(inode.size as u64) as usize;
        let pos = pos as usize;

        let mut out = Vec::with_capacity(end - pos);
        for i in pos..end {
            let block = inode.blocks[i / MEMFS_BLOCK_SIZE];
            if block == 0 {
                break;
            }
            out.push(inner.block(block)[i % MEMFS_BLOCK_SIZE]);
        }
        Ok(out)
    }
}
