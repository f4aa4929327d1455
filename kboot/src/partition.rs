//! Partition service (component D): a typed wrapper over the GPT and sparse
//! layers, the partition name map, and the erase fallback chain.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{KbootError, Result};
use crate::gpt::{self, Gpt};
use crate::io::{chunked_read, chunked_write};
use crate::sparse;
use crate::sysutil;

const READ_CHUNK_MAX: usize = 4096;
const WRITE_CHUNK_MAX: usize = 1 << 20;
const RAW_ERASE_LEN: u64 = 4096;

nix::ioctl_read_bad!(ioctl_blkgetsize64, 0x8008_1272, u64);
nix::ioctl_write_ptr_bad!(ioctl_blkdiscard, 0x1277, [u64; 2]);
nix::ioctl_write_ptr_bad!(ioctl_blksecdiscard, 0x127d, [u64; 2]);

/// The "mmc0" alias: the raw eMMC block device itself, with no GPT entry.
const MMC0_ALIAS: &str = "mmc0";

pub struct PartitionService {
    device_path: PathBuf,
    map: HashMap<String, PathBuf>,
}

fn sibling_path(device_path: &Path, suffix: &str) -> PathBuf {
    let mut s = device_path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl PartitionService {
    /// Parse the GPT on `device_path`, build the partition map (mmc0/
    /// mmc0boot0/mmc0boot1 aliases plus one entry per non-empty GPT
    /// record), and enable write access to the boot partitions.
    pub fn init(device_path: &Path) -> Result<Self> {
        if !sysutil::file_exists(device_path) {
            sysutil::wait_file_created(device_path)?;
        }

        let mut dev = File::open(device_path)?;
        let gpt = Gpt::read_from(&mut dev)?;

        let mut map = HashMap::new();
        map.insert(MMC0_ALIAS.to_string(), device_path.to_path_buf());
        map.insert("mmc0boot0".to_string(), sibling_path(device_path, "boot0"));
        map.insert("mmc0boot1".to_string(), sibling_path(device_path, "boot1"));

        for (i, entry) in gpt.entries.iter().enumerate() {
            if entry.lba_start == 0 {
                continue;
            }
            let path = sibling_path(device_path, &format!("p{}", i + 1));
            map.insert(entry.name(), path);
        }

        let base_name = device_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        for suffix in ["boot0", "boot1"] {
            let force_ro = PathBuf::from(format!("/sys/block/{base_name}{suffix}/force_ro"));
            if let Err(e) = sysutil::write_to_file(&force_ro, "0") {
                log::warn!("cannot enable write access on {force_ro:?}: {e}");
            }
        }

        Ok(PartitionService {
            device_path: device_path.to_path_buf(),
            map,
        })
    }

    pub fn get_path(&self, name: &str) -> Result<&Path> {
        self.map
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| KbootError::Lookup(name.to_string()))
    }

    pub fn get_size(&self, path: &Path) -> Result<u64> {
        let f = File::open(path)?;
        let mut size: u64 = 0;
        unsafe { ioctl_blkgetsize64(f.as_raw_fd(), &mut size) }?;
        Ok(size)
    }

    pub fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        chunked_read(&mut f, buf, READ_CHUNK_MAX)
    }

    /// Flash `data` to `path`. Sparse images are expanded against the full
    /// partition size; otherwise `data` is written at `*offset`, which is
    /// then advanced by `data.len()` (the streaming append invariant from
    /// component H).
    pub fn flash(&self, path: &Path, data: &[u8], offset: &mut u64) -> Result<()> {
        let mut f = OpenOptions::new().write(true).open(path)?;
        if sparse::is_sparse_image(data) {
            let part_size = self.get_size(path)?;
            sparse::decode(data, &mut f, part_size)
        } else {
            f.seek(SeekFrom::Start(*offset))?;
            chunked_write(&mut f, data, WRITE_CHUNK_MAX)?;
            *offset += data.len() as u64;
            Ok(())
        }
    }

    /// Erase `name`'s backing storage: `BLKSECDISCARD`, falling back to
    /// `BLKDISCARD`, finally zero-filling the first 4 KiB and `fsync`ing.
    /// `mmc0` erases are capped at 4 KiB (enough to wipe MBR+GPT header);
    /// everything else erases its full `BLKGETSIZE64` length.
    pub fn erase(&self, name: &str) -> Result<()> {
        let path = self.get_path(name)?.to_path_buf();
        let len = if name == MMC0_ALIAS {
            RAW_ERASE_LEN
        } else {
            self.get_size(&path)?
        };

        let f = OpenOptions::new().write(true).open(&path)?;
        let range = [0u64, len];

        if unsafe { ioctl_blksecdiscard(f.as_raw_fd(), &range) }.is_ok() {
            return Ok(());
        }
        if unsafe { ioctl_blkdiscard(f.as_raw_fd(), &range) }.is_ok() {
            return Ok(());
        }

        let zeros = [0u8; 4096];
        let mut f = f;
        chunked_write(&mut f, &zeros, WRITE_CHUNK_MAX)?;
        f.sync_all()?;
        Ok(())
    }

    pub fn read_attr(&self, name: &str) -> Result<u16> {
        gpt::read_attr(&self.device_path, name)
    }

    pub fn write_attr(&self, name: &str, value: u16) -> Result<()> {
        gpt::write_attr(&self.device_path, name, value)
    }
}
