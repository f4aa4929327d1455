//! Android boot image v2 stager (component I): reads the kernel/ramdisk/dtb
//! regions out of `boot_a` and writes them to the files the bootloader
//! handoff expects.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{KbootError, Result};
use crate::io::chunked_write;
use crate::partition::PartitionService;

const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
const BOOT_NAME_SIZE: usize = 16;
const BOOT_ARGS_SIZE: usize = 512;
const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
const HEADER_LEN: usize = 1660;
const WRITE_CHUNK_MAX: usize = 4096;

struct BootHeaderV2 {
    kernel_size: u32,
    ramdisk_size: u32,
    second_size: u32,
    page_size: u32,
    cmdline: [u8; BOOT_ARGS_SIZE],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
    recovery_dtbo_size: u32,
    dtb_size: u32,
}

impl BootHeaderV2 {
    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let mut magic = [0u8; 8];
        c.read_exact(&mut magic)?;
        if &magic != BOOT_MAGIC {
            return Err(KbootError::Parse("bad Android boot image magic".into()));
        }

        let kernel_size = c.read_u32::<LittleEndian>()?;
        let _kernel_addr = c.read_u32::<LittleEndian>()?;
        let ramdisk_size = c.read_u32::<LittleEndian>()?;
        let _ramdisk_addr = c.read_u32::<LittleEndian>()?;
        let second_size = c.read_u32::<LittleEndian>()?;
        let _second_addr = c.read_u32::<LittleEndian>()?;
        let _tags_addr = c.read_u32::<LittleEndian>()?;
        let page_size = c.read_u32::<LittleEndian>()?;
        let _header_version = c.read_u32::<LittleEndian>()?;
        let _os_version = c.read_u32::<LittleEndian>()?;

        let mut name = [0u8; BOOT_NAME_SIZE];
        c.read_exact(&mut name)?;

        let mut cmdline = [0u8; BOOT_ARGS_SIZE];
        c.read_exact(&mut cmdline)?;

        let mut id = [0u8; 32];
        c.read_exact(&mut id)?;

        let mut extra_cmdline = [0u8; BOOT_EXTRA_ARGS_SIZE];
        c.read_exact(&mut extra_cmdline)?;

        let recovery_dtbo_size = c.read_u32::<LittleEndian>()?;
        let _recovery_dtbo_offset = c.read_u64::<LittleEndian>()?;
        let _header_size = c.read_u32::<LittleEndian>()?;
        let dtb_size = c.read_u32::<LittleEndian>()?;
        let _dtb_addr = c.read_u64::<LittleEndian>()?;

        Ok(BootHeaderV2 {
            kernel_size,
            ramdisk_size,
            second_size,
            page_size,
            cmdline,
            extra_cmdline,
            recovery_dtbo_size,
            dtb_size,
        })
    }
}

use std::io::Read as _;

fn cstr(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn round_up(size: u32, page_size: u32) -> u64 {
    if size == 0 {
        return 0;
    }
    (size as u64).div_ceil(page_size as u64) * page_size as u64
}

fn write_staged_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    chunked_write(&mut f, data, WRITE_CHUNK_MAX)
}

/// Stage the kernel, ramdisk, dtb and combined cmdline from `boot_a` into
/// `boot_dir` (normally `/boot`).
pub fn stage_boot_image(partitions: &PartitionService, boot_dir: &Path) -> Result<()> {
    let path = partitions.get_path("boot_a")?.to_path_buf();

    let mut hdr_buf = [0u8; HEADER_LEN];
    partitions.read(&path, 0, &mut hdr_buf)?;
    let hdr = BootHeaderV2::decode(&hdr_buf)?;

    let cmdline = format!("{} {}", cstr(&hdr.cmdline), cstr(&hdr.extra_cmdline));
    write_staged_file(&boot_dir.join("cmdline"), cmdline.as_bytes())?;

    let mut offset = hdr.page_size as u64;

    let mut kernel = vec![0u8; hdr.kernel_size as usize];
    partitions.read(&path, offset, &mut kernel)?;
    write_staged_file(&boot_dir.join("Image"), &kernel)?;
    offset += round_up(hdr.kernel_size, hdr.page_size);

    let mut ramdisk = vec![0u8; hdr.ramdisk_size as usize];
    partitions.read(&path, offset, &mut ramdisk)?;
    write_staged_file(&boot_dir.join("ramdisk.img"), &ramdisk)?;
    offset += round_up(hdr.ramdisk_size, hdr.page_size);

    offset += round_up(hdr.second_size, hdr.page_size);
    offset += round_up(hdr.recovery_dtbo_size, hdr.page_size);

    let mut dtb = vec![0u8; hdr.dtb_size as usize];
    partitions.read(&path, offset, &mut dtb)?;
    write_staged_file(&boot_dir.join("dtb.img"), &dtb)?;

    Ok(())
}
