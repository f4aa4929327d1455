//! GPT layer (component B): MBR/header/entry decoding, and the precise
//! byte-offset attribute read-modify-write described in spec section 4.B.
//!
//! Binary layouts are decoded field-by-field with explicit little-endian
//! reads rather than struct overlays, so the representation here is exactly
//! the wire format regardless of host endianness or alignment.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{KbootError, Result};
use crate::io::{bounded_read, bounded_write, chunked_read};

pub const LBA_SIZE: u64 = 512;
pub const GPT_MAGIC: u64 = 0x5452_4150_2049_4645;
const GUID_LEN: usize = 16;
const PART_NAME_LEN: usize = 72;
const GPT_ENTRY_LEN: usize = 128;
const ENTRY_CHUNK_MAX: usize = 4096;

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; GUID_LEN],
    pub first_part_lba: u64,
    pub n_parts: u32,
    pub part_entry_len: u32,
    pub part_array_crc32: u32,
}

impl GptHeader {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let magic = c.read_u64::<LittleEndian>()?;
        if magic != GPT_MAGIC {
            return Err(KbootError::Parse(format!("bad GPT magic: {magic:#x}")));
        }
        let revision = c.read_u32::<LittleEndian>()?;
        let header_size = c.read_u32::<LittleEndian>()?;
        let header_crc32 = c.read_u32::<LittleEndian>()?;
        let _reserved = c.read_u32::<LittleEndian>()?;
        let current_lba = c.read_u64::<LittleEndian>()?;
        let backup_lba = c.read_u64::<LittleEndian>()?;
        let first_usable_lba = c.read_u64::<LittleEndian>()?;
        let last_usable_lba = c.read_u64::<LittleEndian>()?;
        let mut disk_guid = [0u8; GUID_LEN];
        c.read_exact(&mut disk_guid)?;
        let first_part_lba = c.read_u64::<LittleEndian>()?;
        let n_parts = c.read_u32::<LittleEndian>()?;
        let part_entry_len = c.read_u32::<LittleEndian>()?;
        let part_array_crc32 = c.read_u32::<LittleEndian>()?;
        // CRC32 of header and partition array is deliberately not validated
        // (spec.md open question #3): corrupted tables are undefined input.
        Ok(GptHeader {
            revision,
            header_size,
            header_crc32,
            current_lba,
            backup_lba,
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            first_part_lba,
            n_parts,
            part_entry_len,
            part_array_crc32,
        })
    }
}

/// The 64-bit GPT entry attribute word. The high 16 bits are the
/// `type_guid_specific` field this daemon uses for the reboot-to-bootloader
/// flag; the rest is preserved verbatim across a read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntryAttributes(pub u64);

impl GptEntryAttributes {
    pub fn type_guid_specific(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn with_type_guid_specific(self, value: u16) -> Self {
        let low_bits = self.0 & 0x0000_ffff_ffff_ffff;
        GptEntryAttributes(low_bits | ((value as u64) << 48))
    }
}

#[derive(Debug, Clone)]
pub struct GptEntry {
    pub partition_type_guid: [u8; GUID_LEN],
    pub unique_partition_guid: [u8; GUID_LEN],
    pub lba_start: u64,
    pub lba_end: u64,
    pub attributes: GptEntryAttributes,
    pub name_utf16le: [u8; PART_NAME_LEN],
}

impl GptEntry {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let mut partition_type_guid = [0u8; GUID_LEN];
        c.read_exact(&mut partition_type_guid)?;
        let mut unique_partition_guid = [0u8; GUID_LEN];
        c.read_exact(&mut unique_partition_guid)?;
        let lba_start = c.read_u64::<LittleEndian>()?;
        let lba_end = c.read_u64::<LittleEndian>()?;
        let attributes = GptEntryAttributes(c.read_u64::<LittleEndian>()?);
        let mut name_utf16le = [0u8; PART_NAME_LEN];
        c.read_exact(&mut name_utf16le)?;
        Ok(GptEntry {
            partition_type_guid,
            unique_partition_guid,
            lba_start,
            lba_end,
            attributes,
            name_utf16le,
        })
    }

    fn encode(&self) -> [u8; GPT_ENTRY_LEN] {
        let mut out = [0u8; GPT_ENTRY_LEN];
        let mut c = Cursor::new(&mut out[..]);
        c.write_all(&self.partition_type_guid).unwrap();
        c.write_all(&self.unique_partition_guid).unwrap();
        c.write_u64::<LittleEndian>(self.lba_start).unwrap();
        c.write_u64::<LittleEndian>(self.lba_end).unwrap();
        c.write_u64::<LittleEndian>(self.attributes.0).unwrap();
        c.write_all(&self.name_utf16le).unwrap();
        out
    }

    /// Decode the UTF-16LE name: every even byte up to the first NUL or 36
    /// code units, substituting `?` for anything outside printable ASCII.
    /// spec.md documents two slightly different policies used by the
    /// original source (raw passthrough vs. `?`-substitution); this
    /// implementation unifies on the stricter, substituting one everywhere.
    pub fn name(&self) -> String {
        let mut out = String::new();
        for chunk in self.name_utf16le.chunks_exact(2).take(36) {
            if chunk[0] == 0 && chunk[1] == 0 {
                break;
            }
            let ch = chunk[0];
            if (0x20..0x7f).contains(&ch) {
                out.push(ch as char);
            } else {
                out.push('?');
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Gpt {
    pub header: GptHeader,
    pub entries: Vec<GptEntry>,
}

fn check_mbr(mbr: &[u8; LBA_SIZE as usize]) -> Result<()> {
    if mbr[510] == 0x55 && mbr[511] == 0xaa {
        Ok(())
    } else {
        Err(KbootError::Parse("invalid protective MBR signature".into()))
    }
}

impl Gpt {
    /// Parse the MBR, GPT header and entry array from an open block device.
    pub fn read_from(dev: &mut File) -> Result<Self> {
        let mut mbr = [0u8; LBA_SIZE as usize];
        dev.seek(SeekFrom::Start(0))?;
        bounded_read(dev, &mut mbr)?;
        check_mbr(&mbr)?;

        let mut hdr_buf = [0u8; LBA_SIZE as usize];
        dev.seek(SeekFrom::Start(LBA_SIZE))?;
        bounded_read(dev, &mut hdr_buf)?;
        let header = GptHeader::decode(&hdr_buf)?;

        let entries_size = header.n_parts as usize * header.part_entry_len as usize;
        let mut raw = vec![0u8; entries_size];
        dev.seek(SeekFrom::Start(header.first_part_lba * LBA_SIZE))?;
        chunked_read(dev, &mut raw, ENTRY_CHUNK_MAX)?;

        let stride = header.part_entry_len as usize;
        let mut entries = Vec::with_capacity(header.n_parts as usize);
        for i in 0..header.n_parts as usize {
            let start = i * stride;
            let record = &raw[start..start + stride.max(GPT_ENTRY_LEN)];
            entries.push(GptEntry::decode(&record[..GPT_ENTRY_LEN])?);
        }

        Ok(Gpt { header, entries })
    }
}

/// Re-scans the entry array directly off `device_path` looking for `name`,
/// stopping at the first match, and returns its on-disk byte offset.
///
/// The original source computes this offset as `(index + 2) * LBA_SIZE`,
/// which only holds when `part_entry_len == 128` and entries are laid out
/// one per LBA; anything else corrupts neighboring entries on write. Per
/// spec.md's resolution of that open question, the offset here is instead
/// recomputed from `first_part_lba` and `part_entry_len`.
fn find_entry(device_path: &Path, name: &str) -> Result<(GptEntry, u64)> {
    let mut dev = File::open(device_path)?;
    dev.seek(SeekFrom::Start(LBA_SIZE))?;
    let mut hdr_buf = [0u8; LBA_SIZE as usize];
    bounded_read(&mut dev, &mut hdr_buf)?;
    let header = GptHeader::decode(&hdr_buf)?;

    let stride = header.part_entry_len as u64;
    for i in 0..header.n_parts as u64 {
        let offset = header.first_part_lba * LBA_SIZE + i * stride;
        dev.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; GPT_ENTRY_LEN];
        bounded_read(&mut dev, &mut buf)?;
        let entry = GptEntry::decode(&buf)?;
        if entry.name() == name {
            return Ok((entry, offset));
        }
    }

    Err(KbootError::Lookup(name.to_string()))
}

/// Read the `type_guid_specific` attribute bits of the named GPT entry.
pub fn read_attr(device_path: &Path, name: &str) -> Result<u16> {
    let (entry, _) = find_entry(device_path, name)?;
    Ok(entry.attributes.type_guid_specific())
}

/// Read-modify-write the `type_guid_specific` attribute bits of the named
/// GPT entry, preserving every other byte of the entry record.
pub fn write_attr(device_path: &Path, name: &str, value: u16) -> Result<()> {
    let (mut entry, offset) = find_entry(device_path, name)?;
    entry.attributes = entry.attributes.with_type_guid_specific(value);

    let mut dev = OpenOptions::new().write(true).open(device_path)?;
    dev.seek(SeekFrom::Start(offset))?;
    bounded_write(&mut dev, &entry.encode())?;
    Ok(())
}
