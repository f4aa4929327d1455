//! Android sparse image decoder (component C).
//!
//! Streams a sparse-encoded download buffer into an open destination,
//! enforcing the partition-size guard on every chunk type that produces
//! output. The original source tracks the output offset only via the
//! `DONT_CARE` seek, leaving the guard for `RAW`/`FILL` effectively dead;
//! here `offset` is advanced after every chunk (spec.md open question #1).

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{KbootError, Result};
use crate::io::chunked_write;

pub const SPARSE_MAGIC: u32 = 0xed26ff3a;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

const SPARSE_HEADER_LEN: usize = 28;
const CHUNK_HEADER_LEN: usize = 12;
const WRITE_CHUNK_MAX: usize = 1 << 20;

struct SparseHeader {
    major_version: u16,
    minor_version: u16,
    file_hdr_sz: u16,
    chunk_hdr_sz: u16,
    blk_sz: u32,
    #[allow(dead_code)]
    total_blks: u32,
    total_chunks: u32,
    #[allow(dead_code)]
    image_checksum: u32,
}

impl SparseHeader {
    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let magic = c.read_u32::<LittleEndian>()?;
        if magic != SPARSE_MAGIC {
            return Err(KbootError::Parse(format!("bad sparse magic: {magic:#x}")));
        }
        let major_version = c.read_u16::<LittleEndian>()?;
        let minor_version = c.read_u16::<LittleEndian>()?;
        let file_hdr_sz = c.read_u16::<LittleEndian>()?;
        let chunk_hdr_sz = c.read_u16::<LittleEndian>()?;
        let blk_sz = c.read_u32::<LittleEndian>()?;
        let total_blks = c.read_u32::<LittleEndian>()?;
        let total_chunks = c.read_u32::<LittleEndian>()?;
        let image_checksum = c.read_u32::<LittleEndian>()?;
        Ok(SparseHeader {
            major_version,
            minor_version,
            file_hdr_sz,
            chunk_hdr_sz,
            blk_sz,
            total_blks,
            total_chunks,
            image_checksum,
        })
    }
}

/// Peek the magic and major version without consuming or validating the
/// rest of the buffer, to let the partition service pick raw vs. sparse.
pub fn is_sparse_image(data: &[u8]) -> bool {
    if data.len() < SPARSE_HEADER_LEN {
        return false;
    }
    let mut c = Cursor::new(data);
    let magic = match c.read_u32::<LittleEndian>() {
        Ok(m) => m,
        Err(_) => return false,
    };
    let major = c.read_u16::<LittleEndian>().unwrap_or(0);
    magic == SPARSE_MAGIC && major == 1
}

/// Decode `data` as an Android sparse image, writing the expanded contents
/// to `dst`. `part_size` bounds every chunk that produces output; exceeding
/// it is a `Boundary` error, never a silent truncation.
pub fn decode<W: Write + Seek>(data: &[u8], dst: &mut W, part_size: u64) -> Result<()> {
    let mut c = Cursor::new(data);
    let header = SparseHeader::decode(&mut c)?;
    if header.major_version != 1 {
        return Err(KbootError::Parse(format!(
            "unsupported sparse major version {}.{}",
            header.major_version, header.minor_version
        )));
    }

    if header.file_hdr_sz as usize > SPARSE_HEADER_LEN {
        c.set_position(c.position() + (header.file_hdr_sz as usize - SPARSE_HEADER_LEN) as u64);
    }

    let mut offset: u64 = 0;

    for _ in 0..header.total_chunks {
        let chunk_type = c.read_u16::<LittleEndian>()?;
        let _reserved = c.read_u16::<LittleEndian>()?;
        let chunk_sz = c.read_u32::<LittleEndian>()?;
        let total_sz = c.read_u32::<LittleEndian>()?;

        if header.chunk_hdr_sz as usize > CHUNK_HEADER_LEN {
            c.set_position(c.position() + (header.chunk_hdr_sz as usize - CHUNK_HEADER_LEN) as u64);
        }

        let chunk_data_sz = total_sz
            .checked_sub(header.chunk_hdr_sz as u32)
            .ok_or_else(|| KbootError::Parse("chunk total_sz smaller than chunk_hdr_sz".into()))?
            as u64;

        match chunk_type {
            CHUNK_TYPE_RAW => {
                if offset + chunk_data_sz > part_size {
                    return Err(KbootError::Boundary(format!(
                        "sparse RAW chunk would write past partition size {part_size}"
                    )));
                }
                let mut payload = vec![0u8; chunk_data_sz as usize];
                c.read_exact(&mut payload)?;
                chunked_write(dst, &payload, WRITE_CHUNK_MAX)?;
                offset += chunk_data_sz;
            }
            CHUNK_TYPE_FILL => {
                if chunk_data_sz != 4 {
                    return Err(KbootError::Parse(format!(
                        "FILL chunk payload must be 4 bytes, got {chunk_data_sz}"
                    )));
                }
                let pattern = c.read_u32::<LittleEndian>()?;
                let fill_size = chunk_sz as u64 * header.blk_sz as u64;
                if offset + fill_size > part_size {
                    return Err(KbootError::Boundary(format!(
                        "sparse FILL chunk would write past partition size {part_size}"
                    )));
                }
                let mut scratch = Vec::with_capacity(fill_size as usize);
                while (scratch.len() as u64) < fill_size {
                    scratch.extend_from_slice(&pattern.to_le_bytes());
                }
                scratch.truncate(fill_size as usize);
                chunked_write(dst, &scratch, WRITE_CHUNK_MAX)?;
                offset += fill_size;
            }
            CHUNK_TYPE_DONT_CARE => {
                let span = chunk_sz as u64 * header.blk_sz as u64;
                if offset + span > part_size {
                    return Err(KbootError::Boundary(format!(
                        "sparse DONT_CARE chunk would seek past partition size {part_size}"
                    )));
                }
                dst.seek(SeekFrom::Current(span as i64))?;
                offset += span;
            }
            CHUNK_TYPE_CRC32 => {
                let mut skip = [0u8; 4];
                c.read_exact(&mut skip)?;
                log::warn!("sparse CRC32 chunk present, checksum not verified");
            }
            other => {
                return Err(KbootError::Protocol {
                    what: "sparse chunk type",
                    value: format!("{other:#06x}"),
                });
            }
        }
    }

    Ok(())
}
