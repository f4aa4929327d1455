//! USB FunctionFS transport (component E): the descriptor/strings blob the
//! gadget driver expects on `ep0`, and bulk I/O on `ep1` (OUT)/`ep2` (IN).

use std::fs::{File, OpenOptions};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::io::{bounded_write, chunked_read};
use crate::sysutil;

const EP0_PATH: &str = "/dev/usb-ffs/fastboot/ep0";
const EP_OUT_PATH: &str = "/dev/usb-ffs/fastboot/ep1";
const EP_IN_PATH: &str = "/dev/usb-ffs/fastboot/ep2";
const UDC_PATH: &str = "/config/usb_gadget/g1/UDC";
const DEFAULT_UDC_NAME: &str = "11201000.usb";

const INTERFACE_NAME: &str = "kbootd";

/// Single bulk transfer cap for downloads, `FASTBOOT_READ_COUNT` in the
/// original source: 4096 * 15.
pub const READ_FULL_CHUNK_MAX: usize = 4096 * 15;

const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 0x3;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 0x2;
const FUNCTIONFS_HAS_FS_DESC: u32 = 1;
const FUNCTIONFS_HAS_HS_DESC: u32 = 2;
const FUNCTIONFS_HAS_SS_DESC: u32 = 4;

const USB_DT_INTERFACE: u8 = 0x04;
const USB_DT_ENDPOINT: u8 = 0x05;
const USB_DT_SS_ENDPOINT_COMP: u8 = 0x30;
const USB_CLASS_VENDOR_SPEC: u8 = 0xff;
const USB_ENDPOINT_XFER_BULK: u8 = 0x02;
const USB_DIR_OUT: u8 = 0x00;
const USB_DIR_IN: u8 = 0x80;
const EP_ADDRESS: u8 = 1;

const MAX_PACKET_SIZE_FS: u16 = 64;
const MAX_PACKET_SIZE_HS: u16 = 512;
const MAX_PACKET_SIZE_SS: u16 = 1024;
const SS_MAX_BURST: u8 = 15;

fn push_interface_descriptor(buf: &mut Vec<u8>) {
    buf.push(9); // bLength
    buf.push(USB_DT_INTERFACE);
    buf.push(0); // bInterfaceNumber
    buf.push(0); // bAlternateSetting
    buf.push(2); // bNumEndpoints
    buf.push(USB_CLASS_VENDOR_SPEC);
    buf.push(66); // bInterfaceSubClass
    buf.push(3); // bInterfaceProtocol
    buf.push(1); // iInterface: first string in the table
}

fn push_endpoint_descriptor(buf: &mut Vec<u8>, direction: u8, max_packet_size: u16) {
    buf.push(7); // bLength
    buf.push(USB_DT_ENDPOINT);
    buf.push(EP_ADDRESS | direction);
    buf.push(USB_ENDPOINT_XFER_BULK);
    buf.write_u16::<LittleEndian>(max_packet_size).unwrap();
    buf.push(0); // bInterval
}

fn push_ss_companion_descriptor(buf: &mut Vec<u8>) {
    buf.push(6); // bLength
    buf.push(USB_DT_SS_ENDPOINT_COMP);
    buf.push(SS_MAX_BURST);
    buf.push(0); // bmAttributes
    buf.write_u16::<LittleEndian>(0).unwrap(); // wBytesPerInterval
}

fn push_func_desc(buf: &mut Vec<u8>, max_packet_size: u16) {
    push_interface_descriptor(buf);
    push_endpoint_descriptor(buf, USB_DIR_OUT, max_packet_size);
    push_endpoint_descriptor(buf, USB_DIR_IN, max_packet_size);
}

fn push_ss_func_desc(buf: &mut Vec<u8>) {
    push_interface_descriptor(buf);
    push_endpoint_descriptor(buf, USB_DIR_OUT, MAX_PACKET_SIZE_SS);
    push_ss_companion_descriptor(buf);
    push_endpoint_descriptor(buf, USB_DIR_IN, MAX_PACKET_SIZE_SS);
    push_ss_companion_descriptor(buf);
}

/// Build the FunctionFS v2 descriptor blob: one vendor-specific interface
/// with two bulk endpoints, at full/high/super speed.
pub fn descriptor_blob() -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(3).unwrap(); // fs_count
    body.write_u32::<LittleEndian>(3).unwrap(); // hs_count
    body.write_u32::<LittleEndian>(5).unwrap(); // ss_count
    push_func_desc(&mut body, MAX_PACKET_SIZE_FS);
    push_func_desc(&mut body, MAX_PACKET_SIZE_HS);
    push_ss_func_desc(&mut body);

    let total_len = 12 + body.len();
    let mut out = Vec::with_capacity(total_len);
    out.write_u32::<LittleEndian>(FUNCTIONFS_DESCRIPTORS_MAGIC_V2)
        .unwrap();
    out.write_u32::<LittleEndian>(total_len as u32).unwrap();
    out.write_u32::<LittleEndian>(
        FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC | FUNCTIONFS_HAS_SS_DESC,
    )
    .unwrap();
    out.extend_from_slice(&body);
    out
}

/// Build the FunctionFS strings blob: one en-us string naming the
/// interface.
pub fn strings_blob() -> Vec<u8> {
    let name = INTERFACE_NAME.as_bytes();
    let lang0_len = 2 + name.len() + 1; // language code + NUL-terminated string
    let total_len = 10 + lang0_len;

    let mut out = Vec::with_capacity(total_len);
    out.write_u32::<LittleEndian>(FUNCTIONFS_STRINGS_MAGIC)
        .unwrap();
    out.write_u32::<LittleEndian>(total_len as u32).unwrap();
    out.write_u32::<LittleEndian>(1).unwrap(); // str_count
    out.write_u32::<LittleEndian>(1).unwrap(); // lang_count
    out.write_u16::<LittleEndian>(0x0409).unwrap(); // en-us
    out.extend_from_slice(name);
    out.push(0);
    out
}

pub struct UsbGadget {
    ep_in: File,
    ep_out: File,
}

impl UsbGadget {
    /// Run `setup_fastboot`, open `ep0`, write the descriptor and strings
    /// blobs, bind the UDC, then open the bulk endpoints.
    pub fn init() -> Result<Self> {
        sysutil::run_program(&["setup_fastboot"])?;

        let mut ep0 = OpenOptions::new().read(true).write(true).open(EP0_PATH)?;
        bounded_write(&mut ep0, &descriptor_blob())?;
        bounded_write(&mut ep0, &strings_blob())?;

        sysutil::write_to_file(Path::new(UDC_PATH), DEFAULT_UDC_NAME)?;

        let ep_in = OpenOptions::new().write(true).open(EP_IN_PATH)?;
        let ep_out = OpenOptions::new().read(true).open(EP_OUT_PATH)?;

        Ok(UsbGadget { ep_in, ep_out })
    }

    /// One bulk IN transfer; fails on any short write.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        bounded_write(&mut self.ep_in, buf)
    }

    /// One bulk OUT transfer; returns the number of bytes actually read,
    /// which may be less than `buf.len()` (used for fixed-size command
    /// frame reads, where the host's frame is usually shorter).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        Ok(self.ep_out.read(buf)?)
    }

    /// Chunked bulk OUT read, failing on any short chunk. Used for download
    /// payloads, which must arrive in full.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        chunked_read(&mut self.ep_out, buf, READ_FULL_CHUNK_MAX)
    }
}

#[cfg(test)]
impl UsbGadget {
    /// Build a `UsbGadget` over plain files, standing in for the bulk
    /// endpoints so command dispatch can be tested without a FunctionFS
    /// mount.
    pub(crate) fn from_files(ep_in: File, ep_out: File) -> Self {
        UsbGadget { ep_in, ep_out }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_blob_has_v2_magic_and_matching_length() {
        let blob = descriptor_blob();
        let magic = u32::from_le_bytes(blob[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(magic, FUNCTIONFS_DESCRIPTORS_MAGIC_V2);
        assert_eq!(length as usize, blob.len());

        let flags = u32::from_le_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(
            flags,
            FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC | FUNCTIONFS_HAS_SS_DESC
        );
    }

    #[test]
    fn descriptor_blob_carries_full_high_super_speed_max_packet_sizes() {
        let blob = descriptor_blob();
        // header (12 bytes) + fs/hs/ss counts (12 bytes) + fs interface (9 bytes)
        // lands at the fs source endpoint's wMaxPacketSize field (offset 4 into it).
        let fs_source_wmaxpacketsize = &blob[12 + 12 + 9 + 4..12 + 12 + 9 + 6];
        assert_eq!(
            u16::from_le_bytes(fs_source_wmaxpacketsize.try_into().unwrap()),
            64
        );
    }

    #[test]
    fn strings_blob_has_magic_and_interface_name() {
        let blob = strings_blob();
        let magic = u32::from_le_bytes(blob[0..4].try_into().unwrap());
        assert_eq!(magic, FUNCTIONFS_STRINGS_MAGIC);
        assert!(
            blob.windows(INTERFACE_NAME.len())
                .any(|w| w == INTERFACE_NAME.as_bytes())
        );
        assert_eq!(*blob.last().unwrap(), 0);
    }
}
