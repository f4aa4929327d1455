//! Fastboot command framing (component F): the ASCII command/response
//! protocol carried over the bulk endpoints.

use crate::error::Result;
use crate::usb::UsbGadget;

/// Fixed frame size both directions, matching the gadget side's read/write
/// buffers.
pub const FRAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbStatus {
    Okay,
    Fail,
    Info,
    Data,
}

impl FbStatus {
    fn prefix(self) -> &'static str {
        match self {
            FbStatus::Okay => "OKAY",
            FbStatus::Fail => "FAIL",
            FbStatus::Info => "INFO",
            FbStatus::Data => "DATA",
        }
    }
}

/// Split a raw command line into its verb and the remainder, the way
/// `strtok_r(buffer, ":", &args)` does: no colon means an empty tail.
pub fn parse_command(raw: &str) -> (&str, &str) {
    match raw.split_once(':') {
        Some((verb, rest)) => (verb, rest),
        None => (raw, ""),
    }
}

fn build_frame(status: FbStatus, payload: &str) -> String {
    let mut frame = format!("{}{}", status.prefix(), payload);
    frame.truncate(FRAME_LEN);
    frame
}

pub fn respond(gadget: &mut UsbGadget, status: FbStatus, payload: &str) -> Result<()> {
    gadget.write(build_frame(status, payload).as_bytes())
}

pub fn info(gadget: &mut UsbGadget, payload: &str) -> Result<()> {
    respond(gadget, FbStatus::Info, payload)
}

/// Read one command frame off the bulk OUT endpoint and decode it as UTF-8,
/// dropping anything that isn't valid text (the host never sends binary
/// command frames).
pub fn read_command(gadget: &mut UsbGadget) -> Result<String> {
    let mut buf = [0u8; FRAME_LEN];
    let n = gadget.read(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_splits_on_first_colon() {
        assert_eq!(parse_command("getvar:version"), ("getvar", "version"));
        assert_eq!(parse_command("flash:boot_a"), ("flash", "boot_a"));
        assert_eq!(parse_command("continue"), ("continue", ""));
    }

    #[test]
    fn build_frame_prefixes_status_and_truncates() {
        assert_eq!(build_frame(FbStatus::Okay, ""), "OKAY");
        assert_eq!(
            build_frame(FbStatus::Fail, "bad partition"),
            "FAILbad partition"
        );
        assert_eq!(build_frame(FbStatus::Data, "00001000"), "DATA00001000");

        let long_payload = "x".repeat(FRAME_LEN);
        assert_eq!(build_frame(FbStatus::Info, &long_payload).len(), FRAME_LEN);
    }
}
