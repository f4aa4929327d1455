//! Command dispatch (component G): the fastboot verb and getvar tables, and
//! the state tying protocol framing, the flash pipeline and the partition
//! service together into one command loop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bootimage;
use crate::error::Result;
use crate::partition::PartitionService;
use crate::pipeline::{FlashJob, FlashQueue};
use crate::protocol::{self, FbStatus};
use crate::sysutil;
use crate::usb::UsbGadget;

const MAX_DOWNLOAD_SIZE: u64 = 256 * 1024 * 1024;
const BOOT_DIR: &str = "/boot";

/// What the caller should do once `step` has sent its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    None,
    Continue,
    Reboot,
}

pub struct Dispatcher {
    partitions: Arc<PartitionService>,
    gadget: UsbGadget,
    downloads: VecDeque<Vec<u8>>,
    flash_queue: Arc<FlashQueue>,
    pub exit_action: ExitAction,
}

impl Dispatcher {
    pub fn new(partitions: Arc<PartitionService>, gadget: UsbGadget) -> Self {
        Dispatcher {
            partitions,
            gadget,
            downloads: VecDeque::new(),
            flash_queue: FlashQueue::new(),
            exit_action: ExitAction::None,
        }
    }

    /// Read one command frame, dispatch it, and send its response.
    pub fn step(&mut self) -> Result<()> {
        let raw = protocol::read_command(&mut self.gadget)?;
        let raw = raw.trim_end_matches('\0');
        log::info!("{raw}");
        let (verb, args) = protocol::parse_command(raw);

        let (status, rsp) = match verb {
            "continue" => self.cmd_continue(),
            "download" => self.cmd_download(args),
            "erase" => self.cmd_erase(args),
            "flash" => self.cmd_flash(args),
            "getvar" => self.cmd_getvar(args),
            "reboot" => self.cmd_reboot(),
            other => {
                log::warn!("{other} command not supported");
                (FbStatus::Fail, String::new())
            }
        };

        protocol::respond(&mut self.gadget, status, &rsp)
    }

    fn cmd_download(&mut self, args: &str) -> (FbStatus, String) {
        let size = match usize::from_str_radix(args.trim(), 16) {
            Ok(n) => n,
            Err(_) => return (FbStatus::Fail, String::new()),
        };

        if protocol::respond(&mut self.gadget, FbStatus::Data, &format!("{size:08x}")).is_err() {
            return (FbStatus::Fail, String::new());
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            log::warn!("allocation of {size} bytes for download failed");
            return (FbStatus::Fail, String::new());
        }
        buf.resize(size, 0);

        if let Err(e) = self.gadget.read_full(&mut buf) {
            log::warn!("download read failed: {e}");
            return (FbStatus::Fail, String::new());
        }

        self.downloads.push_back(buf);
        (FbStatus::Okay, String::new())
    }

    fn cmd_getvar(&self, args: &str) -> (FbStatus, String) {
        let (name, rest) = protocol::parse_command(args);
        match name {
            "current-slot" => (FbStatus::Okay, "a".into()),
            "has-slot" => {
                let base = format!("{rest}_a");
                let yes = self.partitions.get_path(&base).is_ok();
                (FbStatus::Okay, if yes { "yes".into() } else { "no".into() })
            }
            "is-logical" => (FbStatus::Okay, "no".into()),
            "max-download-size" => {
                let mem = sysutil::mem_avail() / 3 * 2;
                (FbStatus::Okay, mem.min(MAX_DOWNLOAD_SIZE).to_string())
            }
            other => {
                log::warn!("getvar: {other} not supported");
                (FbStatus::Fail, String::new())
            }
        }
    }

    fn cmd_erase(&self, args: &str) -> (FbStatus, String) {
        match self.partitions.erase(args) {
            Ok(()) => (FbStatus::Okay, String::new()),
            Err(e) => {
                log::warn!("erase {args} failed: {e}");
                (FbStatus::Fail, String::new())
            }
        }
    }

    fn cmd_flash(&mut self, args: &str) -> (FbStatus, String) {
        let data = match self.downloads.pop_front() {
            Some(data) => data,
            None => {
                log::warn!("no data downloaded");
                return (FbStatus::Fail, String::new());
            }
        };

        let path: PathBuf = match self.partitions.get_path(args) {
            Ok(p) => p.to_path_buf(),
            Err(_) => {
                log::warn!("cannot find partition: {args}");
                return (FbStatus::Fail, String::new());
            }
        };

        self.flash_queue
            .push(FlashJob { path, data }, Arc::clone(&self.partitions));
        (FbStatus::Okay, String::new())
    }

    fn wait_pending_flash(&mut self) {
        if self.flash_queue.is_running() {
            let _ = protocol::info(&mut self.gadget, "Waiting ongoing flash ...");
            self.flash_queue.wait_done();
        }
    }

    fn cmd_continue(&mut self) -> (FbStatus, String) {
        self.wait_pending_flash();

        if let Err(e) = bootimage::stage_boot_image(&self.partitions, Path::new(BOOT_DIR)) {
            log::warn!("stage boot image failed: {e}");
            return (FbStatus::Fail, String::new());
        }

        self.exit_action = ExitAction::Continue;
        (FbStatus::Okay, String::new())
    }

    fn cmd_reboot(&mut self) -> (FbStatus, String) {
        self.wait_pending_flash();
        self.exit_action = ExitAction::Reboot;
        (FbStatus::Okay, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt;
    use crate::protocol::FRAME_LEN;
    use std::fs::{File, OpenOptions};

    fn service(disk: &Path) -> Arc<PartitionService> {
        gpt::tests::write_minimal_disk(disk, &[(0x800, "boot_a")]);
        std::fs::write(format!("{}p1", disk.display()), vec![0u8; 4096]).unwrap();
        Arc::new(PartitionService::init(disk).unwrap())
    }

    fn padded_frame(s: &str) -> Vec<u8> {
        let mut frame = s.as_bytes().to_vec();
        frame.resize(FRAME_LEN, 0);
        frame
    }

    /// Build a Dispatcher whose `UsbGadget` reads from `commands` (each
    /// entry is one 256-byte command frame, with any trailing payload bytes
    /// appended raw right after it) and writes responses into a scratch
    /// file the test reads back afterwards.
    fn dispatcher(
        dir: &Path,
        svc: Arc<PartitionService>,
        ep_out_bytes: &[u8],
    ) -> (Dispatcher, std::path::PathBuf) {
        let ep_out_path = dir.join("ep_out");
        std::fs::write(&ep_out_path, ep_out_bytes).unwrap();
        let ep_out = File::open(&ep_out_path).unwrap();

        let ep_in_path = dir.join("ep_in");
        File::create(&ep_in_path).unwrap();
        let ep_in = OpenOptions::new().write(true).open(&ep_in_path).unwrap();

        let gadget = UsbGadget::from_files(ep_in, ep_out);
        (Dispatcher::new(svc, gadget), ep_in_path)
    }

    #[test]
    fn getvar_commands_report_expected_values() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("mmcblk0");
        let svc = service(&disk);

        let mut ep_out = padded_frame("getvar:current-slot");
        ep_out.extend(padded_frame("getvar:has-slot:boot"));
        ep_out.extend(padded_frame("getvar:has-slot:missing"));
        ep_out.extend(padded_frame("getvar:is-logical:boot_a"));

        let (mut d, ep_in_path) = dispatcher(dir.path(), svc, &ep_out);
        for _ in 0..4 {
            d.step().unwrap();
        }

        let responses = std::fs::read(&ep_in_path).unwrap();
        assert_eq!(responses, b"OKAYaOKAYyesOKAYnoOKAYno");
    }

    #[test]
    fn download_then_flash_enqueues_a_flash_job() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("mmcblk0");
        let svc = service(&disk);

        let payload = b"boot!";
        let mut ep_out = padded_frame(&format!("download:{:08x}", payload.len()));
        ep_out.extend_from_slice(payload);
        ep_out.extend(padded_frame("flash:boot_a"));

        let (mut d, ep_in_path) = dispatcher(dir.path(), svc.clone(), &ep_out);
        d.step().unwrap(); // download
        d.step().unwrap(); // flash

        let responses = std::fs::read(&ep_in_path).unwrap();
        assert_eq!(responses, b"DATA00000005OKAYOKAY");

        d.flash_queue.wait_done();
        let boot_a = svc.get_path("boot_a").unwrap();
        let mut buf = [0u8; 5];
        svc.read(boot_a, 0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
    }

    #[test]
    fn flash_without_a_prior_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("mmcblk0");
        let svc = service(&disk);

        let ep_out = padded_frame("flash:boot_a");
        let (mut d, ep_in_path) = dispatcher(dir.path(), svc, &ep_out);
        d.step().unwrap();

        assert_eq!(std::fs::read(&ep_in_path).unwrap(), b"FAIL");
    }

    #[test]
    fn unknown_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("mmcblk0");
        let svc = service(&disk);

        let ep_out = padded_frame("frobnicate:x");
        let (mut d, ep_in_path) = dispatcher(dir.path(), svc, &ep_out);
        d.step().unwrap();

        assert_eq!(std::fs::read(&ep_in_path).unwrap(), b"FAIL");
    }
}
