//! Boot policy and process entry point (component M): partition discovery,
//! the reboot-to-bootloader flag, the boot countdown, and the decision
//! between a direct kernel handoff and the interactive fastboot service.

use std::io::Write as _;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use kboot::dispatch::{Dispatcher, ExitAction};
use kboot::partition::PartitionService;
use kboot::usb::UsbGadget;
use kboot::{bootimage, sysutil};
use nix::sys::reboot::{RebootMode, reboot};
use nix::sys::select::{FdSet, select};
use nix::sys::time::TimeVal;

const MMC_DEVICE: &str = "/dev/mmcblk0";
const BOOT_DIR: &str = "/boot";
const BOOTLOADERS_ENTRY: &str = "bootloaders";
const REBOOT_TO_BOOTLOADER: u16 = 1 << 0;
const COUNTDOWN_SECS: i32 = 4;

/// Read-modify-write the reboot-to-bootloader bit: if set, clear it on disk
/// and report true, otherwise report false.
fn check_reboot_bootloader_flag(partitions: &PartitionService) -> bool {
    let attr = match partitions.read_attr(BOOTLOADERS_ENTRY) {
        Ok(a) => a,
        Err(e) => {
            log::warn!("cannot read attributes from {BOOTLOADERS_ENTRY}: {e}");
            return false;
        }
    };

    if attr & REBOOT_TO_BOOTLOADER == 0 {
        return false;
    }

    if let Err(e) = partitions.write_attr(BOOTLOADERS_ENTRY, attr & !REBOOT_TO_BOOTLOADER) {
        log::warn!("cannot write attributes to {BOOTLOADERS_ENTRY}: {e}");
    }
    true
}

/// Give the user up to `COUNTDOWN_SECS` one-second windows to press a key on
/// stdin; any byte available stops the countdown early.
fn prompt_stop_boot() -> bool {
    let stdin = unsafe { BorrowedFd::borrow_raw(0) };

    for remaining in (0..COUNTDOWN_SECS).rev() {
        print!("Press any key to stop boot ... {remaining}  \r");
        let _ = std::io::stdout().flush();

        let mut set = FdSet::new();
        set.insert(stdin);
        let mut timeout = TimeVal::new(1, 0);
        let ready = select(None, &mut set, None, None, &mut timeout).unwrap_or(0);
        if ready > 0 && set.contains(stdin) {
            return true;
        }
    }

    false
}

fn stop_boot(partitions: &PartitionService) -> bool {
    if check_reboot_bootloader_flag(partitions) {
        log::info!("reboot bootloader flag detected");
        return true;
    }
    prompt_stop_boot()
}

fn run() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("revision: {}", env!("CARGO_PKG_VERSION"));

    let partitions = Arc::new(PartitionService::init(Path::new(MMC_DEVICE))?);

    if !stop_boot(&partitions) {
        bootimage::stage_boot_image(&partitions, Path::new(BOOT_DIR))?;
        return Ok(());
    }

    sysutil::run_program_detached(&["console"])?;

    let gadget = UsbGadget::init()?;
    let mut dispatcher = Dispatcher::new(partitions, gadget);

    loop {
        if let Err(e) = dispatcher.step() {
            log::warn!("command failed: {e}");
        }
        match dispatcher.exit_action {
            ExitAction::None => continue,
            ExitAction::Continue => {
                log::info!("exit");
                return Ok(());
            }
            ExitAction::Reboot => {
                log::info!("rebooting");
                let _ = reboot(RebootMode::RB_AUTOBOOT);
                return Ok(());
            }
        }
    }
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}
