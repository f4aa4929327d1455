//! System utilities (component L): shelling out to helper programs, sysfs
//! writes, device-node readiness polling, and free-memory queries.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::sysinfo::sysinfo;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, execvp, fork, setsid};

use crate::error::{KbootError, Result};
use crate::io::bounded_write;

/// Run `argv[0]` with `argv` as its full argument vector. `detach` makes the
/// child a session leader (used for the long-lived console helper) instead
/// of being waited on synchronously (used for `setup_fastboot`).
pub fn run_program(argv: &[&str]) -> Result<()> {
    run_program_impl(argv, false)
}

pub fn run_program_detached(argv: &[&str]) -> Result<()> {
    run_program_impl(argv, true)
}

fn run_program_impl(argv: &[&str], detach: bool) -> Result<()> {
    let cargs: Vec<CString> = argv.iter().map(|a| CString::new(*a).unwrap()).collect();

    match unsafe { fork() }? {
        ForkResult::Child => {
            if detach {
                let _ = setsid();
            }
            let _ = execvp(&cargs[0], &cargs);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            if !detach {
                waitpid(child, None)?;
            }
            Ok(())
        }
    }
}

/// Write `contents` to an already-existing file, typically a sysfs knob.
pub fn write_to_file(path: &Path, contents: &str) -> Result<()> {
    let mut f = OpenOptions::new().write(true).open(path)?;
    bounded_write(&mut f, contents.as_bytes())?;
    f.flush()?;
    Ok(())
}

pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Block until `path` is created, by watching its parent directory for an
/// `IN_CREATE` event naming `path`'s file name.
pub fn wait_file_created(path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KbootError::Resource(format!("{path:?} has no parent directory")))?;
    let name = path
        .file_name()
        .ok_or_else(|| KbootError::Resource(format!("{path:?} has no file name")))?;

    let inotify = Inotify::init(InitFlags::empty())?;
    inotify.add_watch(dir, AddWatchFlags::IN_CREATE)?;

    loop {
        for event in inotify.read_events()? {
            if event.mask.contains(AddWatchFlags::IN_CREATE)
                && let Some(event_name) = &event.name
                && event_name.as_os_str() == name
            {
                return Ok(());
            }
        }
    }
}

/// Bytes of completely unused RAM, or 0 if `sysinfo(2)` fails.
pub fn mem_avail() -> u64 {
    sysinfo().map(|info| info.ram_unused()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knob");
        std::fs::write(&path, "1").unwrap();
        write_to_file(&path, "0").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn file_exists_reflects_filesystem_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node");
        assert!(!file_exists(&path));
        std::fs::write(&path, "").unwrap();
        assert!(file_exists(&path));
    }

    #[test]
    fn mem_avail_is_nonzero_on_a_live_system() {
        assert!(mem_avail() > 0);
    }

    #[test]
    fn run_program_waits_for_child_by_default() {
        run_program(&["/bin/true"]).unwrap();
    }
}
