//! Process primitives for the daemon supervisor.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

/// Process operations the supervisor needs.
pub trait ProcessControl: Send + Sync {
    /// Start `program` detached from the calling terminal with stdout and
    /// stderr going to `log`. Returns the child's pid.
    fn spawn_detached(&self, program: &Path, args: &[OsString], log: File) -> io::Result<u32>;

    /// Whether a process with this pid exists. Pids 0 and 1 never count.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Processes of the host OS. Full support on unix via `libc`; elsewhere
/// only spawning works.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

#[cfg(unix)]
impl ProcessControl for OsProcessControl {
    fn spawn_detached(&self, program: &Path, args: &[OsString], log: File) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let stderr = log.try_clone()?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));

        // New session: no controlling terminal, not hit by the shell's hangup.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        // Not waited on; the daemon outlives us.
        let child = command.spawn()?;
        Ok(child.id())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 1 {
            return false;
        }
        // Signal 0 only checks that the process exists.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|pid| *pid > 1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid"))?;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl ProcessControl for OsProcessControl {
    fn spawn_detached(&self, program: &Path, args: &[OsString], log: File) -> io::Result<u32> {
        let stderr = log.try_clone()?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        Ok(child.id())
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "daemon stop is only supported on unix",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(OsProcessControl.is_alive(std::process::id()));
    }

    #[test]
    fn test_reserved_and_huge_pids_are_not_alive() {
        assert!(!OsProcessControl.is_alive(0));
        assert!(!OsProcessControl.is_alive(1));
        assert!(!OsProcessControl.is_alive(4_000_000_000));
    }

    #[test]
    fn test_terminate_refuses_init() {
        assert!(OsProcessControl.terminate(1).is_err());
    }
}
