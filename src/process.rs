//! Process control via ptrace.
//!
//! Launches the target stopped at its exec, single-steps it and reads its
//! registers and memory. Only the initial thread is traced.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::pipe::ExecChannel;
use crate::registers::Registers;
use crate::types::{ProcessState, StopReason, VirtAddr};

/// A traced process.
///
/// Dropping a live process kills it: the target never outlives its tracer.
pub struct Process {
    pid: Pid,
    state: ProcessState,
    mem: File,
}

impl Process {
    /// Launch `program` under ptrace, stopped at its first instruction.
    pub fn launch(program: &Path, args: &[String]) -> Result<Self> {
        let prog = CString::new(program.as_os_str().as_bytes())
            .map_err(|e| Error::Process(format!("invalid program path: {}", e)))?;
        let mut argv = vec![prog.clone()];
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|e| Error::Process(format!("invalid argument {:?}: {}", arg, e)))?,
            );
        }

        let mut channel = ExecChannel::new()?;

        match unsafe { fork() }.map_err(|e| Error::Process(format!("fork failed: {}", e)))? {
            ForkResult::Child => {
                channel.close_read();
                let errno = match ptrace::traceme() {
                    Ok(()) => match execvp(&prog, &argv) {
                        Err(errno) => errno,
                        Ok(never) => match never {},
                    },
                    Err(errno) => errno,
                };
                channel.report_errno(errno as i32);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                if let Some(errno) = channel.wait_exec()? {
                    let _ = waitpid(child, None);
                    return Err(Error::Process(format!(
                        "cannot execute {}: {}",
                        program.display(),
                        Errno::from_raw(errno)
                    )));
                }

                // A successful exec under PTRACE_TRACEME stops with SIGTRAP.
                let status = waitpid(child, None)
                    .map_err(|e| Error::Process(format!("waitpid failed: {}", e)))?;
                match status {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    other => {
                        return Err(Error::Process(format!(
                            "unexpected status after launch: {:?}",
                            other
                        )));
                    }
                }

                let mem = match File::open(format!("/proc/{}/mem", child)) {
                    Ok(mem) => mem,
                    Err(e) => {
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        return Err(Error::Process(format!("/proc/{}/mem: {}", child, e)));
                    }
                };

                let process = Process {
                    pid: child,
                    state: ProcessState::Stopped,
                    mem,
                };
                ptrace::setoptions(child, ptrace::Options::PTRACE_O_EXITKILL)?;

                tracing::info!(pid = child.as_raw(), program = %program.display(), "launched");
                Ok(process)
            }
        }
    }

    /// Execute one instruction, optionally delivering a pending signal.
    pub fn step(&mut self, signal: Option<Signal>) -> Result<()> {
        ptrace::step(self.pid, signal)?;
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Wait for the next stop and classify it.
    pub fn wait(&mut self) -> Result<StopReason> {
        let status =
            waitpid(self.pid, None).map_err(|e| Error::Process(format!("waitpid: {}", e)))?;

        let reason = match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                self.state = ProcessState::Stopped;
                StopReason::SingleStep
            }
            WaitStatus::Stopped(_, sig) => {
                self.state = ProcessState::Stopped;
                StopReason::Signal(sig)
            }
            WaitStatus::Exited(_, code) => {
                self.state = ProcessState::Exited;
                StopReason::Exited(code)
            }
            WaitStatus::Signaled(_, sig, _) => {
                self.state = ProcessState::Terminated;
                StopReason::Terminated(sig)
            }
            other => {
                return Err(Error::Process(format!(
                    "unexpected wait status: {:?}",
                    other
                )));
            }
        };
        Ok(reason)
    }

    pub fn registers(&self) -> Result<Registers> {
        Registers::read(self.pid)
    }

    /// Read up to `buf.len()` bytes at `addr`, returning how many were
    /// readable. A short count means the range ran into unmapped memory.
    pub fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.mem.read_at(&mut buf[filled..], addr.addr() + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) if filled > 0 => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if matches!(self.state, ProcessState::Stopped | ProcessState::Running) {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launching_a_missing_program_fails() {
        let result = Process::launch(Path::new("/nonexistent/steptrace-target"), &[]);
        match result {
            Err(Error::Process(msg)) => assert!(msg.contains("/nonexistent/steptrace-target")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("launch of a missing program succeeded"),
        }
    }

    #[test]
    fn interior_nul_in_argument_is_rejected() {
        let result = Process::launch(Path::new("/bin/true"), &["a\0b".to_string()]);
        assert!(matches!(result, Err(Error::Process(_))));
    }
}
