//! Close-on-exec pipe reporting exec failures from a forked child.
//!
//! Both ends are opened with `O_CLOEXEC`. A successful exec closes the
//! child's write end, so the parent reads end-of-file. If exec fails the
//! child writes its errno before exiting, and the parent reads it back.
//! Either way the parent never races the child's `PTRACE_TRACEME`.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;

use crate::error::{Error, Result};

pub struct ExecChannel {
    read: Option<File>,
    write: Option<File>,
}

impl ExecChannel {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret == -1 {
            return Err(Error::Process(format!(
                "pipe2() failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: pipe2 just handed us two fresh descriptors we now own.
        let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
        Ok(ExecChannel {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Child side: report why exec did not happen.
    pub fn report_errno(&mut self, errno: i32) {
        if let Some(write) = self.write.as_mut() {
            let _ = write.write_all(&errno.to_le_bytes());
        }
    }

    /// Parent side: wait for the child to exec or fail.
    ///
    /// Returns `None` once exec succeeded, or the child's errno.
    pub fn wait_exec(&mut self) -> Result<Option<i32>> {
        self.close_write();
        let read = self
            .read
            .as_mut()
            .ok_or_else(|| Error::Process("exec channel read end already closed".into()))?;

        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match read.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match filled {
            0 => Ok(None),
            4 => Ok(Some(i32::from_le_bytes(buf))),
            n => Err(Error::Process(format!("short exec status ({} bytes)", n))),
        }
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }
}
