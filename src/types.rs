use std::fmt;

/// Virtual address in the traced process.
///
/// Formats without a `0x` prefix under `{:x}`, which is exactly the
/// spelling the trace file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Why the tracee stopped after a resume.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// Completed a single-step.
    SingleStep,
    /// Received a signal that must be forwarded on the next resume.
    Signal(nix::sys::signal::Signal),
    /// Process exited normally.
    Exited(i32),
    /// Process was killed by a signal.
    Terminated(nix::sys::signal::Signal),
}

impl StopReason {
    /// Exit code handed to the "program finished" callback, if the
    /// process is gone. Signal deaths map to `128 + signo` like a shell.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StopReason::Exited(code) => Some(*code),
            StopReason::Terminated(sig) => Some(128 + *sig as i32),
            _ => None,
        }
    }
}

/// Process execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn virt_addr_display() {
        let addr = VirtAddr(0x400000);
        assert_eq!(format!("{}", addr), "0x400000");
    }

    #[test]
    fn virt_addr_lower_hex_is_bare() {
        assert_eq!(format!("{:x}", VirtAddr(0x401010)), "401010");
        assert_eq!(format!("{:x}", VirtAddr(0)), "0");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(StopReason::Exited(3).exit_code(), Some(3));
        assert_eq!(StopReason::Terminated(Signal::SIGKILL).exit_code(), Some(137));
        assert_eq!(StopReason::SingleStep.exit_code(), None);
        assert_eq!(StopReason::Signal(Signal::SIGUSR1).exit_code(), None);
    }
}
