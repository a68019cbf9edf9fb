//! x86_64 general-purpose registers captured by the snapshot probe.
//!
//! The trace format names registers explicitly and in a fixed order
//! ([`TRACED_REGISTERS`]); nothing here depends on how an engine numbers
//! its registers internally.

use std::fmt;

/// A register the tracer knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rip,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Registers written after `rip=` in every `regs` record, in output order.
///
/// Argument registers in System V call order first, then the base, frame
/// and stack pointers, then the remaining extended registers.
pub const TRACED_REGISTERS: [Register; 15] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
    Register::Rbx,
    Register::Rbp,
    Register::Rsp,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

impl Register {
    pub fn name(self) -> &'static str {
        match self {
            Register::Rip => "rip",
            Register::Rax => "rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rsi => "rsi",
            Register::Rdi => "rdi",
            Register::Rbp => "rbp",
            Register::Rsp => "rsp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::Registers;

#[cfg(target_os = "linux")]
mod linux {
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    use super::Register;
    use crate::engine::RegisterContext;
    use crate::error::Result;

    /// Register file of a stopped tracee, fetched with `PTRACE_GETREGS`.
    pub struct Registers {
        regs: libc::user_regs_struct,
    }

    impl Registers {
        /// Read all registers from a stopped tracee.
        pub fn read(pid: Pid) -> Result<Self> {
            let regs = ptrace::getregs(pid)?;
            Ok(Registers { regs })
        }

        pub fn from_raw(regs: libc::user_regs_struct) -> Self {
            Registers { regs }
        }

        pub fn get(&self, reg: Register) -> u64 {
            match reg {
                Register::Rip => self.regs.rip,
                Register::Rax => self.regs.rax,
                Register::Rbx => self.regs.rbx,
                Register::Rcx => self.regs.rcx,
                Register::Rdx => self.regs.rdx,
                Register::Rsi => self.regs.rsi,
                Register::Rdi => self.regs.rdi,
                Register::Rbp => self.regs.rbp,
                Register::Rsp => self.regs.rsp,
                Register::R8 => self.regs.r8,
                Register::R9 => self.regs.r9,
                Register::R10 => self.regs.r10,
                Register::R11 => self.regs.r11,
                Register::R12 => self.regs.r12,
                Register::R13 => self.regs.r13,
                Register::R14 => self.regs.r14,
                Register::R15 => self.regs.r15,
            }
        }

        pub fn pc(&self) -> u64 {
            self.regs.rip
        }
    }

    impl RegisterContext for Registers {
        fn register_width(&self, _reg: Register) -> u32 {
            // Every field of user_regs_struct is an unsigned long.
            (std::mem::size_of::<libc::c_ulong>() * 8) as u32
        }

        fn read_register(&self, reg: Register) -> u64 {
            self.get(reg)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fifteen_distinct_registers() {
        let set: HashSet<_> = TRACED_REGISTERS.iter().collect();
        assert_eq!(set.len(), 15);
        assert!(!set.contains(&Register::Rip));
    }

    #[test]
    fn order_starts_with_argument_registers_and_ends_with_r15() {
        let names: Vec<_> = TRACED_REGISTERS.iter().map(|r| r.name()).collect();
        assert_eq!(&names[..5], &["rdi", "rsi", "rdx", "rcx", "r8"]);
        assert_eq!(names.last(), Some(&"r15"));
    }

    #[test]
    fn display_uses_trace_names() {
        assert_eq!(Register::Rip.to_string(), "rip");
        assert_eq!(Register::R15.to_string(), "r15");
    }
}
