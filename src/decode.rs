//! x86_64 instruction length decoding using iced-x86.
//!
//! The tracer never interprets instructions; it only needs to know how
//! many bytes at `rip` belong to the instruction about to execute.

use iced_x86::{Decoder, DecoderOptions, Instruction};

use crate::types::VirtAddr;

/// Longest legal x86 instruction encoding.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Length of the instruction at the start of `code`, or 0 when the bytes
/// do not form a complete, valid instruction.
pub fn instruction_length(code: &[u8], ip: VirtAddr) -> usize {
    let mut decoder = Decoder::with_ip(64, code, ip.addr(), DecoderOptions::NONE);
    if !decoder.can_decode() {
        return 0;
    }
    let mut insn = Instruction::default();
    decoder.decode_out(&mut insn);
    if insn.is_invalid() {
        return 0;
    }
    insn.len()
}

/// Whether `code` is exactly the `syscall` instruction.
pub fn is_syscall(code: &[u8]) -> bool {
    code == [0x0f, 0x05]
}
