//! Register snapshot probe.
//!
//! Runs before every execution of an instrumented instruction, so it sits
//! on the hottest path of the traced program: values are gathered into a
//! stack array and formatted straight into the trace buffer.

use std::io::Write;

use crate::engine::RegisterContext;
use crate::error::{Error, Result};
use crate::registers::{Register, TRACED_REGISTERS};
use crate::trace::TraceWriter;

/// Write one `regs` record for the current execution point.
///
/// All registers are read and width-checked before anything is written,
/// so an integrity violation never leaves a partial record behind.
pub fn snapshot<W: Write>(out: &mut TraceWriter<W>, context: &dyn RegisterContext) -> Result<()> {
    let rip = read_checked(context, Register::Rip)?;

    let mut values = [0u64; TRACED_REGISTERS.len()];
    for (slot, reg) in values.iter_mut().zip(TRACED_REGISTERS) {
        *slot = read_checked(context, reg)?;
    }

    out.write_regs(rip, TRACED_REGISTERS.iter().map(|r| r.name()).zip(values))
}

fn read_checked(context: &dyn RegisterContext, reg: Register) -> Result<u64> {
    let bits = context.register_width(reg);
    if bits != 64 {
        return Err(Error::RegisterWidth {
            register: reg.name(),
            bits,
        });
    }
    Ok(context.read_register(reg))
}
