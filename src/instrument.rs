//! Instruction instrumentation pass.
//!
//! Runs once per compilation of a code location, not once per execution.
//! It records the location and encoding, then attaches the register
//! snapshot probe so every later execution is captured.

use std::io::Write;

use crate::engine::{InsertPoint, Instruction, Probe, ProbeList};
use crate::error::Result;
use crate::trace::TraceWriter;

pub fn on_instruction<W: Write>(
    out: &mut TraceWriter<W>,
    instruction: &Instruction<'_>,
    probes: &mut ProbeList,
) -> Result<()> {
    out.write_step(instruction.address(), instruction.bytes())?;
    probes.insert_call(InsertPoint::Before, Probe::RegisterSnapshot);
    Ok(())
}
