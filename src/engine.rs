//! The seam between an instrumentation engine and the tool it drives.
//!
//! An engine owns execution of the target. It calls back into a [`Tool`]
//! at four points:
//!
//! - an instruction is compiled (made executable) for the first time, or
//!   again after its cached translation was dropped;
//! - a probe attached at compile time is reached during execution;
//! - an executable image has been mapped;
//! - the program has finished.
//!
//! Compile callbacks and probe callbacks are not 1:1. A location compiled
//! once may execute any number of times, and a location may be compiled
//! again for the same address.

use crate::error::Result;
use crate::registers::Register;
use crate::types::VirtAddr;

/// An instruction as seen at compile time.
#[derive(Debug, Clone, Copy)]
pub struct Instruction<'a> {
    address: VirtAddr,
    bytes: &'a [u8],
}

impl<'a> Instruction<'a> {
    pub fn new(address: VirtAddr, bytes: &'a [u8]) -> Self {
        Instruction { address, bytes }
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    /// Encoded length in bytes. Zero when the engine could not decode it.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Analysis routines a tool can attach to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Serialize the instruction pointer and general-purpose registers.
    RegisterSnapshot,
}

/// Where, relative to the instruction, an attached probe runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Immediately before the instruction executes, on every execution.
    Before,
}

/// Probes attached to one compiled instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeList {
    probes: Vec<(InsertPoint, Probe)>,
}

impl ProbeList {
    pub fn insert_call(&mut self, point: InsertPoint, probe: Probe) {
        self.probes.push((point, probe));
    }

    /// Probes to run before the instruction, in attachment order.
    pub fn before(&self) -> impl Iterator<Item = Probe> + '_ {
        self.probes
            .iter()
            .filter(|(point, _)| *point == InsertPoint::Before)
            .map(|(_, probe)| *probe)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

/// Read access to a thread's registers at a paused point.
pub trait RegisterContext {
    /// Width of `reg` in bits as reported by the engine.
    fn register_width(&self, reg: Register) -> u32;

    fn read_register(&self, reg: Register) -> u64;
}

/// An executable image mapped into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLoad {
    pub name: String,
    pub low: VirtAddr,
    pub high: VirtAddr,
}

impl ImageLoad {
    pub fn new(name: impl Into<String>, low: u64, high: u64) -> Self {
        ImageLoad {
            name: name.into(),
            low: VirtAddr(low),
            high: VirtAddr(high),
        }
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// Callbacks an engine invokes while it runs the target.
///
/// Any error returned from a callback is fatal: the engine stops the
/// target and returns the error without resuming it.
pub trait Tool {
    /// Compile-time hook. Attach probes to `probes`.
    fn instrument_instruction(
        &mut self,
        instruction: &Instruction<'_>,
        probes: &mut ProbeList,
    ) -> Result<()>;

    /// Run an attached probe against the current register state.
    fn analyze(&mut self, probe: Probe, context: &dyn RegisterContext) -> Result<()>;

    fn image_loaded(&mut self, image: &ImageLoad) -> Result<()>;

    fn finished(&mut self, exit_code: i32) -> Result<()>;
}

/// Something that can execute a target under a [`Tool`].
pub trait Engine {
    /// Run the target to completion and return its exit code.
    fn run(&mut self, tool: &mut dyn Tool) -> Result<i32>;
}
