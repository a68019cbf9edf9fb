//! Instrumentation engine built on ptrace single-stepping.
//!
//! Every instruction the target executes is stepped individually. The
//! first time an address is reached (or the first time after the code
//! cache was flushed) it is compiled: its bytes are read, its length is
//! decoded and the tool instruments it. Attached probes see the registers
//! captured before each step, and run once the step shows the instruction
//! actually executed.
//!
//! Images are discovered from `/proc/[pid]/maps`: at start, after any
//! syscall that can change mappings, and whenever execution reaches an
//! address outside every known mapping. An image is reported before any
//! instruction inside it is compiled. The code cache is flushed after a
//! mapping syscall, and a cached instruction whose bytes changed in place
//! is compiled again.
//!
//! A signal stop happens before the instruction at pc has run, so that
//! step produces no snapshot. When the tracee handles the signal, it is
//! delivered on a step of its own and the interrupted instruction is
//! probed when it runs after the handler returns.

use std::collections::HashMap;
use std::path::Path;

use nix::sys::signal::Signal;

use crate::cache::CodeCache;
use crate::decode::{self, MAX_INSTRUCTION_LEN};
use crate::engine::{Engine, ImageLoad, Tool};
use crate::error::Result;
use crate::process::Process;
use crate::procfs::{self, MemoryRegion};
use crate::registers::{Register, Registers};
use crate::types::{StopReason, VirtAddr};

/// Syscalls after which the mapping list is re-read.
const MAPPING_SYSCALLS: &[u64] = &[
    9,  // mmap
    10, // mprotect
    11, // munmap
    25, // mremap
    59, // execve
];

pub struct Stepper {
    process: Process,
    cache: CodeCache,
    regions: Vec<MemoryRegion>,
    /// Images currently mapped and already reported, by name.
    images: HashMap<String, ImageLoad>,
    pending_signal: Option<Signal>,
    steps: u64,
}

impl Stepper {
    /// Launch `program` stopped at its first instruction.
    pub fn launch(program: &Path, args: &[String], cache_capacity: usize) -> Result<Self> {
        let process = Process::launch(program, args)?;
        Ok(Stepper {
            process,
            cache: CodeCache::new(cache_capacity),
            regions: Vec::new(),
            images: HashMap::new(),
            pending_signal: None,
            steps: 0,
        })
    }

    /// Re-read the mapping list and report images not seen before.
    ///
    /// An image that is no longer mapped is forgotten, so mapping it again
    /// later is reported again.
    fn refresh_images(&mut self, tool: &mut dyn Tool) -> Result<()> {
        self.regions = procfs::read_memory_maps(self.process.pid())?;
        let current = procfs::executable_images(&self.regions);

        self.images
            .retain(|name, _| current.iter().any(|img| &img.name == name));

        for image in current {
            if self.images.contains_key(&image.name) {
                continue;
            }
            tracing::debug!(name = %image.name, low = %image.low, high = %image.high, "image mapped");
            tool.image_loaded(&image)?;
            self.images.insert(image.name.clone(), image);
        }
        Ok(())
    }

    fn is_mapped(&self, addr: VirtAddr) -> bool {
        procfs::find_region_containing(&self.regions, addr).is_some()
    }

    fn finish(&mut self, tool: &mut dyn Tool, reason: &StopReason, code: i32) -> Result<i32> {
        tracing::info!(
            steps = self.steps,
            compilations = self.cache.compilations(),
            flushes = self.cache.flushes(),
            ?reason,
            "target ended"
        );
        tool.finished(code)?;
        Ok(code)
    }
}

/// Read the instruction at `pc`. Unreadable or undecodable code yields an
/// empty encoding rather than an error.
fn fetch_instruction(process: &Process, pc: VirtAddr) -> Result<Vec<u8>> {
    let mut buf = [0u8; MAX_INSTRUCTION_LEN];
    let available = match process.read_memory(pc, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(%pc, error = %e, "instruction bytes unreadable");
            0
        }
    };
    let len = decode::instruction_length(&buf[..available], pc);
    Ok(buf[..len].to_vec())
}

/// Whether the bytes at `pc` still match a cached encoding.
fn still_encoded(process: &Process, pc: VirtAddr, bytes: &[u8]) -> bool {
    let mut buf = [0u8; MAX_INSTRUCTION_LEN];
    let current = &mut buf[..bytes.len()];
    matches!(process.read_memory(pc, current), Ok(n) if n == bytes.len()) && *current == *bytes
}

/// An instruction stepped but not yet known to have run.
///
/// Probes see the registers from before the step and only run once the
/// step completed: a signal stop means the instruction did not execute.
struct InFlight {
    pc: VirtAddr,
    regs: Registers,
    remaps: bool,
}

impl Stepper {
    /// Run the probes attached to a completed instruction. Returns whether
    /// it may have changed the mappings.
    fn retire(&mut self, tool: &mut dyn Tool, insn: InFlight) -> Result<bool> {
        // Nothing is evicted between compiling and retiring an instruction.
        if let Some(compiled) = self.cache.get(insn.pc) {
            for probe in compiled.probes.before() {
                tool.analyze(probe, &insn.regs)?;
            }
        }
        Ok(insn.remaps)
    }

    /// Step once with a signal whose handler will run first. The
    /// interrupted instruction has not executed yet.
    fn enter_handler(&mut self, signal: Signal) -> Result<()> {
        tracing::debug!(?signal, "entering signal handler");
        self.process.step(Some(signal))
    }

    /// Compile the instruction at the current pc if needed and step it.
    fn step_instruction(&mut self, tool: &mut dyn Tool, signal: Option<Signal>) -> Result<InFlight> {
        let regs = self.process.registers()?;
        let pc = VirtAddr(regs.pc());
        if !self.is_mapped(pc) {
            self.refresh_images(tool)?;
        }

        // Code written in place since it was compiled is a new translation.
        if let Some(cached) = self.cache.get(pc) {
            if !still_encoded(&self.process, pc, &cached.bytes) {
                tracing::debug!(%pc, "code changed under cached translation");
                self.cache.invalidate(pc);
            }
        }

        let process = &self.process;
        let compiled = self
            .cache
            .compile_with(pc, tool, || fetch_instruction(process, pc))?;
        let remaps = decode::is_syscall(&compiled.bytes)
            && MAPPING_SYSCALLS.contains(&regs.get(Register::Rax));

        self.process.step(signal)?;
        self.steps += 1;
        Ok(InFlight { pc, regs, remaps })
    }
}

impl Engine for Stepper {
    fn run(&mut self, tool: &mut dyn Tool) -> Result<i32> {
        self.refresh_images(tool)?;

        loop {
            let in_flight = match self.pending_signal.take() {
                Some(sig) if procfs::has_signal_handler(self.process.pid(), sig)? => {
                    self.enter_handler(sig)?;
                    None
                }
                signal => Some(self.step_instruction(tool, signal)?),
            };

            match self.process.wait()? {
                StopReason::SingleStep => {
                    let remaps = match in_flight {
                        Some(insn) => self.retire(tool, insn)?,
                        None => false,
                    };
                    if remaps {
                        // Translations of unmapped or remapped code are stale.
                        self.cache.flush();
                        self.refresh_images(tool)?;
                    }
                }
                StopReason::Signal(sig) => {
                    tracing::debug!(?sig, "signal stop");
                    self.pending_signal = Some(sig);
                }
                reason @ StopReason::Exited(_) => {
                    // The exiting syscall itself ran.
                    if let Some(insn) = in_flight {
                        self.retire(tool, insn)?;
                    }
                    let code = reason.exit_code().unwrap_or_default();
                    return self.finish(tool, &reason, code);
                }
                reason => {
                    let code = reason.exit_code().unwrap_or_default();
                    return self.finish(tool, &reason, code);
                }
            }
        }
    }
}
