//! Deterministic in-memory engine.
//!
//! Replays a fixed script of image loads, executions and cache evictions
//! against a static code map. Running the same script twice produces the
//! same callbacks in the same order, which makes it the reference engine
//! for exercising a [`Tool`] without a live process.
//!
//! ```
//! use steptrace::scripted::ScriptedEngine;
//!
//! let engine = ScriptedEngine::new()
//!     .load("demo", 0x400000, 0x401000)
//!     .code(0x400010, &[0x90])
//!     .execute_n(0x400010, 3)
//!     .exit(0);
//! # drop(engine);
//! ```

use std::collections::HashMap;

use crate::cache::{CodeCache, DEFAULT_CACHE_CAPACITY};
use crate::engine::{Engine, ImageLoad, RegisterContext, Tool};
use crate::error::{Error, Result};
use crate::registers::Register;
use crate::types::VirtAddr;

/// One scripted engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Report an image load.
    Load(ImageLoad),
    /// Set a register value seen by later probes.
    SetRegister(Register, u64),
    /// Execute the instruction at an address, compiling it on a cache miss.
    Execute(VirtAddr),
    /// Drop one address from the code cache.
    Evict(VirtAddr),
    /// Drop the whole code cache.
    Flush,
    /// End the program with an exit code.
    Exit(i32),
}

/// Register file presented to probes.
#[derive(Debug, Clone)]
struct Frame {
    values: HashMap<Register, u64>,
    widths: HashMap<Register, u32>,
}

impl RegisterContext for Frame {
    fn register_width(&self, reg: Register) -> u32 {
        self.widths.get(&reg).copied().unwrap_or(64)
    }

    fn read_register(&self, reg: Register) -> u64 {
        self.values.get(&reg).copied().unwrap_or(0)
    }
}

pub struct ScriptedEngine {
    code: HashMap<VirtAddr, Vec<u8>>,
    events: Vec<Event>,
    cache: CodeCache,
    frame: Frame,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        ScriptedEngine {
            code: HashMap::new(),
            events: Vec::new(),
            cache: CodeCache::new(DEFAULT_CACHE_CAPACITY),
            frame: Frame {
                values: HashMap::new(),
                widths: HashMap::new(),
            },
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = CodeCache::new(capacity);
        self
    }

    /// Make the engine report `bits` as the width of `reg`.
    pub fn with_register_width(mut self, reg: Register, bits: u32) -> Self {
        self.frame.widths.insert(reg, bits);
        self
    }

    /// Place an instruction encoding at `addr`.
    pub fn code(mut self, addr: u64, bytes: &[u8]) -> Self {
        self.code.insert(VirtAddr(addr), bytes.to_vec());
        self
    }

    pub fn load(self, name: &str, low: u64, high: u64) -> Self {
        self.event(Event::Load(ImageLoad::new(name, low, high)))
    }

    pub fn set_register(self, reg: Register, value: u64) -> Self {
        self.event(Event::SetRegister(reg, value))
    }

    pub fn execute(self, addr: u64) -> Self {
        self.event(Event::Execute(VirtAddr(addr)))
    }

    pub fn execute_n(mut self, addr: u64, times: usize) -> Self {
        for _ in 0..times {
            self = self.execute(addr);
        }
        self
    }

    pub fn evict(self, addr: u64) -> Self {
        self.event(Event::Evict(VirtAddr(addr)))
    }

    pub fn flush(self) -> Self {
        self.event(Event::Flush)
    }

    pub fn exit(self, code: i32) -> Self {
        self.event(Event::Exit(code))
    }

    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

impl Engine for ScriptedEngine {
    fn run(&mut self, tool: &mut dyn Tool) -> Result<i32> {
        let events = std::mem::take(&mut self.events);
        for event in events {
            match event {
                Event::Load(image) => tool.image_loaded(&image)?,
                Event::SetRegister(reg, value) => {
                    self.frame.values.insert(reg, value);
                }
                Event::Execute(addr) => {
                    let code = &self.code;
                    let compiled = self.cache.compile_with(addr, tool, || {
                        code.get(&addr)
                            .cloned()
                            .ok_or_else(|| Error::Other(format!("no code at {}", addr)))
                    })?;
                    self.frame.values.insert(Register::Rip, addr.addr());
                    for probe in compiled.probes.before() {
                        tool.analyze(probe, &self.frame)?;
                    }
                }
                Event::Evict(addr) => {
                    self.cache.invalidate(addr);
                }
                Event::Flush => self.cache.flush(),
                Event::Exit(code) => {
                    tool.finished(code)?;
                    return Ok(code);
                }
            }
        }
        tool.finished(0)?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, TraceSummary};
    use crate::registers::TRACED_REGISTERS;
    use crate::trace::TraceWriter;
    use crate::tracer::Tracer;

    fn trace_of(mut engine: ScriptedEngine) -> (Result<i32>, String) {
        let mut tracer = Tracer::new(TraceWriter::new(Vec::new()));
        let result = engine.run(&mut tracer);
        let bytes = tracer.into_writer().into_inner().unwrap();
        (result, String::from_utf8(bytes).unwrap())
    }

    #[test]
    fn image_load_precedes_steps_in_its_range() {
        let (result, text) = trace_of(
            ScriptedEngine::new()
                .load("demo", 0x400000, 0x401000)
                .code(0x400100, &[0x55])
                .execute(0x400100)
                .exit(0),
        );
        result.unwrap();

        let loads: Vec<_> = text.lines().filter(|l| l.starts_with("imgload|")).collect();
        assert_eq!(loads, vec!["imgload|demo|400000|401000"]);
        let load_pos = text.find("imgload|demo|400000|401000").unwrap();
        let step_pos = text.find("step|adr=400100").unwrap();
        assert!(load_pos < step_pos);
    }

    #[test]
    fn single_compile_single_execute() {
        let (result, text) = trace_of(
            ScriptedEngine::new()
                .code(0x401010, &[0x48, 0x89, 0xc3])
                .set_register(Register::Rdi, 0x10)
                .set_register(Register::R15, 0xf)
                .execute(0x401010)
                .exit(0),
        );
        result.unwrap();

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "step|adr=401010|code=4889c3");
        assert_eq!(
            lines[1],
            "regs|rip=401010|rdi=10|rsi=0|rdx=0|rcx=0|r8=0|r9=0|rbx=0|rbp=0\
             |rsp=0|r10=0|r11=0|r12=0|r13=0|r14=0|r15=f"
        );
    }

    #[test]
    fn recompilation_after_eviction_repeats_step_records() {
        let (result, text) = trace_of(
            ScriptedEngine::new()
                .code(0x401000, &[0x90])
                .execute_n(0x401000, 50)
                .evict(0x401000)
                .execute_n(0x401000, 50)
                .exit(0),
        );
        result.unwrap();

        let summary = TraceSummary::collect(text.as_bytes()).unwrap();
        assert!(summary.violations.is_empty(), "{:?}", summary.violations);
        assert_eq!(summary.steps_at(0x401000), 2);
        assert_eq!(summary.regs_at(0x401000), 100);
    }

    #[test]
    fn cache_pressure_causes_recompilation() {
        let mut engine = ScriptedEngine::new()
            .with_cache_capacity(2)
            .code(0x10, &[0x90])
            .code(0x11, &[0x90])
            .code(0x12, &[0xc3]);
        for _ in 0..3 {
            engine = engine.execute(0x10).execute(0x11).execute(0x12);
        }
        let (result, text) = trace_of(engine.exit(0));
        result.unwrap();

        let summary = TraceSummary::collect(text.as_bytes()).unwrap();
        // Each pass over three addresses overflows a two-entry cache.
        assert_eq!(summary.steps_at(0x10), 3);
        assert_eq!(summary.regs_at(0x10), 3);
        assert_eq!(summary.counts.regs, 9);
    }

    #[test]
    fn replay_is_deterministic() {
        let script = || {
            ScriptedEngine::new()
                .load("demo", 0x400000, 0x401000)
                .code(0x400000, &[0x31, 0xc0])
                .code(0x400002, &[0xc3])
                .set_register(Register::Rsp, 0x7ffc_0000)
                .execute(0x400000)
                .execute(0x400002)
                .exit(0)
        };
        let (_, first) = trace_of(script());
        let (_, second) = trace_of(script());
        assert_eq!(first, second);
    }

    #[test]
    fn narrow_register_stops_the_run() {
        let (result, text) = trace_of(
            ScriptedEngine::new()
                .with_register_width(Register::Rbx, 32)
                .code(0x10, &[0x90])
                .execute(0x10)
                .execute(0x10)
                .exit(0),
        );

        assert!(matches!(
            result,
            Err(Error::RegisterWidth { register: "rbx", bits: 32 })
        ));
        // The step was recorded at compile time; no regs record was.
        assert_eq!(text, "step|adr=10|code=90\n");
    }

    #[test]
    fn missing_code_is_an_error() {
        let (result, text) = trace_of(ScriptedEngine::new().execute(0x999));
        assert!(result.is_err());
        assert!(text.is_empty());
    }

    #[test]
    fn every_regs_record_has_the_fixed_layout() {
        let (result, text) = trace_of(
            ScriptedEngine::new()
                .code(0x20, &[0x90])
                .code(0x21, &[0xc3])
                .execute(0x20)
                .execute(0x21)
                .execute(0x20)
                .exit(0),
        );
        result.unwrap();

        for line in text.lines() {
            if let Record::Regs { values, .. } = Record::parse(line).unwrap() {
                let names: Vec<_> = values.iter().map(|(n, _)| n.as_str()).collect();
                let expected: Vec<_> = TRACED_REGISTERS.iter().map(|r| r.name()).collect();
                assert_eq!(names, expected);
            }
        }
    }

    #[test]
    fn script_without_exit_finishes_with_zero() {
        let mut tracer = Tracer::new(TraceWriter::new(Vec::new()));
        let code = ScriptedEngine::new().run(&mut tracer).unwrap();
        assert_eq!(code, 0);
        assert_eq!(tracer.exit_code(), Some(0));
    }
}
