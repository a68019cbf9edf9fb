//! Code cache of compiled instructions.
//!
//! A lookup miss is a compilation event: the tool is asked to instrument
//! the instruction and the resulting probe list is kept alongside the
//! bytes. When the cache is full it is flushed wholesale, so addresses
//! executed afterwards are compiled (and instrumented) again.

use std::collections::HashMap;

use crate::engine::{Instruction, ProbeList, Tool};
use crate::error::Result;
use crate::types::VirtAddr;

/// Default number of compiled instructions held before a flush.
pub const DEFAULT_CACHE_CAPACITY: usize = 65536;

/// An instruction together with the probes its tool attached.
#[derive(Debug, Clone)]
pub struct CompiledInstruction {
    pub bytes: Vec<u8>,
    pub probes: ProbeList,
}

pub struct CodeCache {
    entries: HashMap<VirtAddr, CompiledInstruction>,
    capacity: usize,
    compilations: u64,
    flushes: u64,
}

impl CodeCache {
    pub fn new(capacity: usize) -> Self {
        CodeCache {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            compilations: 0,
            flushes: 0,
        }
    }

    pub fn get(&self, addr: VirtAddr) -> Option<&CompiledInstruction> {
        self.entries.get(&addr)
    }

    /// Return the compiled instruction at `addr`, compiling it on a miss.
    ///
    /// `fetch` supplies the instruction bytes and is only called on a miss.
    pub fn compile_with<F>(
        &mut self,
        addr: VirtAddr,
        tool: &mut dyn Tool,
        fetch: F,
    ) -> Result<&CompiledInstruction>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if !self.entries.contains_key(&addr) {
            let bytes = fetch()?;
            let mut probes = ProbeList::default();
            tool.instrument_instruction(&Instruction::new(addr, &bytes), &mut probes)?;

            if self.entries.len() >= self.capacity {
                self.flush();
            }
            self.entries
                .insert(addr, CompiledInstruction { bytes, probes });
            self.compilations += 1;
        }
        Ok(&self.entries[&addr])
    }

    /// Drop every compiled instruction.
    pub fn flush(&mut self) {
        tracing::debug!(entries = self.entries.len(), "code cache flushed");
        self.entries.clear();
        self.flushes += 1;
    }

    /// Drop one compiled instruction. Returns whether it was cached.
    pub fn invalidate(&mut self, addr: VirtAddr) -> bool {
        self.entries.remove(&addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ImageLoad, InsertPoint, Probe, RegisterContext};

    /// Counts compile callbacks and attaches one probe per instruction.
    #[derive(Default)]
    struct CountingTool {
        compiled: Vec<VirtAddr>,
    }

    impl Tool for CountingTool {
        fn instrument_instruction(
            &mut self,
            instruction: &Instruction<'_>,
            probes: &mut ProbeList,
        ) -> Result<()> {
            self.compiled.push(instruction.address());
            probes.insert_call(InsertPoint::Before, Probe::RegisterSnapshot);
            Ok(())
        }

        fn analyze(&mut self, _probe: Probe, _context: &dyn RegisterContext) -> Result<()> {
            Ok(())
        }

        fn image_loaded(&mut self, _image: &ImageLoad) -> Result<()> {
            Ok(())
        }

        fn finished(&mut self, _exit_code: i32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hit_does_not_recompile() {
        let mut cache = CodeCache::new(16);
        let mut tool = CountingTool::default();

        for _ in 0..5 {
            let compiled = cache
                .compile_with(VirtAddr(0x1000), &mut tool, || Ok(vec![0x90]))
                .unwrap();
            assert_eq!(compiled.bytes, vec![0x90]);
            assert_eq!(compiled.probes.len(), 1);
        }

        assert_eq!(tool.compiled, vec![VirtAddr(0x1000)]);
        assert_eq!(cache.compilations(), 1);
    }

    #[test]
    fn fetch_only_runs_on_miss() {
        let mut cache = CodeCache::new(16);
        let mut tool = CountingTool::default();
        cache
            .compile_with(VirtAddr(0x1000), &mut tool, || Ok(vec![0xc3]))
            .unwrap();
        let compiled = cache
            .compile_with(VirtAddr(0x1000), &mut tool, || {
                panic!("fetch called on a cache hit")
            })
            .unwrap();
        assert_eq!(compiled.bytes, vec![0xc3]);
    }

    #[test]
    fn full_cache_flushes_and_recompiles() {
        let mut cache = CodeCache::new(2);
        let mut tool = CountingTool::default();

        for addr in [0x10, 0x20, 0x30, 0x10] {
            cache
                .compile_with(VirtAddr(addr), &mut tool, || Ok(vec![0x90]))
                .unwrap();
        }

        // 0x30 triggered a flush, so 0x10 had to be compiled again.
        assert_eq!(cache.flushes(), 1);
        assert_eq!(cache.compilations(), 4);
        assert_eq!(
            tool.compiled,
            vec![VirtAddr(0x10), VirtAddr(0x20), VirtAddr(0x30), VirtAddr(0x10)]
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_forces_recompile() {
        let mut cache = CodeCache::new(16);
        let mut tool = CountingTool::default();
        cache
            .compile_with(VirtAddr(0x10), &mut tool, || Ok(vec![0x90]))
            .unwrap();
        assert!(cache.invalidate(VirtAddr(0x10)));
        assert!(!cache.invalidate(VirtAddr(0x10)));
        assert!(cache.get(VirtAddr(0x10)).is_none());
        cache
            .compile_with(VirtAddr(0x10), &mut tool, || Ok(vec![0x90]))
            .unwrap();
        assert_eq!(tool.compiled.len(), 2);
    }

    #[test]
    fn fetch_error_leaves_cache_untouched() {
        let mut cache = CodeCache::new(16);
        let mut tool = CountingTool::default();
        let result = cache.compile_with(VirtAddr(0x10), &mut tool, || {
            Err(crate::error::Error::Other("unreadable".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(tool.compiled.is_empty());
    }
}
