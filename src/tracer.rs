//! Tracer tool and session lifecycle.
//!
//! [`Tracer`] owns the trace stream and routes each engine callback to its
//! handler. [`run`] opens the stream before the engine is even created, so
//! a stream that cannot be opened means nothing is ever instrumented.

use std::io::Write;
use std::path::PathBuf;

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::engine::{Engine, ImageLoad, Instruction, Probe, ProbeList, RegisterContext, Tool};
use crate::error::Result;
use crate::trace::{RecordCounts, TraceWriter, DEFAULT_TRACE_PATH};
use crate::{image, instrument, probe};

/// Settings for one tracing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Trace file, truncated on open.
    pub output: PathBuf,
    /// Compiled instructions kept before the code cache is flushed.
    pub cache_capacity: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            output: PathBuf::from(DEFAULT_TRACE_PATH),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// The instruction tracer as seen by an engine.
pub struct Tracer<W: Write> {
    out: TraceWriter<W>,
    exit_code: Option<i32>,
}

impl<W: Write> Tracer<W> {
    pub fn new(out: TraceWriter<W>) -> Self {
        Tracer {
            out,
            exit_code: None,
        }
    }

    pub fn writer(&self) -> &TraceWriter<W> {
        &self.out
    }

    /// Exit code passed to the finish callback, once it has run.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn into_writer(self) -> TraceWriter<W> {
        self.out
    }
}

impl<W: Write> Tool for Tracer<W> {
    fn instrument_instruction(
        &mut self,
        instruction: &Instruction<'_>,
        probes: &mut ProbeList,
    ) -> Result<()> {
        instrument::on_instruction(&mut self.out, instruction, probes)
    }

    fn analyze(&mut self, kind: Probe, context: &dyn RegisterContext) -> Result<()> {
        match kind {
            Probe::RegisterSnapshot => probe::snapshot(&mut self.out, context),
        }
    }

    fn image_loaded(&mut self, loaded: &ImageLoad) -> Result<()> {
        image::on_image_loaded(&mut self.out, loaded)
    }

    fn finished(&mut self, exit_code: i32) -> Result<()> {
        tracing::info!(exit_code, "target finished");
        self.exit_code = Some(exit_code);
        self.out.close()
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOutcome {
    pub exit_code: i32,
    pub counts: RecordCounts,
}

/// Open the trace stream, then create an engine with `launch` and run it.
pub fn run<E, F>(config: &TraceConfig, launch: F) -> Result<TraceOutcome>
where
    E: Engine,
    F: FnOnce(&TraceConfig) -> Result<E>,
{
    let out = TraceWriter::create(&config.output)?;
    let mut tracer = Tracer::new(out);

    let mut engine = launch(config)?;
    let exit_code = engine.run(&mut tracer)?;

    // Engines call `finished` themselves; this covers one that returned
    // without doing so.
    let mut out = tracer.into_writer();
    out.close()?;

    Ok(TraceOutcome {
        exit_code,
        counts: out.counts(),
    })
}
