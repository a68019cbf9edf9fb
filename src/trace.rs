//! The trace output stream.
//!
//! A single append-only, line-oriented text sink shared by every handler.
//! Records are formatted straight into a `BufWriter`, so writing a record
//! never allocates. Each record is emitted by one `write_all`/`write!`
//! sequence ending in `\n`, so a record is never split across lines.
//!
//! ```text
//! step|adr=401010|code=4889c3
//! regs|rip=401010|rdi=1|rsi=7ffd...|...|r15=0
//! imgload|/usr/bin/demo|400000|401000
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// Default location of the trace file.
pub const DEFAULT_TRACE_PATH: &str = "/tmp/steptrace.trace";

pub const STEP_TAG: &str = "step";
pub const REGS_TAG: &str = "regs";
pub const IMGLOAD_TAG: &str = "imgload";

/// Number of records of each kind written so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub steps: u64,
    pub regs: u64,
    pub imgloads: u64,
}

/// Owned handle on the trace stream.
pub struct TraceWriter<W: Write> {
    out: BufWriter<W>,
    closed: bool,
    counts: RecordCounts,
}

impl TraceWriter<File> {
    /// Create (or truncate) the trace file at `path`.
    ///
    /// Failure here is fatal: nothing may be instrumented without a sink.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::TraceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!("trace stream opened at {}", path.display());
        Ok(Self::new(file))
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> Self {
        TraceWriter {
            out: BufWriter::with_capacity(1 << 16, inner),
            closed: false,
            counts: RecordCounts::default(),
        }
    }

    /// `step|adr=<hex>|code=<hex bytes>`
    pub fn write_step(&mut self, addr: VirtAddr, code: &[u8]) -> Result<()> {
        self.check_open()?;
        write!(self.out, "{}|adr={:x}|code=", STEP_TAG, addr)?;
        for byte in code {
            write!(self.out, "{:02x}", byte)?;
        }
        self.out.write_all(b"\n")?;
        self.counts.steps += 1;
        Ok(())
    }

    /// `regs|rip=<hex>|<name>=<hex>...`
    ///
    /// `values` must already be in the fixed register order.
    pub fn write_regs<'a, I>(&mut self, rip: u64, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        self.check_open()?;
        write!(self.out, "{}|rip={:x}", REGS_TAG, rip)?;
        for (name, value) in values {
            write!(self.out, "|{}={:x}", name, value)?;
        }
        self.out.write_all(b"\n")?;
        self.counts.regs += 1;
        Ok(())
    }

    /// `imgload|<name>|<hex low>|<hex high>`
    pub fn write_imgload(&mut self, name: &str, low: VirtAddr, high: VirtAddr) -> Result<()> {
        self.check_open()?;
        writeln!(self.out, "{}|{}|{:x}|{:x}", IMGLOAD_TAG, name, low, high)?;
        self.counts.imgloads += 1;
        Ok(())
    }

    /// Flush everything buffered and refuse further records.
    ///
    /// Idempotent. The underlying handle is released when the writer drops.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.out.flush()?;
        self.closed = true;
        tracing::info!(
            steps = self.counts.steps,
            regs = self.counts.regs,
            imgloads = self.counts.imgloads,
            "trace stream closed"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn counts(&self) -> RecordCounts {
        self.counts
    }

    /// Flush and hand back the underlying sink.
    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::TraceClosed);
        }
        Ok(())
    }
}
