//! steptrace: an instruction-level execution tracer for Linux x86_64.
//!
//! The target runs under an instrumentation engine. Every time the engine
//! compiles an instruction a `step` record is written, every time that
//! instruction executes a `regs` snapshot is written, and every executable
//! image that gets mapped produces an `imgload` record. All records go to a
//! single line-oriented trace file.
//!
//! # Module overview
//!
//! ## Trace format
//!
//! - [`trace`]: Trace file writer and record layout.
//! - [`record`]: Trace reader and property checks.
//!
//! ## Tool
//!
//! - [`instrument`]: Compile-time hook writing `step` records.
//! - [`probe`]: Register snapshot probe writing `regs` records.
//! - [`image`]: Module load observer writing `imgload` records.
//! - [`tracer`]: The tool tying those hooks to one trace stream, and the run driver.
//!
//! ## Engines
//!
//! - [`engine`]: The `Tool` / `Engine` seam.
//! - [`cache`]: Code cache deciding when an instruction is (re)compiled.
//! - [`decode`]: x86_64 instruction length decoding using iced-x86.
//! - [`scripted`]: Deterministic in-memory engine replaying a scripted run.
//! - [`stepper`]: Engine single-stepping a real process with ptrace. *(Linux-only)*
//!
//! ## Process plumbing
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Core types: `VirtAddr`, `StopReason`, `ProcessState`.
//! - [`registers`]: x86_64 register names and the traced register order.
//! - [`pipe`]: Fork/exec synchronization pipe.
//! - [`procfs`]: `/proc/pid/maps` parsing and image discovery.
//! - [`process`]: Process control via ptrace (launch, step, read memory). *(Linux-only)*

// Platform-independent modules
pub mod error;
pub mod types;
pub mod registers;
pub mod engine;
pub mod trace;
pub mod record;
pub mod cache;
pub mod decode;
pub mod instrument;
pub mod probe;
pub mod image;
pub mod tracer;
pub mod scripted;
pub mod pipe;
pub mod procfs;

// Linux-only modules (ptrace, /proc/pid/mem)
#[cfg(target_os = "linux")]
pub mod process;
#[cfg(target_os = "linux")]
pub mod stepper;
