use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    #[error("cannot open trace file {}: {source}", path.display())]
    TraceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trace stream already closed")]
    TraceClosed,

    #[error("register {register} reported {bits} bits, expected 64")]
    RegisterWidth { register: &'static str, bits: u32 },

    #[error("process error: {0}")]
    Process(String),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
