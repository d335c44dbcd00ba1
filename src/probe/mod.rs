//! Host resource sampling.
//!
//! Each probe owns a timer task that refreshes a published utilisation value
//! roughly once per second. Readers only ever see the last complete sample;
//! sampling failures are logged and leave the previous value in place, so a
//! probe never surfaces errors to the admission path.

mod cpu;
mod memory;

pub use cpu::CpuProbe;
pub use memory::{MemoryDetail, MemoryProbe};

use std::num::{ParseFloatError, ParseIntError};
use std::time::Duration;

use thiserror::Error;

pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Integer(#[from] ParseIntError),
    #[error(transparent)]
    Float(#[from] ParseFloatError),
    #[error("malformed {0}")]
    Malformed(&'static str),
}
