//! I/O utilities
//!
//! The relay used by TCP flows: a bounded, half-close aware bidirectional
//! copy that reports per-direction byte counts.

mod copy;

pub use copy::{
    bidirectional_copy, CopyResult, Direction, Relay, RelayError, DEFAULT_BUFFER_SIZE,
    MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
