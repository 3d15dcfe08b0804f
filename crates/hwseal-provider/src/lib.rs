#![forbid(unsafe_code)]

//! Provider contracts shared across hwseal.
//!
//! The core crate drives key rotation against these traits without knowing
//! which concrete tool (or test double) sits underneath.

pub mod luks;

pub use luks::{
    BlockDevice, DumpToken, KeySource, LuksDump, LuksProvider, LuksVersion,
};
