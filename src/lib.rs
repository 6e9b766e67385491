//! A PMP cache and word-granular tag engine for a two-axis (privilege x
//! security) RISC-V trusted-execution core.
//!
//! This crate is the policy layer only: it decides whether an access is
//! permitted and whether a fetch should flip the hart's security level. It
//! owns no memory, no pipeline, and no CSR file — [`processor::CoreView`] is
//! the entire surface it needs from whatever simulator embeds it.
//!
//! Unlike the rest of windy, this crate runs on the host rather than the
//! target, so it links against `std`.
#![deny(rust_2018_idioms, broken_intra_doc_links)]

pub mod bitfield;
pub mod error;
pub mod pmp;
pub mod processor;
pub mod tag;
pub mod types;

pub use error::{ConfigError, TagViolation};
pub use pmp::{PmpCache, PmpEntry, PmpFlags};
pub use processor::CoreView;
pub use tag::TagEngine;
pub use types::{AccessType, Mode, Privilege, SecurityLevel, Tag};
