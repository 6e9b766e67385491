//! The narrow, read-mostly view this core needs of the simulated processor.
//!
//! The real pipeline, MMU, and CSR file are out of scope (see crate docs).
//! [`CoreView`] exists only so [`crate::pmp::PmpCache`] and
//! [`crate::tag::TagEngine`] can learn the hart's current privilege and
//! security level, and so a fetch can flip that security level, without
//! either struct owning a persistent reference to the processor the way the
//! original C++ does (`pmp_t`/`tag_t` both hold a `processor_t*`). Passing a
//! `&dyn CoreView` into each call that needs it sidesteps the aliasing
//! Rust would otherwise require working around.
use crate::types::{Privilege, SecurityLevel};

pub trait CoreView {
    /// The hart's current horizontal privilege level.
    fn privilege(&self) -> Privilege;

    /// The hart's current vertical security level.
    fn security_level(&self) -> SecurityLevel;

    /// Perform a vertical mode switch. Called only by
    /// [`crate::tag::TagEngine::trusted_modeswitch`] on a qualifying fetch.
    fn set_security_level(&mut self, level: SecurityLevel);

    /// The program counter, used only for log messages.
    fn pc(&self) -> u64;

    /// The hart's configured register width in bits (32 or 64), used to
    /// decide whether tag addresses get truncated to 32 bits.
    fn xlen(&self) -> u32;
}
