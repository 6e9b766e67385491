//! Error types for the two ways this crate can refuse to do what it was
//! asked (§7a). Access denial itself is not an error — `check`/`tagcheck`
//! just return `false` and let the caller raise whatever fault the ISA
//! demands.
use thiserror::Error;

/// `TagEngine::new` rejects a `tag_width` outside `1..=64` at construction
/// instead of silently falling back to a default and aborting the process,
/// as the original does.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("tag width must be between 1 and 64 bits, got {got}")]
pub struct ConfigError {
    pub got: u32,
}

/// A policy violation raised by [`crate::tag::TagEngine::store_tag`] in
/// place of the original's `throw trap_illegal_instruction(0)`.
///
/// The caller is expected to translate either variant into the simulator's
/// illegal-instruction trap; this crate does not know how traps are raised.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TagViolation {
    /// A Normal-mode (non-M) store attempted to touch or write a non-Normal
    /// tag. Normal mode may only ever write `Normal -> Normal`.
    #[error("normal-mode tag write @ {addr:#x} must be Normal -> Normal")]
    NormalModeWrite { addr: u64 },

    /// A U-mode store attempted to touch or write a tag outside
    /// `{Normal, UTrusted}`.
    #[error(
        "user-mode tag write @ {addr:#x} may only touch {{Normal, UTrusted}} (old={old}, new={attempted})"
    )]
    UntrustedOverwrite { addr: u64, old: u8, attempted: u8 },
}
