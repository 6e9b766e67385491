//! Per-word security tags and the (mode x tag) access matrix (§3.5, §4.2).
use std::collections::HashMap;

use log::warn;

use crate::error::{ConfigError, TagViolation};
use crate::pmp::PmpCache;
use crate::processor::CoreView;
use crate::types::{AccessType, Mode, Privilege, SecurityLevel, Tag};

/// RWX bitmask constants, matching the shift convention in
/// `original_source/riscv/tag.cc` (`R = 1<<LOAD, W = 1<<STORE, X = 1<<FETCH`).
const R: u8 = 1 << (AccessType::Load as u8);
const W: u8 = 1 << (AccessType::Store as u8);
const X: u8 = 1 << (AccessType::Fetch as u8);

/// The access matrix: `ACCESS_MATRIX[mode][tag]` yields the RWX mask that
/// mode may exercise over memory carrying that tag (§4.2).
///
/// ```text
///          to->  NORMAL  CALLABLE  UTRUSTED  STRUSTED
/// from UN         R|W|X    X         0         0
///      SN         R|W|X    X         0         0
///      UT         R|W|X    R|X       R|W|X     0
///      ST         R|W|X    R|W|X     R|W       R|W|X
/// ```
const ACCESS_MATRIX: [[u8; 4]; 4] = [
    /* UN */ [R | W | X, X, 0, 0],
    /* SN */ [R | W | X, X, 0, 0],
    /* UT */ [R | W | X, R | X, R | W | X, 0],
    /* ST */ [R | W | X, R | W | X, R | W, R | W | X],
];

/// The tag engine: one instance per simulated hart.
pub struct TagEngine {
    tags: HashMap<u64, u64>,
    tag_width: u32,
}

/// Word-aligned granularity for a given register width, in bytes
/// (§3.5: `xlen/8`, always a power of two).
fn granularity(xlen: u32) -> u64 {
    (xlen / 8) as u64
}

fn align(addr: u64, xlen: u32) -> u64 {
    let g = granularity(xlen);
    (addr / g) * g
}

impl TagEngine {
    /// Construct a tag engine with the given tag width in bits.
    ///
    /// The original falls back to a default width of 2 and asserts (aborts
    /// the process) when `tag_width` is out of range; this reimplementation
    /// turns that into a `Result` so the host decides whether construction
    /// failure is fatal (§7a).
    pub fn new(tag_width: u32) -> Result<Self, ConfigError> {
        if tag_width < 1 || tag_width > 64 {
            return Err(ConfigError { got: tag_width });
        }
        Ok(TagEngine {
            tags: HashMap::new(),
            tag_width,
        })
    }

    /// Clear the tag map.
    pub fn reset(&mut self) {
        self.tags.clear();
    }

    /// Store `val` at the aligned word containing `addr`.
    ///
    /// When the PMP is active and the caller is not M-mode, the write is
    /// checked against the Normal- and U-mode policies (§3.6, §4.2
    /// `store_tag`) before being applied. On RV32, `addr` is truncated to 32
    /// bits before alignment, matching the original.
    pub fn store_tag(
        &mut self,
        addr: u64,
        val: u64,
        pmp: &PmpCache,
        core: &dyn CoreView,
    ) -> Result<(), TagViolation> {
        let addr = truncate_addr(addr, core.xlen());

        if pmp.isactive() && core.privilege() != Privilege::Machine {
            let old_tag = self.load_tag(addr, core.xlen());

            if core.security_level() == SecurityLevel::Normal {
                let normal_to_normal = old_tag == Tag::Normal as u64 && val == Tag::Normal as u64;
                if !normal_to_normal {
                    warn!(
                        "normal-mode tag write @ {:#x} can only store Normal tags",
                        core.pc()
                    );
                    return Err(TagViolation::NormalModeWrite { addr });
                }
            }

            if core.privilege() == Privilege::User {
                let old_ok = old_tag == Tag::Normal as u64 || old_tag == Tag::UTrusted as u64;
                let new_ok = val == Tag::Normal as u64 || val == Tag::UTrusted as u64;
                if !old_ok || !new_ok {
                    warn!(
                        "user-mode tag write @ {:#x} may only touch {{Normal, UTrusted}} (old={old_tag}, new={val})",
                        core.pc()
                    );
                    return Err(TagViolation::UntrustedOverwrite {
                        addr,
                        old: old_tag as u8,
                        attempted: val as u8,
                    });
                }
            }
        }

        let val = if self.tag_width != 64 {
            val % (1u64 << self.tag_width)
        } else {
            val
        };

        let aligned = align(addr, core.xlen());
        self.tags.insert(aligned, val);
        Ok(())
    }

    /// Returns the stored tag at `addr`'s aligned word, or `Normal` if
    /// unmapped.
    pub fn load_tag(&self, addr: u64, xlen: u32) -> u64 {
        let addr = truncate_addr(addr, xlen);
        let aligned = align(addr, xlen);
        *self.tags.get(&aligned).unwrap_or(&(Tag::Normal as u64))
    }

    /// Check whether the current (privilege, security, tag) triple permits
    /// `ty`, performing a vertical mode switch when `ty` is a qualifying
    /// fetch (§4.2 `tagcheck`).
    ///
    /// M-mode and an inactive PMP both bypass the matrix entirely.
    pub fn tagcheck(
        &self,
        addr: u64,
        ty: AccessType,
        pmp: &PmpCache,
        core: &mut dyn CoreView,
    ) -> bool {
        if !pmp.isactive() || core.privilege() == Privilege::Machine {
            return true;
        }

        let sec_level = core.security_level();
        let priv_ = core.privilege();
        let mode = Mode::compose(priv_, sec_level);
        let tag = Tag::from_raw(self.load_tag(addr, core.xlen()));

        let allowed = ACCESS_MATRIX[mode.index()][tag as usize] & (1 << (ty as u8)) != 0;
        if !allowed {
            warn!(
                "tag access violation @ {:#x} -> {:#x}: type {:?}, mode {:?}, tag {:?}",
                core.pc(),
                addr,
                ty,
                mode,
                tag
            );
            return false;
        }

        if ty == AccessType::Fetch {
            self.trusted_modeswitch(sec_level, priv_, tag, pmp, core)
        } else {
            true
        }
    }

    /// Test for and perform a vertical mode switch on a successful fetch
    /// (§4.2 "Vertical mode switch").
    fn trusted_modeswitch(
        &self,
        sec_level: SecurityLevel,
        priv_: Privilege,
        tag: Tag,
        pmp: &PmpCache,
        core: &mut dyn CoreView,
    ) -> bool {
        match (sec_level, tag) {
            (SecurityLevel::Normal, Tag::Callable) => {
                if priv_ == Privilege::User && !pmp.is_ut_runnable() {
                    warn!(
                        "modeswitch to Secure @ {:#x} fails: TTCB not initialized or interrupted",
                        core.pc()
                    );
                    return false;
                }
                core.set_security_level(SecurityLevel::Secure);
                true
            }
            (SecurityLevel::Secure, Tag::Normal) => {
                core.set_security_level(SecurityLevel::Normal);
                true
            }
            _ => true,
        }
    }
}

/// On RV32, addresses are truncated to 32 bits before alignment (§4.2
/// `load_tag`).
fn truncate_addr(addr: u64, xlen: u32) -> u64 {
    if xlen == 32 {
        addr as u32 as u64
    } else {
        addr
    }
}
