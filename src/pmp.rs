//! Physical Memory Protection cache (§3.2, §3.3, §4.1).
//!
//! A small, software-managed table of 8 address ranges that gates fetch and
//! data accesses from Supervisor and User modes, plus the `mtstatus` status
//! word and the opaque TTCB pointer the trusted runtime uses to locate its
//! active enclave descriptor.
use bitflags::bitflags;
use log::warn;

use crate::processor::CoreView;
use crate::types::{AccessType, Privilege, SecurityLevel};

/// Number of hardware PMP entries (§3.2: "a fixed-size array of exactly 8").
pub const PMP_ENTRIES: usize = 8;

bitflags! {
    /// The flags word packed alongside each [`PmpEntry`]'s range
    /// (§6: `perm[2:0] | T[3] | ACK[4] | ST[5] | unused[7:6]`).
    pub struct PmpFlags: u8 {
        const READ  = 1 << (AccessType::Load as u8);
        const WRITE = 1 << (AccessType::Store as u8);
        const EXEC  = 1 << (AccessType::Fetch as u8);
        /// This entry describes a Trusted region.
        const T   = 1 << 3;
        /// This region has been acknowledged by the trusted runtime.
        const ACK = 1 << 4;
        /// This region is S-Trusted: only S-Secure may fetch here, and User
        /// mode may never enter it regardless of its other permission bits.
        const ST  = 1 << 5;
        /// RWX, no other flags set — the permissive reset state (§3.2).
        const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
    }
}

impl PmpFlags {
    fn grants(self, ty: AccessType) -> bool {
        self.bits() & (1 << (ty as u8)) != 0
    }
}

/// A single PMP range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmpEntry {
    /// Inclusive low address.
    pub base: u64,
    /// Exclusive high address: the last byte covered is `bound - 1`
    /// (§10: resolved bound convention).
    pub bound: u64,
    pub flags: PmpFlags,
}

impl PmpEntry {
    /// The fully-permissive entry every slot holds after `flush_pmp`/`reset`
    /// (§3.2 Reset invariant).
    pub const fn permissive() -> Self {
        PmpEntry {
            base: 0,
            bound: u64::MAX,
            flags: PmpFlags::RWX,
        }
    }

    /// Does this range cover `[addr, addr + len)`?
    ///
    /// Widened to `u128` so `addr + len` can never wrap even when
    /// `bound == u64::MAX` (the reset value) — see §10, bound convention.
    fn covers(&self, addr: u64, len: u64) -> bool {
        let addr = addr as u128;
        let end = addr + len as u128;
        addr >= self.base as u128 && end <= self.bound as u128
    }
}

/// `mtstatus`: `en[0] | mode[1] | reserved[15:2] | ue[16] | ui[17]` (§3.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtStatus {
    raw: u32,
}

const MTSTATUS_EN: u32 = 0;
const MTSTATUS_MODE: u32 = 1;
const MTSTATUS_UE: u32 = 16;
const MTSTATUS_UI: u32 = 17;

impl MtStatus {
    fn en(self) -> bool {
        crate::bitfield::get_bit(self.raw, MTSTATUS_EN)
    }

    fn mode(self) -> bool {
        crate::bitfield::get_bit(self.raw, MTSTATUS_MODE)
    }

    fn ue(self) -> bool {
        crate::bitfield::get_bit(self.raw, MTSTATUS_UE)
    }

    fn ui(self) -> bool {
        crate::bitfield::get_bit(self.raw, MTSTATUS_UI)
    }

    fn set_ui(&mut self, value: bool) {
        self.raw = crate::bitfield::set_bit(self.raw, MTSTATUS_UI, value);
    }
}

/// The PMP cache: one instance per simulated hart.
pub struct PmpCache {
    entries: [PmpEntry; PMP_ENTRIES],
    mtstatus: MtStatus,
    current_ttcb_ptr: u64,
}

impl Default for PmpCache {
    fn default() -> Self {
        let mut cache = PmpCache {
            entries: [PmpEntry::permissive(); PMP_ENTRIES],
            mtstatus: MtStatus::default(),
            current_ttcb_ptr: 0,
        };
        cache.reset();
        cache
    }
}

impl PmpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the TTCB pointer, zeroes `mtstatus`, and reinitializes every
    /// entry to the permissive reset state.
    pub fn reset(&mut self) {
        self.flush_pmp();
        self.mtstatus = MtStatus::default();
        self.current_ttcb_ptr = 0;
    }

    /// Reinitializes every entry to the permissive reset state, leaving
    /// `mtstatus` and the TTCB pointer untouched.
    pub fn flush_pmp(&mut self) {
        for entry in &mut self.entries {
            *entry = PmpEntry::permissive();
        }
    }

    pub fn get_entry(&self, index: usize) -> PmpEntry {
        self.entries[index]
    }

    /// Write `entry` into slot `index`, applying the S-Normal write policy
    /// (§4.1 "set_entry write policy"):
    ///
    /// - S-Normal writing an `ST` entry is dropped entirely (a warning is
    ///   logged with the writer's PC).
    /// - Any other S-Normal write has its `ACK` bit forced off.
    /// - S-Secure writes go through verbatim.
    pub fn set_entry(&mut self, index: usize, mut entry: PmpEntry, writer: &dyn CoreView) {
        if writer.privilege() == Privilege::Supervisor && writer.security_level() == SecurityLevel::Normal {
            if entry.flags.contains(PmpFlags::ST) {
                warn!(
                    "cannot (over)write PMP.ST entry from S-Normal @ {:#x}; ignoring",
                    writer.pc()
                );
                return;
            }
            entry.flags.remove(PmpFlags::ACK);
        }
        self.entries[index] = entry;
    }

    /// Returns `raw` with the read-only `mode` bit overwritten by the live
    /// security level (§4.1 `get_mtstatus`).
    pub fn get_mtstatus(&self, core: &dyn CoreView) -> u32 {
        let secure = core.security_level() == SecurityLevel::Secure;
        crate::bitfield::set_bit(self.mtstatus.raw, MTSTATUS_MODE, secure)
    }

    /// Write `status` into `mtstatus`, restoring the prior `mode` bit since
    /// it is read-only software (§4.1 `set_mtstatus`).
    pub fn set_mtstatus(&mut self, status: u32) {
        let old_mode = self.mtstatus.mode();
        self.mtstatus.raw = crate::bitfield::set_bit(status, MTSTATUS_MODE, old_mode);
    }

    pub fn isactive(&self) -> bool {
        self.mtstatus.en()
    }

    /// Is a U-Trusted thread currently eligible to run (`ue && !ui`)?
    pub fn is_ut_runnable(&self) -> bool {
        self.mtstatus.ue() && !self.mtstatus.ui()
    }

    /// Mark the running enclave as interrupted if one is currently active
    /// and runnable (§4.1 `notify_interrupt`). Called once per interrupt
    /// arrival by the trap dispatcher.
    pub fn notify_interrupt(&mut self, core: &dyn CoreView) {
        if self.isactive()
            && core.security_level() == SecurityLevel::Secure
            && core.privilege() == Privilege::User
            && self.is_ut_runnable()
        {
            warn!("interrupted running enclave @ {:#x}", core.pc());
            self.mtstatus.set_ui(true);
        }
    }

    /// Store the TTCB pointer without interpreting it.
    pub fn update_ttcb(&mut self, new_ttcb: u64) {
        self.current_ttcb_ptr = new_ttcb;
    }

    pub fn current_ttcb(&self) -> u64 {
        self.current_ttcb_ptr
    }

    /// Clear every entry's `ACK` bit.
    pub fn nack_all(&mut self) {
        for entry in &mut self.entries {
            entry.flags.remove(PmpFlags::ACK);
        }
    }

    /// The permission decision for a single access (§4.1 `check`).
    ///
    /// M-mode bypasses both subsystems by design (§1 Non-goals); this is
    /// enforced here as an explicit first branch rather than left to callers
    /// to special-case (§10, resolved open question).
    pub fn check(
        &self,
        addr: u64,
        len: u64,
        ty: AccessType,
        priv_: Privilege,
        stype: SecurityLevel,
    ) -> bool {
        match priv_ {
            Privilege::Machine => true,
            Privilege::Supervisor => self.check_supervisor(addr, len, ty, stype),
            Privilege::User => self.check_user(addr, len, ty, stype),
        }
    }

    fn check_supervisor(&self, addr: u64, len: u64, ty: AccessType, stype: SecurityLevel) -> bool {
        if ty != AccessType::Fetch {
            // Supervisor can read/write anything.
            return true;
        }
        match stype {
            SecurityLevel::Normal => true,
            SecurityLevel::Secure => {
                let matched = self.entries.iter().any(|entry| {
                    entry.covers(addr, len) && entry.flags.grants(ty) && entry.flags.contains(PmpFlags::ST)
                });
                if !matched {
                    warn!("S-Secure fetch @ {addr:#x} has no valid PMP entry");
                }
                matched
            }
        }
    }

    fn check_user(&self, addr: u64, len: u64, ty: AccessType, _stype: SecurityLevel) -> bool {
        for entry in &self.entries {
            if !entry.covers(addr, len) || !entry.flags.grants(ty) {
                continue;
            }
            // User can never enter an S-Trusted range.
            if entry.flags.contains(PmpFlags::ST) {
                continue;
            }
            // A Trusted entry gates any User fetch through it on
            // acknowledgment, whether this fetch is the Normal-to-Secure
            // transition itself or a later fetch already inside U-Trusted
            // (§10, resolved open question: gated on the entry's own T flag,
            // not on the caller's current security level).
            if ty == AccessType::Fetch
                && entry.flags.contains(PmpFlags::T)
                && !entry.flags.contains(PmpFlags::ACK)
            {
                continue;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::mock::MockCore;

    #[test]
    fn reset_is_fully_permissive() {
        let cache = PmpCache::new();
        for i in 0..PMP_ENTRIES {
            assert_eq!(cache.get_entry(i), PmpEntry::permissive());
        }
        assert_eq!(cache.current_ttcb(), 0);
        assert!(!cache.isactive());
    }

    #[test]
    fn flush_pmp_clears_custom_entries_but_not_mtstatus() {
        let mut cache = PmpCache::new();
        cache.set_mtstatus(1); // en = 1
        let core = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        cache.set_entry(
            0,
            PmpEntry {
                base: 0x1000,
                bound: 0x2000,
                flags: PmpFlags::EXEC,
            },
            &core,
        );
        cache.flush_pmp();
        assert_eq!(cache.get_entry(0), PmpEntry::permissive());
        assert!(cache.isactive());
    }

    #[test]
    fn set_mtstatus_preserves_mode_bit() {
        let mut cache = PmpCache::new();
        let core = MockCore::new(Privilege::User, SecurityLevel::Secure);
        // mode starts at 0 (writes can't set it directly either).
        cache.set_mtstatus(0b11); // attempt to set en + mode
        assert_eq!(cache.get_mtstatus(&core) & 0b11, 0b1 | 0b10); // mode overlaid live by get_mtstatus
        // mtstatus.mode itself (not the read overlay) must still be 0.
        cache.set_mtstatus(0b1);
        assert!(!cache.mtstatus.mode());
    }

    #[test]
    fn get_mtstatus_overlays_live_security_level() {
        let cache = PmpCache::new();
        let normal = MockCore::new(Privilege::User, SecurityLevel::Normal);
        let secure = MockCore::new(Privilege::User, SecurityLevel::Secure);
        assert_eq!(cache.get_mtstatus(&normal) & 0b10, 0);
        assert_eq!(cache.get_mtstatus(&secure) & 0b10, 0b10);
    }

    #[test]
    fn s_normal_write_clears_ack_and_drops_st() {
        let mut cache = PmpCache::new();
        let s_normal = MockCore::new(Privilege::Supervisor, SecurityLevel::Normal);

        cache.set_entry(
            0,
            PmpEntry {
                base: 0,
                bound: 0x1000,
                flags: PmpFlags::EXEC | PmpFlags::ACK,
            },
            &s_normal,
        );
        assert!(!cache.get_entry(0).flags.contains(PmpFlags::ACK));

        let before = cache.get_entry(1);
        cache.set_entry(
            1,
            PmpEntry {
                base: 0,
                bound: 0x1000,
                flags: PmpFlags::EXEC | PmpFlags::ST,
            },
            &s_normal,
        );
        assert_eq!(cache.get_entry(1), before, "ST write from S-Normal must be dropped");
    }

    #[test]
    fn s_secure_write_is_verbatim() {
        let mut cache = PmpCache::new();
        let s_secure = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        let entry = PmpEntry {
            base: 0x3000,
            bound: 0x4000,
            flags: PmpFlags::EXEC | PmpFlags::ST | PmpFlags::ACK,
        };
        cache.set_entry(0, entry, &s_secure);
        assert_eq!(cache.get_entry(0), entry);
    }

    #[test]
    fn nack_all_clears_every_ack() {
        let mut cache = PmpCache::new();
        let s_secure = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        for i in 0..PMP_ENTRIES {
            cache.set_entry(
                i,
                PmpEntry {
                    base: 0,
                    bound: 1,
                    flags: PmpFlags::ACK,
                },
                &s_secure,
            );
        }
        cache.nack_all();
        for i in 0..PMP_ENTRIES {
            assert!(!cache.get_entry(i).flags.contains(PmpFlags::ACK));
        }
    }

    #[test]
    fn supervisor_can_read_write_anything() {
        let cache = PmpCache::new();
        assert!(cache.check(0xdead_beef, 8, AccessType::Load, Privilege::Supervisor, SecurityLevel::Secure));
        assert!(cache.check(0xdead_beef, 8, AccessType::Store, Privilege::Supervisor, SecurityLevel::Normal));
    }

    #[test]
    fn s_secure_fetch_requires_st_entry() {
        let mut cache = PmpCache::new();
        let s_secure = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        assert!(!cache.check(0x1000, 4, AccessType::Fetch, Privilege::Supervisor, SecurityLevel::Secure));

        cache.set_entry(
            0,
            PmpEntry {
                base: 0x1000,
                bound: 0x2000,
                flags: PmpFlags::EXEC | PmpFlags::ST,
            },
            &s_secure,
        );
        assert!(cache.check(0x1000, 4, AccessType::Fetch, Privilege::Supervisor, SecurityLevel::Secure));
    }

    #[test]
    fn user_cannot_enter_st_range() {
        let mut cache = PmpCache::new();
        let s_secure = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        cache.set_entry(
            0,
            PmpEntry {
                base: 0x3000,
                bound: 0x4000,
                flags: PmpFlags::EXEC | PmpFlags::ST,
            },
            &s_secure,
        );
        assert!(!cache.check(0x3000, 4, AccessType::Fetch, Privilege::User, SecurityLevel::Secure));
    }

    #[test]
    fn ut_fetch_requires_t_and_ack() {
        let mut cache = PmpCache::new();
        let s_secure = MockCore::new(Privilege::Supervisor, SecurityLevel::Secure);
        cache.set_entry(
            0,
            PmpEntry {
                base: 0x1000,
                bound: 0x2000,
                flags: PmpFlags::EXEC | PmpFlags::T, // no ACK yet
            },
            &s_secure,
        );
        assert!(!cache.check(0x1000, 4, AccessType::Fetch, Privilege::User, SecurityLevel::Secure));

        cache.set_entry(
            0,
            PmpEntry {
                base: 0x1000,
                bound: 0x2000,
                flags: PmpFlags::EXEC | PmpFlags::T | PmpFlags::ACK,
            },
            &s_secure,
        );
        assert!(cache.check(0x1000, 4, AccessType::Fetch, Privilege::User, SecurityLevel::Secure));
    }

    #[test]
    fn range_math_does_not_overflow_at_reset_bound() {
        let cache = PmpCache::new();
        // base=0, bound=u64::MAX after reset: addr + len would overflow a
        // u64 computation here, which must not panic or misfire the range
        // check. The permissive reset entry still covers the access.
        assert!(cache.check(u64::MAX - 1, 2, AccessType::Load, Privilege::User, SecurityLevel::Normal));
    }

    #[test]
    fn m_mode_always_bypasses() {
        let mut cache = PmpCache::new();
        let s_normal = MockCore::new(Privilege::Supervisor, SecurityLevel::Normal);
        // Even an entry-less cache with everything denied for U/S-Secure
        // must still allow M.
        cache.set_entry(
            0,
            PmpEntry {
                base: 0,
                bound: 0,
                flags: PmpFlags::empty(),
            },
            &s_normal,
        );
        assert!(cache.check(0x1234, 4, AccessType::Fetch, Privilege::Machine, SecurityLevel::Secure));
    }
}
