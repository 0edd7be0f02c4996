//! Register allocation for the code generator.
//!
//! The target VM has ten allocatable registers and no callee-managed
//! spilling, so the allocator is deliberately simple: a bitmap of
//! registers currently holding live values (`active`) and a bitmap of
//! registers whose values have been saved to their reserved stack slots
//! (`spilled`). When the pool runs dry, the highest-numbered active
//! register is spilled and handed out; freeing a spilled register
//! reloads the saved value instead of returning the register to the
//! pool.
//!
//! The allocator does not know which values live where; it only emits
//! spill stores and reloads through the caller-supplied [`SpillOps`],
//! which writes the actual instructions. Each register has a statically
//! assigned spill slot, so a register can be spilled at most once at a
//! time: a register that is both active and spilled is unavailable.

use crate::bpf::Reg;
use crate::{DifError, DifResult};

/// Emits the spill store and reload instructions on behalf of the
/// allocator.
pub trait SpillOps {
    /// Save `reg` to its reserved stack slot.
    fn spill_store(&mut self, reg: Reg);
    /// Restore `reg` from its reserved stack slot.
    fn spill_load(&mut self, reg: Reg);
}

/// The register allocator.
#[derive(Clone, Debug)]
pub struct RegSet {
    size: u8,
    active: u16,
    spilled: u16,
}

impl RegSet {
    /// Create an allocator over registers `r0` through `r{nregs}`.
    ///
    /// `nregs` counts the general-purpose registers excluding `r0`,
    /// which is always part of the set (it carries call results).
    pub fn new(nregs: u8) -> Self {
        let size = nregs + 1;
        assert!(size <= 16, "register file too large for the bitmaps");
        Self {
            size,
            active: 0,
            spilled: 0,
        }
    }

    /// An allocator for the canonical ten-register target.
    pub fn target() -> Self {
        Self::new(Reg::NUM_GPRS - 1)
    }

    /// Release every register and forget all spills.
    pub fn reset(&mut self) {
        self.active = 0;
        self.spilled = 0;
    }

    fn bit(reg: Reg) -> u16 {
        1 << reg.num()
    }

    /// Is `reg` currently allocated?
    pub fn is_active(&self, reg: Reg) -> bool {
        self.active & Self::bit(reg) != 0
    }

    /// Has `reg` been spilled to its stack slot?
    pub fn is_spilled(&self, reg: Reg) -> bool {
        self.spilled & Self::bit(reg) != 0
    }

    /// Allocate any free register, preferring the highest-numbered one.
    ///
    /// If every register is active, the highest-numbered unspilled
    /// register is saved through `spill.spill_store` and reused. Fails
    /// only when every register is active *and* spilled.
    pub fn alloc(&mut self, spill: &mut dyn SpillOps) -> DifResult<Reg> {
        for n in (0..self.size).rev() {
            let reg = Reg::new(n);
            if !self.is_active(reg) {
                self.active |= Self::bit(reg);
                return Ok(reg);
            }
        }

        for n in (0..self.size).rev() {
            let reg = Reg::new(n);
            if !self.is_spilled(reg) {
                spill.spill_store(reg);
                self.spilled |= Self::bit(reg);
                return Ok(reg);
            }
        }

        Err(DifError::RegistersExhausted)
    }

    /// Allocate a specific register, spilling its current holder if
    /// necessary. Fails if the register is already spilled.
    pub fn xalloc(&mut self, reg: Reg, spill: &mut dyn SpillOps) -> DifResult<()> {
        debug_assert!(reg.num() < self.size);
        if self.is_active(reg) {
            if self.is_spilled(reg) {
                return Err(DifError::RegisterUnavailable(reg));
            }
            spill.spill_store(reg);
            self.spilled |= Self::bit(reg);
        }
        self.active |= Self::bit(reg);
        Ok(())
    }

    /// Reserve `r1` through `r5` as a group for a call's arguments.
    ///
    /// On failure, registers already taken by this call are released
    /// again and the error is returned.
    pub fn xalloc_args(&mut self, spill: &mut dyn SpillOps) -> DifResult<()> {
        for n in 1..=5u8 {
            if let Err(err) = self.xalloc(Reg::new(n), spill) {
                for taken in (1..n).rev() {
                    self.free(Reg::new(taken), spill);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release `r1` through `r5` after a call.
    pub fn free_args(&mut self, spill: &mut dyn SpillOps) {
        for n in 1..=5u8 {
            self.free(Reg::new(n), spill);
        }
    }

    /// Release `reg`. If it was spilled, the saved value is reloaded
    /// and the register stays active on behalf of its original holder;
    /// otherwise it returns to the pool.
    pub fn free(&mut self, reg: Reg, spill: &mut dyn SpillOps) {
        debug_assert!(reg.num() < self.size);
        debug_assert!(self.is_active(reg), "freeing unallocated register {reg}");

        if self.is_spilled(reg) {
            spill.spill_load(reg);
            self.spilled &= !Self::bit(reg);
            return;
        }
        self.active &= !Self::bit(reg);
    }

    /// One-character-per-register allocation state, for debug output:
    /// `x` active, `s` spilled, `.` free.
    pub fn dump(&self) -> String {
        (0..self.size)
            .map(|n| {
                let reg = Reg::new(n);
                if self.is_active(reg) && !self.is_spilled(reg) {
                    'x'
                } else if self.is_spilled(reg) {
                    's'
                } else {
                    '.'
                }
            })
            .collect()
    }
}

impl Default for RegSet {
    fn default() -> Self {
        Self::target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        stores: Vec<Reg>,
        loads: Vec<Reg>,
    }

    impl SpillOps for Trace {
        fn spill_store(&mut self, reg: Reg) {
            self.stores.push(reg);
        }
        fn spill_load(&mut self, reg: Reg) {
            self.loads.push(reg);
        }
    }

    #[test]
    fn alloc_prefers_high_registers() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();
        assert_eq!(rs.alloc(&mut t).unwrap(), Reg::R9);
        assert_eq!(rs.alloc(&mut t).unwrap(), Reg::R8);
        assert!(t.stores.is_empty());
    }

    #[test]
    fn exhaustion_spills_then_fails() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();
        for _ in 0..10 {
            rs.alloc(&mut t).unwrap();
        }
        assert!(t.stores.is_empty());

        // Pool dry: the next ten allocations spill r9 down to r0.
        for expect in (0..10).rev() {
            let reg = rs.alloc(&mut t).unwrap();
            assert_eq!(reg, Reg::new(expect));
        }
        assert_eq!(t.stores.len(), 10);

        assert!(matches!(
            rs.alloc(&mut t),
            Err(DifError::RegistersExhausted)
        ));
    }

    #[test]
    fn free_of_spilled_register_reloads() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();
        for _ in 0..10 {
            rs.alloc(&mut t).unwrap();
        }
        let reg = rs.alloc(&mut t).unwrap(); // spills r9
        assert_eq!(t.stores, vec![Reg::R9]);

        // The inner user frees the register: the spilled value comes
        // back and r9 remains active for its original holder.
        rs.free(reg, &mut t);
        assert_eq!(t.loads, vec![Reg::R9]);
        assert!(rs.is_active(Reg::R9));
        assert!(!rs.is_spilled(Reg::R9));

        // The original holder can now free it for real.
        rs.free(reg, &mut t);
        assert!(!rs.is_active(Reg::R9));
    }

    #[test]
    fn xalloc_specific_register() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();
        rs.xalloc(Reg::R3, &mut t).unwrap();
        assert!(rs.is_active(Reg::R3));

        // Second request spills the holder.
        rs.xalloc(Reg::R3, &mut t).unwrap();
        assert_eq!(t.stores, vec![Reg::R3]);

        // Third request: active and spilled, unavailable.
        assert!(matches!(
            rs.xalloc(Reg::R3, &mut t),
            Err(DifError::RegisterUnavailable(_))
        ));
    }

    #[test]
    fn xalloc_args_unwinds_on_failure() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();

        // Make r3 unavailable: active and spilled.
        rs.xalloc(Reg::R3, &mut t).unwrap();
        rs.xalloc(Reg::R3, &mut t).unwrap();

        assert!(rs.xalloc_args(&mut t).is_err());
        // r1 and r2 were taken then released again.
        assert!(!rs.is_active(Reg::R1));
        assert!(!rs.is_active(Reg::R2));
        // r3 still held by its two owners.
        assert!(rs.is_active(Reg::R3));
        assert!(rs.is_spilled(Reg::R3));
    }

    #[test]
    fn arg_group_roundtrip() {
        let mut rs = RegSet::target();
        let mut t = Trace::default();
        rs.xalloc_args(&mut t).unwrap();
        for n in 1..=5u8 {
            assert!(rs.is_active(Reg::new(n)));
        }
        rs.free_args(&mut t);
        for n in 1..=5u8 {
            assert!(!rs.is_active(Reg::new(n)));
        }
    }

    #[test]
    fn dump_shows_state() {
        let mut rs = RegSet::new(3);
        let mut t = Trace::default();
        rs.xalloc(Reg::R1, &mut t).unwrap();
        rs.xalloc(Reg::R1, &mut t).unwrap();
        rs.xalloc(Reg::R2, &mut t).unwrap();
        assert_eq!(rs.dump(), ".sx.");
    }
}
