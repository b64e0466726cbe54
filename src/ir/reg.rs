//! Virtual and physical registers.
//!
//! A `Vreg` names either a physical register (numbers below `VIRT_BASE`) or a
//! virtual register handed out by the `Vunit`. Register allocation rewrites
//! every virtual `Vreg` operand to a physical one. `RegSet` is a bit set of
//! physical registers with the usual set algebra; it is how the ABI describes
//! register classes and how instructions describe implicit register usage.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};
use cranelift_entity::{entity_impl, EntityRef};

/// Number of general-purpose registers.
pub const NUM_GP: u8 = 16;
/// Number of SIMD registers.
pub const NUM_SIMD: u8 = 16;
/// Total number of physical registers, including the status-flags register.
pub const NUM_PHYS: u8 = NUM_GP + NUM_SIMD + 1;

/// First virtual register number. Vreg numbers below this name physical
/// registers directly, so a physical register can appear anywhere a virtual
/// one can.
pub const VIRT_BASE: u32 = 64;

/// A virtual or physical register operand.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vreg(u32);
entity_impl!(Vreg, "v");

impl Vreg {
    /// Does this Vreg name a physical register?
    pub fn is_phys(self) -> bool {
        self.0 < VIRT_BASE
    }

    /// The physical register this Vreg names, if it names one.
    pub fn phys(self) -> Option<PhysReg> {
        if self.is_phys() {
            Some(PhysReg::from_index(self.0 as usize))
        } else {
            None
        }
    }

    /// The first virtual (non-physical) register number.
    pub fn first_virtual() -> Vreg {
        Vreg(VIRT_BASE)
    }
}

impl From<PhysReg> for Vreg {
    fn from(r: PhysReg) -> Vreg {
        Vreg::new(r.index())
    }
}

/// A physical register: 16 general-purpose, 16 SIMD, and the singleton
/// status-flags register, in that index order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(u8);

impl PhysReg {
    /// Number of physical registers.
    pub const COUNT: usize = NUM_PHYS as usize;

    /// The status-flags register.
    pub const SF: PhysReg = PhysReg(NUM_GP + NUM_SIMD);

    /// The `n`th general-purpose register.
    pub fn gp(n: u8) -> PhysReg {
        debug_assert!(n < NUM_GP);
        PhysReg(n)
    }

    /// The `n`th SIMD register.
    pub fn simd(n: u8) -> PhysReg {
        debug_assert!(n < NUM_SIMD);
        PhysReg(NUM_GP + n)
    }

    /// Recover a register from its dense index.
    pub fn from_index(i: usize) -> PhysReg {
        debug_assert!(i < Self::COUNT);
        PhysReg(i as u8)
    }

    /// Dense index, suitable for array maps.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Is this a general-purpose register?
    pub fn is_gp(self) -> bool {
        self.0 < NUM_GP
    }

    /// Is this a SIMD register?
    pub fn is_simd(self) -> bool {
        self.0 >= NUM_GP && self.0 < NUM_GP + NUM_SIMD
    }

    /// Is this the status-flags register?
    pub fn is_sf(self) -> bool {
        self == Self::SF
    }
}

static GP_NAMES: [&str; NUM_GP as usize] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_gp() {
            write!(f, "%{}", GP_NAMES[self.index()])
        } else if self.is_simd() {
            write!(f, "%xmm{}", self.0 - NUM_GP)
        } else {
            write!(f, "%sf")
        }
    }
}

impl fmt::Debug for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Well-known registers.
pub mod regs {
    use super::PhysReg;

    /// The stack pointer.
    pub const RSP: PhysReg = PhysReg(4);
    /// The frame pointer.
    pub const RBP: PhysReg = PhysReg(5);
    /// Conventional scratch for breaking parallel-copy cycles.
    pub const XMM15: PhysReg = PhysReg(super::NUM_GP + 15);
}

/// Operand width/kind tag. The register class and spill width of an operand
/// are derived from this, not from the `Vreg` itself.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegClass {
    /// Any allocatable register.
    Any,
    /// 8-bit general-purpose.
    Gpr8,
    /// 16-bit general-purpose.
    Gpr16,
    /// 32-bit general-purpose.
    Gpr32,
    /// 64-bit general-purpose.
    Gpr64,
    /// Scalar double in a SIMD register.
    SimdDbl,
    /// Full-width SIMD value; occupies two spill slots.
    Simd128,
    /// The status-flags register.
    Sf,
}

impl RegClass {
    /// Does a value of this class occupy two spill slots?
    pub fn is_wide(self) -> bool {
        matches!(self, RegClass::Simd128)
    }
}

/// A set of physical registers.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct RegSet(u64);

impl RegSet {
    /// The empty set.
    pub const fn empty() -> RegSet {
        RegSet(0)
    }

    /// All general-purpose registers.
    pub const fn all_gp() -> RegSet {
        RegSet((1 << NUM_GP) - 1)
    }

    /// All SIMD registers.
    pub const fn all_simd() -> RegSet {
        RegSet(((1 << NUM_SIMD) - 1) << NUM_GP)
    }

    /// The set containing only `r`.
    pub fn single(r: PhysReg) -> RegSet {
        RegSet(1 << r.index())
    }

    /// Add `r` to the set.
    pub fn add(&mut self, r: PhysReg) {
        self.0 |= 1 << r.index();
    }

    /// Remove `r` from the set.
    pub fn remove(&mut self, r: PhysReg) {
        self.0 &= !(1 << r.index());
    }

    /// Is `r` a member?
    pub fn contains(self, r: PhysReg) -> bool {
        self.0 & (1 << r.index()) != 0
    }

    /// Is the set empty?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate members in index order.
    pub fn iter(self) -> RegSetIter {
        RegSetIter(self.0)
    }
}

impl BitOr for RegSet {
    type Output = RegSet;
    fn bitor(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegSet {
    fn bitor_assign(&mut self, rhs: RegSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegSet {
    type Output = RegSet;
    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & rhs.0)
    }
}

impl BitAndAssign for RegSet {
    fn bitand_assign(&mut self, rhs: RegSet) {
        self.0 &= rhs.0;
    }
}

impl Sub for RegSet {
    type Output = RegSet;
    fn sub(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & !rhs.0)
    }
}

impl SubAssign for RegSet {
    fn sub_assign(&mut self, rhs: RegSet) {
        self.0 &= !rhs.0;
    }
}

impl IntoIterator for RegSet {
    type Item = PhysReg;
    type IntoIter = RegSetIter;
    fn into_iter(self) -> RegSetIter {
        self.iter()
    }
}

/// Iterator over the members of a `RegSet`, lowest index first.
pub struct RegSetIter(u64);

impl Iterator for RegSetIter {
    type Item = PhysReg;

    fn next(&mut self) -> Option<PhysReg> {
        if self.0 == 0 {
            return None;
        }
        let i = self.0.trailing_zeros() as usize;
        // Clear the lowest set bit so we won't find it again.
        self.0 &= self.0 - 1;
        Some(PhysReg::from_index(i))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for RegSetIter {}

impl fmt::Display for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut sep = "";
        for r in self.iter() {
            write!(f, "{}{}", sep, r)?;
            sep = ", ";
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vreg_phys_boundary() {
        let rax = Vreg::from(PhysReg::gp(0));
        assert!(rax.is_phys());
        assert_eq!(rax.phys(), Some(PhysReg::gp(0)));

        let v = Vreg::first_virtual();
        assert!(!v.is_phys());
        assert_eq!(v.phys(), None);

        assert!(Vreg::from(PhysReg::SF).is_phys());
    }

    #[test]
    fn regset_algebra() {
        let mut s = RegSet::empty();
        assert!(s.is_empty());
        s.add(PhysReg::gp(3));
        s.add(PhysReg::simd(2));
        assert_eq!(s.len(), 2);
        assert!(s.contains(PhysReg::gp(3)));
        assert!(!s.contains(PhysReg::gp(2)));

        let t = RegSet::single(PhysReg::gp(3));
        assert_eq!(s & t, t);
        assert_eq!(s - t, RegSet::single(PhysReg::simd(2)));
        assert_eq!(t | RegSet::single(PhysReg::simd(2)), s);

        s.remove(PhysReg::gp(3));
        assert!(!s.contains(PhysReg::gp(3)));
    }

    #[test]
    fn regset_iteration() {
        let s = RegSet::all_gp();
        assert_eq!(s.len(), NUM_GP as usize);
        let regs: Vec<_> = s.iter().collect();
        assert_eq!(regs.len(), NUM_GP as usize);
        assert_eq!(regs[0], PhysReg::gp(0));
        assert_eq!(regs[15], PhysReg::gp(15));

        assert!(RegSet::all_gp().iter().all(|r| r.is_gp()));
        assert!(RegSet::all_simd().iter().all(|r| r.is_simd()));
        assert!((RegSet::all_gp() & RegSet::all_simd()).is_empty());
    }
}
