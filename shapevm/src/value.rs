use crate::heap::CellId;

/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const IMMEDIATE_TAG: u64 = 0b11;

const IMMEDIATE_SHIFT: u64 = 2;

/// Largest integer representable as a fixnum.
pub const FIXNUM_MAX: i64 = (1i64 << 62) - 1;
/// Smallest integer representable as a fixnum.
pub const FIXNUM_MIN: i64 = -(1i64 << 62);

/// A tagged 64-bit value.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01`: index of a cell in the [`Heap`](crate::Heap).
/// - **Immediate**: `...XXXX11`: `undefined`, `null`, booleans and the
///   empty marker used for uninitialised registers and holes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const UNDEFINED: Self = Self::immediate(0);
    pub const NULL: Self = Self::immediate(1);
    pub const FALSE: Self = Self::immediate(2);
    pub const TRUE: Self = Self::immediate(3);
    /// Not a language value: marks registers that were never written
    /// (lazily created activations/arguments) and deleted argument slots.
    pub const EMPTY: Self = Self::immediate(4);

    const fn immediate(payload: u64) -> Self {
        Self((payload << IMMEDIATE_SHIFT) | IMMEDIATE_TAG)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!((FIXNUM_MIN..=FIXNUM_MAX).contains(&n), "fixnum overflow: {n}");
        Self((n << 1) as u64)
    }

    /// Encode `n` as a fixnum if it fits.
    #[inline]
    pub fn try_from_i64(n: i64) -> Option<Self> {
        (FIXNUM_MIN..=FIXNUM_MAX).contains(&n).then(|| Self::from_i64(n))
    }

    #[inline(always)]
    pub fn as_i64(self) -> Option<i64> {
        self.is_fixnum().then_some((self.0 as i64) >> 1)
    }

    /// Fixnum payload without the tag check.
    #[inline(always)]
    pub fn to_i64(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub const fn from_cell(cell: CellId) -> Self {
        Self(((cell.index() as u64) << IMMEDIATE_SHIFT) | REF_TAG)
    }

    #[inline(always)]
    pub const fn as_cell(self) -> Option<CellId> {
        if self.is_ref() {
            Some(CellId::from_index((self.0 >> IMMEDIATE_SHIFT) as u32))
        } else {
            None
        }
    }

    // ── Immediates ─────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        self.0 & TAG_MASK == IMMEDIATE_TAG
    }

    #[inline(always)]
    pub fn from_bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    #[inline(always)]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::TRUE => Some(true),
            Self::FALSE => Some(false),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_undefined(self) -> bool {
        self == Self::UNDEFINED
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline(always)]
    pub fn is_undefined_or_null(self) -> bool {
        self == Self::UNDEFINED || self == Self::NULL
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::from_bool(b)
    }
}

impl From<CellId> for Value {
    fn from(cell: CellId) -> Self {
        Self::from_cell(cell)
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_fixnum() {
            write!(f, "Fixnum({})", self.to_i64())
        } else if let Some(cell) = self.as_cell() {
            write!(f, "Ref({})", cell.index())
        } else {
            match *self {
                Self::UNDEFINED => write!(f, "Undefined"),
                Self::NULL => write!(f, "Null"),
                Self::TRUE => write!(f, "True"),
                Self::FALSE => write!(f, "False"),
                Self::EMPTY => write!(f, "Empty"),
                _ => write!(f, "Immediate(0x{:016x})", self.0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, FIXNUM_MAX, FIXNUM_MIN] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert!(!v.is_immediate());
            assert_eq!(v.as_i64(), Some(n));
        }
    }

    #[test]
    fn fixnum_zero_is_zero_bits() {
        assert_eq!(Value::from_i64(0).raw(), 0);
    }

    #[test]
    fn out_of_range_integers_are_rejected() {
        assert!(Value::try_from_i64(FIXNUM_MAX + 1).is_none());
        assert!(Value::try_from_i64(FIXNUM_MIN - 1).is_none());
    }

    #[test]
    fn cell_tagging() {
        let cell = CellId::from_index(77);
        let v = Value::from_cell(cell);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert_eq!(v.as_cell(), Some(cell));
    }

    #[test]
    fn immediates_are_distinct() {
        let all = [
            Value::UNDEFINED,
            Value::NULL,
            Value::TRUE,
            Value::FALSE,
            Value::EMPTY,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_immediate());
            assert!(a.as_cell().is_none());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(Value::from_bool(true).as_bool(), Some(true));
        assert_eq!(Value::NULL.as_bool(), None);
    }
}
