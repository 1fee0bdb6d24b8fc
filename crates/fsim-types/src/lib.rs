#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of wordline layers in a NAND block. Physical page `p` of a block
/// sits on layer `p % WORDLINE_LAYERS`; pages on the same layer share
/// retention behavior and are refreshed together.
pub const WORDLINE_LAYERS: u32 = 64;

/// Logical page number, the host-visible address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lpn(pub u64);

/// Physical block identity, stable for the block's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Physical location of a single sub-page: block plus page-in-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysAddr {
    pub block: BlockId,
    pub page: u32,
}

/// Half-open range of logical pages `[slpn, slpn + nlp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpnRange {
    pub slpn: u64,
    pub nlp: u64,
}

impl LpnRange {
    #[must_use]
    pub fn new(slpn: u64, nlp: u64) -> Self {
        Self { slpn, nlp }
    }

    #[must_use]
    pub fn contains(self, lpn: Lpn) -> bool {
        lpn.0 >= self.slpn && lpn.0 - self.slpn < self.nlp
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.nlp == 0
    }
}

/// Wordline layer of a physical page.
#[must_use]
pub fn layer_of(page: u32) -> u32 {
    page % WORDLINE_LAYERS
}

/// Packed `(block, layer)` key used by the refresh table and Bloom filters.
#[must_use]
pub fn layer_key(block: BlockId, layer: u32) -> u64 {
    (u64::from(block.0) << 32) | u64::from(layer)
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    #[error("io bitmap width {width} out of range 1..=64")]
    InvalidWidth { width: u32 },
}

/// Fixed-width bitset over the IO units of one physical page.
///
/// A page is split into `width` independently mappable sub-pages
/// (random-tweak mode); the width is bounded by the single backing word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBitmap {
    bits: u64,
    width: u32,
}

impl IoBitmap {
    /// Create an empty bitmap of `width` IO units.
    pub fn new(width: u32) -> Result<Self, BitmapError> {
        if width == 0 || width > 64 {
            return Err(BitmapError::InvalidWidth { width });
        }
        Ok(Self { bits: 0, width })
    }

    /// Create a bitmap with every IO unit set.
    pub fn full(width: u32) -> Result<Self, BitmapError> {
        let mut map = Self::new(width)?;
        map.set_all();
        Ok(map)
    }

    #[must_use]
    pub fn width(self) -> u32 {
        self.width
    }

    #[must_use]
    fn mask(self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1_u64 << self.width) - 1
        }
    }

    #[must_use]
    pub fn test(self, unit: u32) -> bool {
        unit < self.width && (self.bits >> unit) & 1 == 1
    }

    pub fn set(&mut self, unit: u32) {
        if unit < self.width {
            self.bits |= 1 << unit;
        }
    }

    pub fn clear(&mut self, unit: u32) {
        if unit < self.width {
            self.bits &= !(1 << unit);
        }
    }

    pub fn set_all(&mut self) {
        self.bits = self.mask();
    }

    pub fn reset(&mut self) {
        self.bits = 0;
    }

    /// Invert every unit within the width.
    pub fn flip(&mut self) {
        self.bits = !self.bits & self.mask();
    }

    #[must_use]
    pub fn any(self) -> bool {
        self.bits != 0
    }

    #[must_use]
    pub fn none(self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub fn all(self) -> bool {
        self.bits == self.mask()
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.bits.count_ones()
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    pub fn union_with(&mut self, other: Self) {
        self.bits |= other.bits & self.mask();
    }

    /// Indices of the set units, ascending.
    pub fn ones(self) -> impl Iterator<Item = u32> {
        (0..self.width).filter(move |&u| (self.bits >> u) & 1 == 1)
    }
}

impl fmt::Display for Lpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block, self.page)
    }
}

/// Convert whole seconds of simulated time to nanosecond ticks.
#[must_use]
pub fn secs_to_ns(secs: u64) -> u64 {
    secs.saturating_mul(1_000_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_key_packing() {
        let key = layer_key(BlockId(7), 13);
        assert_eq!(key >> 32, 7);
        assert_eq!(key & 0xFFFF_FFFF, 13);
        assert_eq!(layer_of(13), 13);
        assert_eq!(layer_of(64), 0);
        assert_eq!(layer_of(200), 200 % 64);
    }

    #[test]
    fn test_lpn_range() {
        let r = LpnRange::new(10, 5);
        assert!(!r.contains(Lpn(9)));
        assert!(r.contains(Lpn(10)));
        assert!(r.contains(Lpn(14)));
        assert!(!r.contains(Lpn(15)));
        assert!(LpnRange::new(0, 0).is_empty());
    }

    #[test]
    fn test_bitmap_width_validation() {
        assert!(IoBitmap::new(0).is_err());
        assert!(IoBitmap::new(65).is_err());
        assert!(IoBitmap::new(1).is_ok());
        assert!(IoBitmap::new(64).is_ok());
    }

    #[test]
    fn test_bitmap_set_clear_test() {
        let mut m = IoBitmap::new(4).unwrap();
        assert!(m.none());
        m.set(0);
        m.set(3);
        assert!(m.test(0));
        assert!(!m.test(1));
        assert!(m.test(3));
        assert_eq!(m.count(), 2);
        m.clear(0);
        assert!(!m.test(0));
        // Out-of-width indices are ignored, not errors.
        m.set(17);
        assert_eq!(m.count(), 1);
        assert!(!m.test(17));
    }

    #[test]
    fn test_bitmap_full_and_flip() {
        let mut m = IoBitmap::full(4).unwrap();
        assert!(m.all());
        assert_eq!(m.count(), 4);
        m.clear(2);
        assert!(!m.all());
        m.flip();
        assert!(m.test(2));
        assert!(!m.test(0));
        assert_eq!(m.count(), 1);
    }

    #[test]
    fn test_bitmap_width_64() {
        let mut m = IoBitmap::full(64).unwrap();
        assert!(m.all());
        assert_eq!(m.count(), 64);
        m.flip();
        assert!(m.none());
    }

    #[test]
    fn test_bitmap_overlap_union() {
        let mut a = IoBitmap::new(8).unwrap();
        let mut b = IoBitmap::new(8).unwrap();
        a.set(1);
        b.set(2);
        assert!(!a.overlaps(b));
        b.set(1);
        assert!(a.overlaps(b));
        a.union_with(b);
        assert_eq!(a.count(), 2);
        assert_eq!(a.ones().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_secs_to_ns() {
        assert_eq!(secs_to_ns(0), 0);
        assert_eq!(secs_to_ns(3), 3_000_000_000);
        assert_eq!(secs_to_ns(u64::MAX), u64::MAX);
    }
}
