//! Util Module - Shared Utilities
//!
//! Constants and small address helpers used by the tables and the verifier.

/// Constants for the collector substrate
pub mod constants {
    /// Machine word size in bytes
    pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
    /// Bits per machine word
    pub const WORD_BITS: usize = usize::BITS as usize;
    /// log2(WORD_SIZE)
    pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();

    /// log2 of the card / chunk granule
    pub const GRANULE_SHIFT: u32 = 9;
    /// Card and chunk granule: 512 bytes
    pub const GRANULE_SIZE: usize = 1 << GRANULE_SHIFT;
}

/// Round `value` up to a multiple of `alignment` (power of two)
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of granules needed to cover `size` bytes
#[inline]
pub const fn granules_for(size: usize) -> usize {
    size.div_ceil(constants::GRANULE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::constants::*;
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(0x1234, 0x100), 0x1300);
        assert_eq!(align_up(0x1200, 0x100), 0x1200);
    }

    #[test]
    fn test_granules_for() {
        assert_eq!(granules_for(0), 0);
        assert_eq!(granules_for(1), 1);
        assert_eq!(granules_for(GRANULE_SIZE), 1);
        assert_eq!(granules_for(2000), 4);
        assert_eq!(granules_for(4096), 8);
    }
}
