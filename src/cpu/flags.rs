//! The 16-bit FLAGS register. Stored as a single `u16`, never exposed as
//! individual booleans — the reserved bits matter, and callers only ever
//! get/set a named flag through [`Flags::get`]/[`Flags::set`].

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Flags: u16 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

/// Bits fixed on real 8086 silicon: bit 1 always reads 1, bits 12-15 always
/// read 1 (there is no NT/IOPL on an 8086). Everything else reads 0 unless a
/// named flag above is set.
const FIXED_ONE_BITS: u16 = 0b1111_0000_0000_0010;

impl Flags {
    pub fn from_word(word: u16) -> Self {
        Flags::from_bits_truncate(word)
    }

    /// The 16-bit value as it would actually appear in a PUSHF/LAHF, with
    /// the fixed bits forced on.
    pub fn to_word(self) -> u16 {
        self.bits() | FIXED_ONE_BITS
    }

    pub fn get(&self, flag: Flags) -> bool {
        self.contains(flag)
    }

    pub fn set_flag(&mut self, flag: Flags, value: bool) {
        self.set(flag, value);
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::from_bits_truncate(FIXED_ONE_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_word() {
        let mut f = Flags::default();
        f.set_flag(Flags::ZF, true);
        f.set_flag(Flags::CF, true);
        let word = f.to_word();
        assert_eq!(word & 0xF000, 0xF000);
        assert_eq!(word & 0b10, 0b10);
        let back = Flags::from_word(word);
        assert!(back.get(Flags::ZF));
        assert!(back.get(Flags::CF));
        assert!(!back.get(Flags::OF));
    }
}
