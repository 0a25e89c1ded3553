/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    bytes
        .iter()
        .map(|value| hex::encode_upper([*value]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Implements the bitwise operators for a transparent bitmask newtype.
macro_rules! bitmask_ops {
    ($mask:ident, $repr:ty) => {
        impl $mask {
            /// Mask with no bits set.
            pub const EMPTY: Self = Self(0);

            /// Returns the raw bit pattern.
            #[must_use]
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Returns `true` when no bits are set.
            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Returns `true` when every bit of `other` is also set in `self`.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns `true` when `self` and `other` share at least one bit.
            #[must_use]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Bits set in either mask; usable in constants.
            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Sets every bit of `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears every bit of `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $mask {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $mask {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $mask {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl std::ops::BitAndAssign for $mask {
            fn bitand_assign(&mut self, rhs: Self) {
                self.0 &= rhs.0;
            }
        }

        impl std::ops::Not for $mask {
            type Output = Self;

            fn not(self) -> Self {
                Self(!self.0)
            }
        }
    };
}

pub(crate) use bitmask_ops;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    struct TestMask(u8);

    bitmask_ops!(TestMask, u8);

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_uppercase_pairs() {
        assert_eq!("01 00 A1 FF", format_hex(&[0x01, 0x00, 0xA1, 0xFF]));
    }

    #[test]
    fn bitmask_contains_requires_every_bit() {
        let mask = TestMask(0b0110);

        assert!(mask.contains(TestMask(0b0100)));
        assert!(!mask.contains(TestMask(0b0101)));
        assert!(mask.intersects(TestMask(0b0101)));
    }

    #[test]
    fn bitmask_insert_and_remove_round_trip_bits() {
        let mut mask = TestMask::EMPTY;
        mask.insert(TestMask(0b1001));
        mask.remove(TestMask(0b0001));

        assert_eq!(TestMask(0b1000), mask);
        assert_eq!(TestMask(0b1000), mask & !TestMask(0b0001));
    }
}
