use core::fmt;

/// Creates an enum that can be converted from and to a primitive type, with invalid values becoming
/// a catch-all `Unknown` variant.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        $v:vis enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr $(,)*
            ),*
        }
    ) => {
        $( #[$enum_attr] )*
        $v enum $name {
            $(
              $( #[$variant_attr] )*
              $variant,
            )*
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value, )*
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

/// Returns an iterator over the positions of all set bits in `bitmap`, in ascending order.
///
/// Bit 0 of byte 0 is position 0, bit 7 of byte 0 is position 7, bit 0 of byte 1 is position 8,
/// and so on. This is the layout of all channel maps used on the air.
pub fn set_bits(bitmap: &[u8]) -> impl Iterator<Item = u8> + '_ {
    bitmap.iter().enumerate().flat_map(|(byte_index, byte)| {
        (0..8u8).filter_map(move |bit| {
            if byte & (1 << bit) != 0 {
                Some(byte_index as u8 * 8 + bit)
            } else {
                None
            }
        })
    })
}

/// XORs `src` into `dest`, byte by byte.
pub fn xor_into(dest: &mut [u8; 16], src: &[u8; 16]) {
    for (d, s) in dest.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// `Debug`-formats its contents as a hexadecimal byte slice.
#[derive(Copy, Clone)]
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

/// `Debug`-formats its contents in hexadecimal.
#[derive(Copy, Clone)]
pub struct Hex<T>(pub T)
where
    T: fmt::LowerHex;

impl<T: fmt::LowerHex> fmt::Debug for Hex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bits_ascending() {
        let bits: Vec<u8> = set_bits(&[0x05, 0x00, 0x80]).collect();
        assert_eq!(bits, vec![0, 2, 23]);
        assert_eq!(set_bits(&[]).count(), 0);
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(format!("{:?}", HexSlice(&[0x01u8, 0xab])), "[01, ab]");
        assert_eq!(format!("{:?}", Hex(0x8e89_bed6u32)), "0x8e89bed6");
    }
}
