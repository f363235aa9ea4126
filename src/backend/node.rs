use bitflags::bitflags;

use crate::api::*;

// The 8-byte header tags every allocation in the file. Byte 4 is the pivot:
// its width-type field decides whether the rest of the header is read in the
// legacy layout (capacity in bytes 0-2, count big-endian in bytes 5-7) or in
// the extended layout (capacity word in bytes 0-1, encoding tag in byte 5).
//
// Encodings:     bytes:
// name:       |  b0   |  b1   |  b2   |  b3   | b4:0-2 | b4:3-4 | b4:5-7 |  b5   |  b6   |  b7  |
// legacy      |  capacity             |   -   | width  | wtype  | flags  |        count         |
// Packed      |  capacity     |   -   | width | flags2 | wtype  | flags  | enc   |    count     |
// Flex        |  capacity     |  w_A + cnt_A  | flags2 | wtype  | flags  | enc   | w_B + cnt_B  |
//
// For Flex each 16-bit word packs 6 bits of (width - 1) above 10 bits of
// count, so Flex sub-arrays hold at most 1023 elements of 1..=64 bits.

bitflags! {
    /// The three context bits in the top of header byte 4.
    pub struct NodeFlags: u8 {
        const CONTEXT      = 1;
        const HAS_REFS     = 2;
        const INNER_BPTREE = 4;
    }
}

/// Width-type selector in byte 4 bits 3-4.
pub const WTYPE_BITS: u8 = 0;
pub const WTYPE_MULTIPLY: u8 = 1;
pub const WTYPE_IGNORE: u8 = 2;
pub const WTYPE_EXTEND: u8 = 3;

/// Memory layouts a node can carry. The first three coincide numerically with
/// their width-type; the extended ones are named by byte 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `count` elements of `width` bits, width a power of two up to 64.
    WTypBits,
    /// `count` elements of `width` bytes.
    WTypMult,
    /// `count` raw bytes.
    WTypIgn,
    /// `count` elements of any width 0..=64 bits (width byte 3, count 16-bit).
    Packed,
    /// two sub-arrays with independent widths and counts.
    Flex,
}

impl Encoding {
    fn extended_tag(self) -> u8 {
        match self {
            Encoding::Packed => 0,
            Encoding::Flex => 2,
            _ => unreachable!("legacy encodings have no extended tag"),
        }
    }
}

/// Namespace for the field accessors. All of them take the node's leading
/// bytes; callers guarantee at least `NODE_HEADER_SIZE` of them.
pub struct NodeHeader;

impl NodeHeader {
    pub fn wtype(h: &[u8]) -> u8 { (h[4] & 0x18) >> 3 }

    pub fn is_extended(h: &[u8]) -> bool { Self::wtype(h) == WTYPE_EXTEND }

    fn set_wtype(h: &mut [u8], wtype: u8) { h[4] = (h[4] & !0x18) | (wtype << 3); }

    /// Decode the encoding, validating byte 5 for extended layouts. This is
    /// the header plausibility gate `translate` relies on.
    pub fn encoding(h: &[u8]) -> Result<Encoding> {
        match Self::wtype(h) {
            WTYPE_BITS => Ok(Encoding::WTypBits),
            WTYPE_MULTIPLY => Ok(Encoding::WTypMult),
            WTYPE_IGNORE => Ok(Encoding::WTypIgn),
            _ => match h[5] {
                0 => Ok(Encoding::Packed),
                2 => Ok(Encoding::Flex),
                _ => Err(Error::CorruptedFile("unknown extended encoding tag")),
            },
        }
    }

    pub fn flags(h: &[u8]) -> NodeFlags { NodeFlags::from_bits_truncate(h[4] >> 5) }

    pub fn set_flags(h: &mut [u8], flags: NodeFlags) {
        h[4] = (h[4] & 0b0001_1111) | (flags.bits() << 5);
    }

    pub fn is_inner_bptree(h: &[u8]) -> bool { h[4] & 0x80 != 0 }

    pub fn has_refs(h: &[u8]) -> bool { h[4] & 0x40 != 0 }

    pub fn context_flag(h: &[u8]) -> bool { h[4] & 0x20 != 0 }

    /// Element width in bits for the legacy layouts: `(1 << (b4 & 7)) >> 1`,
    /// i.e. 0,1,2,4,...,64.
    pub fn width(h: &[u8]) -> u8 {
        debug_assert!(!Self::is_extended(h));
        ((1u16 << (h[4] & 0x07)) >> 1) as u8
    }

    /// Pack a legacy width as log2 + 1 into the low bits of byte 4. Only
    /// powers of two (and 0) are representable here.
    pub fn set_width(h: &mut [u8], width: usize) {
        debug_assert!(!Self::is_extended(h));
        let mut value = width;
        let mut w = 0u8;
        while value != 0 {
            w += 1;
            value >>= 1;
        }
        debug_assert!(w < 8);
        h[4] = (h[4] & !0x07) | w;
    }

    /// Element count for the legacy layouts, big-endian in bytes 5-7.
    pub fn size(h: &[u8]) -> usize {
        debug_assert!(!Self::is_extended(h));
        ((h[5] as usize) << 16) + ((h[6] as usize) << 8) + h[7] as usize
    }

    pub fn set_size(h: &mut [u8], value: usize) {
        debug_assert!(!Self::is_extended(h));
        debug_assert!(value <= MAX_ARRAY_SIZE);
        h[5] = ((value >> 16) & 0xFF) as u8;
        h[6] = ((value >> 8) & 0xFF) as u8;
        h[7] = (value & 0xFF) as u8;
    }

    /// Capacity in bytes, including the header. The legacy layout spends 21
    /// bits shifted by 3; the extended layouts a 16-bit word shifted by 3.
    pub fn capacity(h: &[u8]) -> usize {
        if !Self::is_extended(h) {
            ((h[0] as usize) << 19) + ((h[1] as usize) << 11) + ((h[2] as usize) << 3)
        } else {
            (u16::from_le_bytes([h[0], h[1]]) as usize) << 3
        }
    }

    /// The wtype must already be set so the right field is written.
    pub fn set_capacity(h: &mut [u8], value: usize) {
        debug_assert!(value & 0x7 == 0);
        if !Self::is_extended(h) {
            debug_assert!(value <= 0xFF_FFFF << 3);
            h[0] = ((value >> 19) & 0xFF) as u8;
            h[1] = ((value >> 11) & 0xFF) as u8;
            h[2] = ((value >> 3) & 0xFF) as u8;
        } else {
            debug_assert!(value < (65536 << 3));
            let w = ((value >> 3) as u16).to_le_bytes();
            h[0] = w[0];
            h[1] = w[1];
        }
    }

    /// Bits per element for single-width encodings.
    pub fn element_bits(h: &[u8], enc: Encoding) -> usize {
        match enc {
            Encoding::Packed => h[3] as usize,
            Encoding::WTypBits => Self::width(h) as usize,
            Encoding::WTypMult => (Self::width(h) as usize) << 3,
            Encoding::WTypIgn => 8,
            Encoding::Flex => unreachable!("flex carries two widths"),
        }
    }

    /// Element count for any encoding; Flex reports its B sub-array, which by
    /// convention is the logical element sequence.
    pub fn num_elements(h: &[u8], enc: Encoding) -> usize {
        match enc {
            Encoding::Packed => u16::from_le_bytes([h[6], h[7]]) as usize,
            Encoding::WTypBits | Encoding::WTypMult | Encoding::WTypIgn => Self::size(h),
            Encoding::Flex => Self::flex_b(h).1,
        }
    }

    /// Flex sub-array A: (bits per element, count), packed in bytes 2-3.
    pub fn flex_a(h: &[u8]) -> (usize, usize) {
        let word = u16::from_le_bytes([h[2], h[3]]);
        (((word >> 10) & 0x3F) as usize + 1, (word & 0x3FF) as usize)
    }

    /// Flex sub-array B: (bits per element, count), packed in bytes 6-7.
    pub fn flex_b(h: &[u8]) -> (usize, usize) {
        let word = u16::from_le_bytes([h[6], h[7]]);
        (((word >> 10) & 0x3F) as usize + 1, (word & 0x3FF) as usize)
    }

    /// Total byte size claimed by the header: header plus payload, 8-aligned.
    pub fn byte_size(h: &[u8]) -> Result<usize> {
        let enc = Self::encoding(h)?;
        let payload_bits = match enc {
            Encoding::WTypBits => Self::size(h) * Self::width(h) as usize,
            Encoding::WTypMult => Self::size(h) * (Self::width(h) as usize) * 8,
            Encoding::WTypIgn => Self::size(h) * 8,
            Encoding::Packed => {
                Self::num_elements(h, enc) * Self::element_bits(h, enc)
            }
            Encoding::Flex => {
                let (wa, na) = Self::flex_a(h);
                let (wb, nb) = Self::flex_b(h);
                wa * na + wb * nb
            }
        };
        Ok(NODE_HEADER_SIZE + align_bits_to8(payload_bits))
    }

    /// Byte size a node of `count` elements at `bits` per element needs,
    /// header included.
    pub fn calc_byte_size(enc: Encoding, count: usize, bits: usize) -> usize {
        let payload_bits = match enc {
            Encoding::WTypBits | Encoding::Packed => count * bits,
            Encoding::WTypMult => count * bits, // bits is already bytes * 8 here
            Encoding::WTypIgn => count * 8,
            Encoding::Flex => unreachable!("flex sizes come from both halves"),
        };
        NODE_HEADER_SIZE + align_bits_to8(payload_bits)
    }

    /// Fill in a fresh header. Capacity is set separately by the allocator,
    /// which knows what it actually carved out.
    pub fn init(h: &mut [u8], enc: Encoding, flags: NodeFlags, bits: usize, count: usize) {
        for b in h[..NODE_HEADER_SIZE].iter_mut() {
            *b = 0;
        }
        match enc {
            Encoding::WTypBits | Encoding::WTypMult | Encoding::WTypIgn => {
                h[4] = (flags.bits() << 5) | ((enc as u8 & 0x3) << 3);
                match enc {
                    Encoding::WTypBits => Self::set_width(h, bits),
                    Encoding::WTypMult => Self::set_width(h, bits >> 3),
                    _ => {}
                }
                Self::set_size(h, count);
            }
            Encoding::Packed => {
                debug_assert!(bits <= 64 && count < 0x10000);
                h[3] = bits as u8;
                h[4] = (flags.bits() << 5) | (WTYPE_EXTEND << 3);
                h[5] = enc.extended_tag();
                let c = (count as u16).to_le_bytes();
                h[6] = c[0];
                h[7] = c[1];
            }
            Encoding::Flex => unreachable!("use init_flex"),
        }
    }

    /// Fill in a Flex header from both sub-array geometries.
    pub fn init_flex(
        h: &mut [u8],
        flags: NodeFlags,
        bits_a: usize,
        count_a: usize,
        bits_b: usize,
        count_b: usize,
    ) {
        debug_assert!((1..=64).contains(&bits_a) && (1..=64).contains(&bits_b));
        debug_assert!(count_a < 1024 && count_b < 1024);
        for b in h[..NODE_HEADER_SIZE].iter_mut() {
            *b = 0;
        }
        h[4] = (flags.bits() << 5) | (WTYPE_EXTEND << 3);
        h[5] = Encoding::Flex.extended_tag();
        let wa = ((((bits_a - 1) as u16) << 10) | count_a as u16).to_le_bytes();
        h[2] = wa[0];
        h[3] = wa[1];
        let wb = ((((bits_b - 1) as u16) << 10) | count_b as u16).to_le_bytes();
        h[6] = wb[0];
        h[7] = wb[1];
    }
}

/// Round a bit count up to whole bytes, then up to the 8-byte alignment every
/// node payload keeps.
pub(crate) fn align_bits_to8(bits: usize) -> usize {
    let bytes = (bits + 7) >> 3;
    (bytes + 7) & !7usize
}

/// A slot read out of a `has_refs` array: lsb clear is a ref to a child node,
/// lsb set is an inline value carried shifted left by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrTagged {
    Ref(Ref),
    Tagged(u64),
}

impl RefOrTagged {
    pub fn from_slot(raw: u64) -> Self {
        if raw & 1 == 0 {
            RefOrTagged::Ref(raw as usize)
        } else {
            RefOrTagged::Tagged(raw >> 1)
        }
    }

    /// Encode an inline integer for storage in a `has_refs` slot.
    pub fn tag(value: u64) -> u64 {
        debug_assert!(value <= u64::MAX >> 1);
        (value << 1) | 1
    }

    pub fn as_ref(self) -> Result<Ref> {
        match self {
            RefOrTagged::Ref(r) => Ok(r),
            RefOrTagged::Tagged(_) => {
                Err(Error::InvalidArgument("tagged slot dereferenced as ref"))
            }
        }
    }

    pub fn as_tagged(self) -> Result<u64> {
        match self {
            RefOrTagged::Tagged(v) => Ok(v),
            RefOrTagged::Ref(_) => Err(Error::InvalidArgument("ref slot read as tagged value")),
        }
    }
}
