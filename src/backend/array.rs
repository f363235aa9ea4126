use super::alloc::{node_slice, validate_node, SlabAlloc};
use super::mapping::Mapping;
use super::node::{Encoding, NodeFlags, NodeHeader, RefOrTagged};
use crate::api::*;

/// Smallest node a fresh array starts with; grows by half its size after
/// that, so short-lived arrays stay cheap and long appends amortize.
const INITIAL_CAPACITY: usize = 128;

/// Bits required to store `v` in a plain value array: non-negative values
/// take their unsigned width (so the full 0..=255 range packs into 8 bits),
/// negatives their two's-complement width. Only 0,1,2,4 and the machine
/// widths exist. At the widths >= 8 a value may occupy the sign bit and read
/// back as its sign-extension; that is the value-array contract.
pub(crate) fn bits_needed(v: i64) -> u8 {
    if v >= 0 {
        match v {
            0 => 0,
            1 => 1,
            2..=3 => 2,
            4..=15 => 4,
            16..=0xFF => 8,
            0x100..=0xFFFF => 16,
            0x1_0000..=0xFFFF_FFFF => 32,
            _ => 64,
        }
    } else {
        match v {
            -0x80..=-1 => 8,
            -0x8000..=-0x81 => 16,
            -0x8000_0000..=-0x8001 => 32,
            _ => 64,
        }
    }
}

/// Lossless width for slot arrays (refs, tagged integers, tree offsets):
/// a non-negative value never gets a width whose sign bit it would occupy,
/// so every stored slot reads back bit-exactly. Sub-byte widths zero-extend
/// and are lossless as they stand; negatives already take their signed fit.
pub(crate) fn bits_needed_signed(v: i64) -> u8 {
    match v {
        0..=15 => bits_needed(v),
        16..=0x7F => 8,
        0x80..=0x7FFF => 16,
        0x8000..=0x7FFF_FFFF => 32,
        v if v >= 0 => 64,
        _ => bits_needed(v),
    }
}

/// Truncate `v` to the representation a `width`-bit slot actually stores,
/// re-extended to i64. This is what a stored value reads back as, and what
/// `find` compares against.
fn materialized(v: i64, width: u8) -> i64 {
    match width {
        0 => 0,
        1 => v & 0x1,
        2 => v & 0x3,
        4 => v & 0xF,
        8 => v as i8 as i64,
        16 => v as i16 as i64,
        32 => v as i32 as i64,
        _ => v,
    }
}

/// Read element `ndx` from a fixed-width payload. Sub-byte widths zero-extend
/// (they only ever hold small non-negative values); machine widths
/// sign-extend. Multi-byte values are little-endian.
pub(crate) fn get_direct(data: &[u8], width: u8, ndx: usize) -> i64 {
    match width {
        0 => 0,
        1 => ((data[ndx >> 3] >> (ndx & 7)) & 0x01) as i64,
        2 => ((data[ndx >> 2] >> ((ndx & 3) << 1)) & 0x03) as i64,
        4 => ((data[ndx >> 1] >> ((ndx & 1) << 2)) & 0x0F) as i64,
        8 => data[ndx] as i8 as i64,
        16 => {
            let o = ndx * 2;
            i16::from_le_bytes(data[o..o + 2].try_into().unwrap()) as i64
        }
        32 => {
            let o = ndx * 4;
            i32::from_le_bytes(data[o..o + 4].try_into().unwrap()) as i64
        }
        64 => {
            let o = ndx * 8;
            i64::from_le_bytes(data[o..o + 8].try_into().unwrap())
        }
        _ => unreachable!("width is always one of 0,1,2,4,8,16,32,64"),
    }
}

pub(crate) fn set_direct(data: &mut [u8], width: u8, ndx: usize, value: i64) {
    match width {
        0 => debug_assert_eq!(value, 0),
        1 => {
            let p = &mut data[ndx >> 3];
            let shift = ndx & 7;
            *p = (*p & !(1 << shift)) | (((value as u8) & 0x01) << shift);
        }
        2 => {
            let p = &mut data[ndx >> 2];
            let shift = (ndx & 3) << 1;
            *p = (*p & !(0x03 << shift)) | (((value as u8) & 0x03) << shift);
        }
        4 => {
            let p = &mut data[ndx >> 1];
            let shift = (ndx & 1) << 2;
            *p = (*p & !(0x0F << shift)) | (((value as u8) & 0x0F) << shift);
        }
        8 => data[ndx] = value as u8,
        16 => data[ndx * 2..ndx * 2 + 2].copy_from_slice(&(value as i16).to_le_bytes()),
        32 => data[ndx * 4..ndx * 4 + 4].copy_from_slice(&(value as i32).to_le_bytes()),
        64 => data[ndx * 8..ndx * 8 + 8].copy_from_slice(&value.to_le_bytes()),
        _ => unreachable!("width is always one of 0,1,2,4,8,16,32,64"),
    }
}

/// Extract `width` bits starting at bit `bit_pos` from a payload, for the
/// Packed/Flex encodings whose elements are not byte-aligned. Sign-extends.
fn get_bits(data: &[u8], bit_pos: usize, width: usize) -> i64 {
    debug_assert!((1..=64).contains(&width));
    let mut raw: u64 = 0;
    for i in 0..width {
        let bit = bit_pos + i;
        if (data[bit >> 3] >> (bit & 7)) & 1 != 0 {
            raw |= 1 << i;
        }
    }
    // sign-extend from `width` bits
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

/// Mutable accessor over a WTypBits integer node. Operations take the
/// allocator so the array can be copied on first write, rewidened, or grown;
/// after any mutation the caller must pick up `node_ref()` again, since all
/// three of those move the node.
///
/// Width policy: plain arrays use the unsigned fit (`bits_needed`); arrays
/// carrying the HAS_REFS or CONTEXT flag hold offsets, tagged integers or
/// bookkeeping counts that must round-trip exactly, so they use the signed
/// fit (`bits_needed_signed`) and never store a value in its own sign bit.
pub struct Array {
    r: Ref,
    width: u8,
    len: usize,
    flags: NodeFlags,
}

impl Array {
    /// Create an empty array (width 0).
    pub fn create(alloc: &mut SlabAlloc, flags: NodeFlags) -> Result<Array> {
        let r = alloc.alloc(INITIAL_CAPACITY)?;
        let cap = {
            let h = alloc.mapping().slice_mut(r, NODE_HEADER_SIZE)?;
            let cap = NodeHeader::capacity(h);
            NodeHeader::init(h, Encoding::WTypBits, flags, 0, 0);
            NodeHeader::set_capacity(h, cap);
            cap
        };
        debug_assert!(cap >= INITIAL_CAPACITY);
        Ok(Array { r, width: 0, len: 0, flags })
    }

    /// Attach to an existing integer node. Compressed nodes (Packed/Flex) are
    /// read-only on disk; the first mutable attach rewrites them as WTypBits.
    pub fn from_ref(alloc: &mut SlabAlloc, r: Ref) -> Result<Array> {
        validate_node(alloc.mapping(), r)?;
        let header: [u8; NODE_HEADER_SIZE] =
            alloc.mapping().slice(r, NODE_HEADER_SIZE)?.try_into().unwrap();
        match NodeHeader::encoding(&header)? {
            Encoding::WTypBits => Ok(Array {
                r,
                width: NodeHeader::width(&header),
                len: NodeHeader::size(&header),
                flags: NodeHeader::flags(&header),
            }),
            Encoding::Packed | Encoding::Flex => Self::decompress(alloc, r),
            _ => Err(Error::InvalidArgument("node is not an integer array")),
        }
    }

    /// Rewrite a compressed node as a plain WTypBits array.
    fn decompress(alloc: &mut SlabAlloc, r: Ref) -> Result<Array> {
        let (values, flags) = {
            let reader = ReadArray::from_ref(alloc.mapping(), r)?;
            let mut values = Vec::with_capacity(reader.len());
            for i in 0..reader.len() {
                values.push(reader.get(i)?);
            }
            (values, reader.flags())
        };
        log::trace!("decompressing node {:#x} ({} elements)", r, values.len());
        let mut arr = Array::create(alloc, flags)?;
        for (i, v) in values.iter().enumerate() {
            arr.insert(alloc, i, *v)?;
        }
        alloc.free(r)?;
        Ok(arr)
    }

    pub fn node_ref(&self) -> Ref { self.r }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn width(&self) -> u8 { self.width }

    pub fn flags(&self) -> NodeFlags { self.flags }

    fn payload<'a>(&self, map: &'a Mapping, cap: usize) -> Result<&'a mut [u8]> {
        Ok(&mut map.slice_mut(self.r, cap)?[NODE_HEADER_SIZE..])
    }

    fn capacity(&self, map: &Mapping) -> Result<usize> {
        Ok(NodeHeader::capacity(map.slice(self.r, NODE_HEADER_SIZE)?))
    }

    /// Width a new value needs in this array; slot-bearing arrays take the
    /// lossless signed fit.
    fn width_for(&self, value: i64) -> u8 {
        if self.flags.intersects(NodeFlags::HAS_REFS | NodeFlags::CONTEXT) {
            bits_needed_signed(value)
        } else {
            bits_needed(value)
        }
    }

    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Result<i64> {
        if ndx >= self.len {
            return Err(Error::InvalidArgument("array index out of range"));
        }
        let node = node_slice(alloc.mapping(), self.r)?;
        Ok(get_direct(&node[NODE_HEADER_SIZE..], self.width, ndx))
    }

    /// Decode a slot of a `has_refs` array.
    pub fn get_slot(&self, alloc: &SlabAlloc, ndx: usize) -> Result<RefOrTagged> {
        debug_assert!(self.flags.contains(NodeFlags::HAS_REFS));
        Ok(RefOrTagged::from_slot(self.get(alloc, ndx)? as u64))
    }

    /// Copy-on-write gate: committed nodes are immutable, so the first
    /// mutation of this array inside a transaction clones its node.
    fn ensure_writable(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if alloc.is_txn_local(self.r) {
            return Ok(());
        }
        let size = validate_node(alloc.mapping(), self.r)?;
        let new_ref = alloc.alloc(size)?;
        let map = alloc.mapping();
        let new_cap = NodeHeader::capacity(map.slice(new_ref, NODE_HEADER_SIZE)?);
        // whole-node copy, then restore the destination's own capacity
        let src: Vec<u8> = map.slice(self.r, size)?.to_vec();
        map.slice_mut(new_ref, size)?.copy_from_slice(&src);
        NodeHeader::set_capacity(map.slice_mut(new_ref, NODE_HEADER_SIZE)?, new_cap);
        alloc.free(self.r)?;
        log::trace!("copy-on-write {:#x} -> {:#x}", self.r, new_ref);
        self.r = new_ref;
        Ok(())
    }

    /// Make sure the node can hold `len` elements of `width` bits, moving to
    /// a bigger allocation when it cannot. Element data is not rewritten.
    fn ensure_capacity(&mut self, alloc: &mut SlabAlloc, len: usize, width: u8) -> Result<()> {
        let needed = NodeHeader::calc_byte_size(Encoding::WTypBits, len, width as usize);
        let cap = self.capacity(alloc.mapping())?;
        if needed <= cap {
            return Ok(());
        }
        let want = needed.max(cap + cap / 2);
        let new_ref = alloc.alloc(want)?;
        let map = alloc.mapping();
        let new_cap = NodeHeader::capacity(map.slice(new_ref, NODE_HEADER_SIZE)?);
        let old_size = NodeHeader::byte_size(map.slice(self.r, NODE_HEADER_SIZE)?)?;
        let src: Vec<u8> = map.slice(self.r, old_size)?.to_vec();
        map.slice_mut(new_ref, old_size)?.copy_from_slice(&src);
        NodeHeader::set_capacity(map.slice_mut(new_ref, NODE_HEADER_SIZE)?, new_cap);
        alloc.free(self.r)?;
        self.r = new_ref;
        Ok(())
    }

    /// Rewrite all elements at a wider width, in place. Walks top-down so an
    /// element is always read before its slot is overwritten.
    fn expand_width(&mut self, alloc: &mut SlabAlloc, new_width: u8) -> Result<()> {
        debug_assert!(new_width > self.width);
        self.ensure_capacity(alloc, self.len, new_width)?;
        let cap = self.capacity(alloc.mapping())?;
        let old_width = self.width;
        let data = self.payload(alloc.mapping(), cap)?;
        for k in (0..self.len).rev() {
            let v = get_direct(data, old_width, k);
            set_direct(data, new_width, k, v);
        }
        self.width = new_width;
        let h = alloc.mapping().slice_mut(self.r, NODE_HEADER_SIZE)?;
        NodeHeader::set_width(h, new_width as usize);
        log::trace!("array {:#x}: width {} -> {}", self.r, old_width, new_width);
        Ok(())
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        if ndx >= self.len {
            return Err(Error::InvalidArgument("array index out of range"));
        }
        self.ensure_writable(alloc)?;
        let width = self.width_for(value);
        if width > self.width {
            self.expand_width(alloc, width)?;
        }
        let cap = self.capacity(alloc.mapping())?;
        let data = self.payload(alloc.mapping(), cap)?;
        set_direct(data, self.width, ndx, value);
        Ok(())
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        if ndx > self.len {
            return Err(Error::InvalidArgument("array index out of range"));
        }
        if self.len >= MAX_ARRAY_SIZE {
            return Err(Error::InvalidArgument("array full"));
        }
        self.ensure_writable(alloc)?;

        let value_width = self.width_for(value);
        let target_width = self.width.max(value_width);
        self.ensure_capacity(alloc, self.len + 1, target_width)?;
        if target_width > self.width {
            self.expand_width(alloc, target_width)?;
        }

        let cap = self.capacity(alloc.mapping())?;
        let data = self.payload(alloc.mapping(), cap)?;
        if self.width >= 8 {
            // byte-granular move of everything above the insertion point
            let w = (self.width / 8) as usize;
            data.copy_within(ndx * w..self.len * w, (ndx + 1) * w);
        } else {
            for k in (ndx..self.len).rev() {
                let v = get_direct(data, self.width, k);
                set_direct(data, self.width, k + 1, v);
            }
        }
        set_direct(data, self.width, ndx, value);

        self.len += 1;
        NodeHeader::set_size(alloc.mapping().slice_mut(self.r, NODE_HEADER_SIZE)?, self.len);
        Ok(())
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        self.insert(alloc, self.len, value)
    }

    /// Store a tagged inline integer into a `has_refs` slot.
    pub fn set_tagged(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: u64) -> Result<()> {
        self.set(alloc, ndx, RefOrTagged::tag(value) as i64)
    }

    /// Drop every element at or above `new_len`. Storage is not reclaimed;
    /// the width stays put.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_len: usize) -> Result<()> {
        if new_len > self.len {
            return Err(Error::InvalidArgument("truncate beyond array length"));
        }
        if new_len == self.len {
            return Ok(());
        }
        self.ensure_writable(alloc)?;
        self.len = new_len;
        NodeHeader::set_size(alloc.mapping().slice_mut(self.r, NODE_HEADER_SIZE)?, self.len);
        Ok(())
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> Result<()> {
        if ndx >= self.len {
            return Err(Error::InvalidArgument("array index out of range"));
        }
        self.ensure_writable(alloc)?;
        let cap = self.capacity(alloc.mapping())?;
        let data = self.payload(alloc.mapping(), cap)?;
        if self.width >= 8 {
            let w = (self.width / 8) as usize;
            data.copy_within((ndx + 1) * w..self.len * w, ndx * w);
        } else {
            for k in ndx + 1..self.len {
                let v = get_direct(data, self.width, k);
                set_direct(data, self.width, k - 1, v);
            }
        }
        self.len -= 1;
        NodeHeader::set_size(alloc.mapping().slice_mut(self.r, NODE_HEADER_SIZE)?, self.len);
        Ok(())
    }

    /// Lowest index in `[start, end)` holding `value`, if any. `end == None`
    /// scans to the end of the array.
    pub fn find(
        &self,
        alloc: &SlabAlloc,
        value: i64,
        start: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>> {
        let end = end.unwrap_or(self.len);
        if start > end || end > self.len {
            return Err(Error::InvalidArgument("find range out of bounds"));
        }
        if start == end {
            return Ok(None);
        }
        // a value wider than every element cannot be present
        if self.width_for(value) > self.width {
            return Ok(None);
        }
        if self.width == 0 {
            return Ok(Some(start)); // every element is zero
        }

        let node = node_slice(alloc.mapping(), self.r)?;
        let data = &node[NODE_HEADER_SIZE..];
        let needle = materialized(value, self.width);
        let found = match self.width {
            8 => data[start..end].iter().position(|&b| b as i8 as i64 == needle),
            16 | 32 | 64 => {
                let w = (self.width / 8) as usize;
                data[start * w..end * w]
                    .chunks_exact(w)
                    .position(|c| get_direct(c, self.width, 0) == needle)
            }
            _ => (start..end)
                .position(|i| get_direct(data, self.width, i) == needle),
        };
        Ok(found.map(|p| p + start))
    }

    /// Release the node. Consumes the accessor; child refs, if any, are the
    /// caller's to walk first.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        alloc.free(self.r)
    }
}

/// Read-only accessor usable from read transactions; understands every
/// integer encoding including the compressed ones.
pub struct ReadArray<'a> {
    node: &'a [u8],
    enc: Encoding,
    len: usize,
}

impl<'a> ReadArray<'a> {
    pub(crate) fn from_ref(map: &'a Mapping, r: Ref) -> Result<ReadArray<'a>> {
        let node = node_slice(map, r)?;
        let enc = NodeHeader::encoding(node)?;
        if enc == Encoding::WTypIgn {
            return Err(Error::InvalidArgument("node is not an integer array"));
        }
        let len = NodeHeader::num_elements(node, enc);
        Ok(ReadArray { node, enc, len })
    }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn flags(&self) -> NodeFlags { NodeHeader::flags(self.node) }

    pub fn has_refs(&self) -> bool { NodeHeader::has_refs(self.node) }

    pub fn is_inner_bptree(&self) -> bool { NodeHeader::is_inner_bptree(self.node) }

    pub fn get(&self, ndx: usize) -> Result<i64> {
        if ndx >= self.len {
            return Err(Error::InvalidArgument("array index out of range"));
        }
        let data = &self.node[NODE_HEADER_SIZE..];
        Ok(match self.enc {
            Encoding::WTypBits => get_direct(data, NodeHeader::width(self.node), ndx),
            Encoding::WTypMult => {
                get_direct(data, NodeHeader::width(self.node).saturating_mul(8), ndx)
            }
            Encoding::Packed => {
                let bits = NodeHeader::element_bits(self.node, Encoding::Packed);
                if bits == 0 {
                    0
                } else {
                    get_bits(data, ndx * bits, bits)
                }
            }
            Encoding::Flex => {
                // B is a sequence of indices into the value dictionary A
                let (bits_a, len_a) = NodeHeader::flex_a(self.node);
                let (bits_b, _) = NodeHeader::flex_b(self.node);
                let pos = get_bits(data, len_a * bits_a + ndx * bits_b, bits_b) as u64 as usize;
                if pos >= len_a {
                    return Err(Error::CorruptedFile("flex index out of dictionary range"));
                }
                get_bits(data, pos * bits_a, bits_a)
            }
            Encoding::WTypIgn => unreachable!("rejected in from_ref"),
        })
    }

    pub fn get_slot(&self, ndx: usize) -> Result<RefOrTagged> {
        Ok(RefOrTagged::from_slot(self.get(ndx)? as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fresh() -> SlabAlloc {
        let file = tempfile::tempfile().unwrap();
        let map = Arc::new(Mapping::open(file, None).unwrap());
        SlabAlloc::new(map, FILE_HEADER_SIZE)
    }

    #[test]
    fn bits_needed_ladder() {
        assert_eq!(bits_needed(0), 0);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(3), 2);
        assert_eq!(bits_needed(4), 4);
        assert_eq!(bits_needed(15), 4);
        assert_eq!(bits_needed(16), 8);
        assert_eq!(bits_needed(255), 8);
        assert_eq!(bits_needed(256), 16);
        assert_eq!(bits_needed(65536), 32);
        assert_eq!(bits_needed(1 << 32), 64);
        assert_eq!(bits_needed(-1), 8);
        assert_eq!(bits_needed(-128), 8);
        assert_eq!(bits_needed(-129), 16);
        assert_eq!(bits_needed(-256), 16);
        assert_eq!(bits_needed(-65536), 32);
        assert_eq!(bits_needed(-(1i64 << 32)), 64);
        assert_eq!(bits_needed(i64::MIN), 64);
    }

    #[test]
    fn signed_fit_ladder_never_borrows_the_sign_bit() {
        assert_eq!(bits_needed_signed(0), 0);
        assert_eq!(bits_needed_signed(15), 4);
        assert_eq!(bits_needed_signed(16), 8);
        assert_eq!(bits_needed_signed(127), 8);
        assert_eq!(bits_needed_signed(128), 16);
        assert_eq!(bits_needed_signed(255), 16);
        assert_eq!(bits_needed_signed(32767), 16);
        assert_eq!(bits_needed_signed(32768), 32);
        assert_eq!(bits_needed_signed(48000), 32);
        assert_eq!(bits_needed_signed(0x7FFF_FFFF), 32);
        assert_eq!(bits_needed_signed(0x8000_0000), 64);
        assert_eq!(bits_needed_signed(i64::MAX), 64);
        assert_eq!(bits_needed_signed(-1), 8);
        assert_eq!(bits_needed_signed(-129), 16);
    }

    #[test]
    fn ref_slots_round_trip_exactly() {
        // node offsets land in every [2^(w-1), 2^w) band as the file grows;
        // a slot array must return them unchanged, not sign-extended
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::HAS_REFS).unwrap();
        let refs = [248i64, 32768, 48000, 65528, (1i64 << 31) + 8, (1i64 << 33) + 16];
        for (i, &r) in refs.iter().enumerate() {
            a.add(&mut alloc, r).unwrap();
            for (j, &expect) in refs.iter().enumerate().take(i + 1) {
                assert_eq!(a.get(&alloc, j).unwrap(), expect, "after adding {}", r);
            }
        }
        for (i, &r) in refs.iter().enumerate() {
            assert_eq!(
                a.get_slot(&alloc, i).unwrap(),
                RefOrTagged::Ref(r as usize),
                "slot {} must decode as a ref",
                i
            );
        }
        assert_eq!(a.find(&alloc, 48000, 0, None).unwrap(), Some(2));
    }

    #[test]
    fn tagged_values_in_the_sign_bit_band_survive() {
        // tag(16384) = 32769 sits exactly where a 16-bit slot would flip sign
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::HAS_REFS).unwrap();
        a.add(&mut alloc, 0).unwrap();
        for count in [16384u64, 32767, 32768, 1 << 30] {
            a.set_tagged(&mut alloc, 0, count).unwrap();
            assert_eq!(a.get_slot(&alloc, 0).unwrap(), RefOrTagged::Tagged(count));
        }
    }

    #[test]
    fn context_arrays_store_counts_losslessly() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::CONTEXT).unwrap();
        a.add(&mut alloc, 48000).unwrap();
        assert_eq!(a.width(), 32);
        assert_eq!(a.get(&alloc, 0).unwrap(), 48000);
        // the plain-array policy would have picked 16 bits here
        let mut plain = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        plain.add(&mut alloc, 48000).unwrap();
        assert_eq!(plain.width(), 16);
    }

    #[test]
    fn width_promotion_observed_after_each_insert() {
        // [0, 0, 1, 1, 255] promotes the width through 0,0,1,1,8
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        let expect = [(0i64, 0u8), (0, 0), (1, 1), (1, 1), (255, 8)];
        for (v, w) in expect {
            a.add(&mut alloc, v).unwrap();
            assert_eq!(a.width(), w, "after adding {}", v);
        }
        assert_eq!(a.find(&alloc, 255, 0, None).unwrap(), Some(4));
        assert_eq!(a.find(&alloc, 2, 0, None).unwrap(), None);
        assert_eq!(a.get(&alloc, 3).unwrap(), 1);
    }

    #[test]
    fn growth_ladder_keeps_earlier_values() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        let values = [0i64, 1, 2, 3, 4, 16, 256, 65536, 4294967296];
        for &v in &values {
            a.add(&mut alloc, v).unwrap();
            for (i, &expected) in values.iter().enumerate().take(a.len()) {
                assert_eq!(a.get(&alloc, i).unwrap(), expected, "after adding {}", v);
            }
        }
    }

    #[test]
    fn negative_values_round_trip() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for v in [-1i64, -256, -65536, -4294967296] {
            a.add(&mut alloc, v).unwrap();
        }
        assert_eq!(a.get(&alloc, 0).unwrap(), -1);
        assert_eq!(a.get(&alloc, 1).unwrap(), -256);
        assert_eq!(a.get(&alloc, 2).unwrap(), -65536);
        assert_eq!(a.get(&alloc, 3).unwrap(), -4294967296);
    }

    #[test]
    fn insert_at_zero_shifts_everything_up() {
        // add 5,10,15 then insert 42 at the front
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for v in [5i64, 10, 15] {
            a.add(&mut alloc, v).unwrap();
        }
        a.insert(&mut alloc, 0, 42).unwrap();
        assert_eq!(a.len(), 4);
        for (i, v) in [42i64, 5, 10, 15].into_iter().enumerate() {
            assert_eq!(a.get(&alloc, i).unwrap(), v);
        }
    }

    #[test]
    fn insert_in_middle_with_expansion() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for v in [0i64, 1, 2, 3] {
            a.add(&mut alloc, v).unwrap();
        }
        a.insert(&mut alloc, 2, 65536).unwrap();
        let expect = [0i64, 1, 65536, 2, 3];
        for (i, v) in expect.into_iter().enumerate() {
            assert_eq!(a.get(&alloc, i).unwrap(), v);
        }
    }

    #[test]
    fn erase_then_find_scans_past_the_hole() {
        // [a, b, c, b, d]: erase index 1, find(b) moves to 2
        let mut alloc = fresh();
        let mut arr = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        let (a, b, c, d) = (97i64, 98, 99, 100);
        for v in [a, b, c, b, d] {
            arr.add(&mut alloc, v).unwrap();
        }
        assert_eq!(arr.width(), 8);
        assert_eq!(arr.find(&alloc, b, 0, None).unwrap(), Some(1));
        arr.erase(&mut alloc, 1).unwrap();
        assert_eq!(arr.len(), 4);
        for (i, v) in [a, c, b, d].into_iter().enumerate() {
            assert_eq!(arr.get(&alloc, i).unwrap(), v);
        }
        assert_eq!(arr.find(&alloc, b, 0, None).unwrap(), Some(2));
    }

    #[test]
    fn erase_works_at_sub_byte_widths() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for v in [1i64, 0, 1, 1, 0, 1] {
            a.add(&mut alloc, v).unwrap();
        }
        a.erase(&mut alloc, 0).unwrap();
        a.erase(&mut alloc, 2).unwrap();
        let expect = [0i64, 1, 0, 1];
        assert_eq!(a.len(), 4);
        for (i, v) in expect.into_iter().enumerate() {
            assert_eq!(a.get(&alloc, i).unwrap(), v);
        }
    }

    #[test]
    fn find_respects_range_bounds() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for i in 0..100i64 {
            a.add(&mut alloc, i).unwrap();
        }
        assert_eq!(a.find(&alloc, 101, 0, Some(100)).unwrap(), None);
        assert_eq!(a.find(&alloc, 0, 1, Some(100)).unwrap(), None);
        assert_eq!(a.find(&alloc, 99, 99, Some(100)).unwrap(), Some(99));
        assert!(a.find(&alloc, 5, 10, Some(5)).is_err());
    }

    #[test]
    fn boundary_values_read_back_as_their_stored_pattern() {
        // 255 packs into 8 bits; reading sign-extends the stored pattern
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        a.add(&mut alloc, 255).unwrap();
        assert_eq!(a.width(), 8);
        assert_eq!(a.get(&alloc, 0).unwrap(), materialized(255, 8));
        assert_eq!(a.find(&alloc, 255, 0, None).unwrap(), Some(0));
    }

    #[test]
    fn out_of_range_indices_are_invalid_arguments() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        a.add(&mut alloc, 1).unwrap();
        assert!(matches!(a.get(&alloc, 1), Err(Error::InvalidArgument(_))));
        assert!(matches!(a.set(&mut alloc, 1, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(a.insert(&mut alloc, 2, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(a.erase(&mut alloc, 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn long_append_grows_past_initial_capacity() {
        let mut alloc = fresh();
        let mut a = Array::create(&mut alloc, NodeFlags::empty()).unwrap();
        for i in 0..5000i64 {
            a.add(&mut alloc, i).unwrap();
        }
        assert_eq!(a.len(), 5000);
        for i in (0..5000usize).step_by(997) {
            assert_eq!(a.get(&alloc, i).unwrap(), i as i64);
        }
    }

    #[test]
    fn packed_node_reads_and_decompresses() {
        let mut alloc = fresh();
        // hand-build a Packed node: 5 elements, 7 bits each
        let values = [-3i64, 0, 12, -60, 63];
        let bits = 7usize;
        let size = NodeHeader::calc_byte_size(Encoding::Packed, values.len(), bits);
        let r = alloc.alloc(size).unwrap();
        {
            let node = alloc.mapping().slice_mut(r, size).unwrap();
            let cap = NodeHeader::capacity(&node[..NODE_HEADER_SIZE]);
            NodeHeader::init(node, Encoding::Packed, NodeFlags::empty(), bits, values.len());
            NodeHeader::set_capacity(node, cap);
            let data = &mut node[NODE_HEADER_SIZE..];
            for (i, &v) in values.iter().enumerate() {
                for bit in 0..bits {
                    let raw = ((v as u64) >> bit) & 1;
                    let pos = i * bits + bit;
                    if raw != 0 {
                        data[pos >> 3] |= 1 << (pos & 7);
                    }
                }
            }
        }
        let reader = ReadArray::from_ref(alloc.mapping(), r).unwrap();
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(reader.get(i).unwrap(), v);
        }

        // a mutable attach converts to WTypBits and keeps the contents
        let arr = Array::from_ref(&mut alloc, r).unwrap();
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(arr.get(&alloc, i).unwrap(), v);
        }
        assert_eq!(arr.width(), 8);
    }
}
