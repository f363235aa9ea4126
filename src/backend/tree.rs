use super::alloc::SlabAlloc;
use super::array::{Array, ReadArray};
use super::mapping::Mapping;
use super::node::{NodeFlags, NodeHeader, RefOrTagged};
use crate::api::*;

/// Default branching factor: maximum elements per leaf and children per
/// inner node. A power of two so child lookup in the compact form divides
/// cheaply and nodes stay inside a few cache lines.
pub const BP_ORDER: usize = 64;

// Inner node layout, as an integer array with HAS_REFS | INNER_BPTREE set:
//   slot 0:        tagged elems-per-child (compact form, all children except
//                  possibly the last hold exactly that many elements), or a
//                  ref to a sibling array of ascending cumulative counts
//                  (general form, one entry per child except the last)
//   slots 1..=n:   refs to the n children
//   slot n+1:      tagged total element count of the subtree
//
// Pure appends keep the compact form; the first interior insert, split or
// erase that makes child sizes heterogeneous switches the node to general.

/// Walk from `root` to the leaf containing logical index `ndx`.
fn read_step(map: &Mapping, node: Ref, ndx: usize) -> Result<(Ref, usize)> {
    let arr = ReadArray::from_ref(map, node)?;
    debug_assert!(arr.is_inner_bptree());
    let n_children = arr.len() - 2;
    let (ci, base) = match arr.get_slot(0)? {
        RefOrTagged::Tagged(epc) => {
            let epc = epc as usize;
            if epc == 0 {
                return Err(Error::CorruptedFile("inner node claims empty children"));
            }
            let ci = (ndx / epc).min(n_children - 1);
            (ci, ci * epc)
        }
        RefOrTagged::Ref(offsets_ref) => {
            let offsets = ReadArray::from_ref(map, offsets_ref)?;
            let mut ci = offsets.len();
            let mut base = if ci > 0 { offsets.get(ci - 1)? as usize } else { 0 };
            for j in 0..offsets.len() {
                let cum = offsets.get(j)? as usize;
                if cum > ndx {
                    ci = j;
                    base = if j > 0 { offsets.get(j - 1)? as usize } else { 0 };
                    break;
                }
            }
            (ci, base)
        }
    };
    if ci >= n_children {
        return Err(Error::CorruptedFile("tree index beyond child table"));
    }
    Ok((arr.get_slot(1 + ci)?.as_ref()?, ndx - base))
}

/// Element count of the subtree rooted at `node`.
pub(crate) fn subtree_len(map: &Mapping, node: Ref) -> Result<usize> {
    let arr = ReadArray::from_ref(map, node)?;
    if arr.is_inner_bptree() {
        Ok(arr.get_slot(arr.len() - 1)?.as_tagged()? as usize)
    } else {
        Ok(arr.len())
    }
}

pub(crate) fn subtree_get(map: &Mapping, mut node: Ref, mut ndx: usize) -> Result<i64> {
    loop {
        let arr = ReadArray::from_ref(map, node)?;
        if !arr.is_inner_bptree() {
            return arr.get(ndx);
        }
        let (child, child_ndx) = read_step(map, node, ndx)?;
        node = child;
        ndx = child_ndx;
    }
}

/// Writable view of an inner node, lifted into plain vectors: mutate the
/// child table and sizes freely, then `store` writes the node back (choosing
/// compact or general form) and reports where it now lives.
struct InnerNode {
    r: Ref,
    children: Vec<Ref>,
    sizes: Vec<usize>,
    offsets_ref: Ref,
}

impl InnerNode {
    fn load(map: &Mapping, r: Ref) -> Result<InnerNode> {
        let arr = ReadArray::from_ref(map, r)?;
        if !arr.is_inner_bptree() || arr.len() < 3 {
            return Err(Error::CorruptedFile("malformed inner tree node"));
        }
        let n = arr.len() - 2;
        let total = arr.get_slot(arr.len() - 1)?.as_tagged()? as usize;
        let mut children = Vec::with_capacity(n);
        for i in 0..n {
            children.push(arr.get_slot(1 + i)?.as_ref()?);
        }
        let (sizes, offsets_ref) = match arr.get_slot(0)? {
            RefOrTagged::Tagged(epc) => {
                let epc = epc as usize;
                if epc == 0 || (n - 1) * epc > total {
                    return Err(Error::CorruptedFile("inner node counts inconsistent"));
                }
                let mut sizes = vec![epc; n];
                sizes[n - 1] = total - (n - 1) * epc;
                (sizes, NULL_REF)
            }
            RefOrTagged::Ref(offsets_ref) => {
                let offsets = ReadArray::from_ref(map, offsets_ref)?;
                if offsets.len() + 1 != n {
                    return Err(Error::CorruptedFile("offsets table length mismatch"));
                }
                let mut sizes = Vec::with_capacity(n);
                let mut prev = 0usize;
                for j in 0..offsets.len() {
                    let cum = offsets.get(j)? as usize;
                    if cum < prev {
                        return Err(Error::CorruptedFile("offsets table not ascending"));
                    }
                    sizes.push(cum - prev);
                    prev = cum;
                }
                if total < prev {
                    return Err(Error::CorruptedFile("inner node counts inconsistent"));
                }
                sizes.push(total - prev);
                (sizes, offsets_ref)
            }
        };
        Ok(InnerNode { r, children, sizes, offsets_ref })
    }

    /// Create an in-memory inner node; `store` materializes it.
    fn fresh(children: Vec<Ref>, sizes: Vec<usize>) -> InnerNode {
        InnerNode { r: NULL_REF, children, sizes, offsets_ref: NULL_REF }
    }

    fn total(&self) -> usize { self.sizes.iter().sum() }

    fn count(&self) -> usize { self.children.len() }

    /// Child index and element base for `ndx`; an index equal to the total
    /// (an append) lands in the last child.
    fn locate(&self, ndx: usize) -> (usize, usize) {
        let mut base = 0;
        for (i, &size) in self.sizes.iter().enumerate() {
            if ndx < base + size || i + 1 == self.sizes.len() {
                return (i, base);
            }
            base += size;
        }
        (0, 0) // unreachable for non-empty nodes
    }

    /// Write the node back, re-deriving the slot-0 form from the sizes, and
    /// return the (possibly moved) node ref.
    fn store(mut self, alloc: &mut SlabAlloc) -> Result<Ref> {
        let n = self.count();
        debug_assert!(n >= 1);
        let compact = self.sizes[..n - 1].iter().all(|&s| s == self.sizes[0]);

        let mut arr = if self.r == NULL_REF {
            Array::create(alloc, NodeFlags::HAS_REFS | NodeFlags::INNER_BPTREE)?
        } else {
            Array::from_ref(alloc, self.r)?
        };
        let needed = n + 2;
        if arr.len() > needed {
            arr.truncate(alloc, needed)?;
        }
        while arr.len() < needed {
            arr.add(alloc, 0)?;
        }

        let slot0 = if compact {
            if self.offsets_ref != NULL_REF {
                alloc.free(self.offsets_ref)?;
                self.offsets_ref = NULL_REF;
            }
            RefOrTagged::tag(self.sizes[0] as u64) as i64
        } else {
            // general form: rebuild the cumulative-counts sibling. The
            // context flag puts it on the lossless width policy: cumulative
            // counts must never sign-extend when read back.
            if self.offsets_ref != NULL_REF {
                alloc.free(self.offsets_ref)?;
            }
            let mut offsets = Array::create(alloc, NodeFlags::CONTEXT)?;
            let mut cum = 0usize;
            for &size in self.sizes.iter().take(n - 1) {
                cum += size;
                offsets.add(alloc, cum as i64)?;
            }
            self.offsets_ref = offsets.node_ref();
            self.offsets_ref as i64
        };
        arr.set(alloc, 0, slot0)?;
        for (i, &child) in self.children.iter().enumerate() {
            arr.set(alloc, 1 + i, child as i64)?;
        }
        arr.set(alloc, needed - 1, RefOrTagged::tag(self.total() as u64) as i64)?;
        Ok(arr.node_ref())
    }
}

fn is_inner(map: &Mapping, r: Ref) -> Result<bool> {
    Ok(NodeHeader::is_inner_bptree(map.slice(r, NODE_HEADER_SIZE)?))
}

/// An ordered sequence of integers with logarithmic access, insert and
/// erase, built from packed-array leaves under ref-bearing inner nodes.
/// `B` is the branching factor; the default suits production trees, tests
/// use small orders to exercise splits quickly.
pub struct BpTree<const B: usize = BP_ORDER> {
    root: Ref,
}

/// Outcome of a recursive insert below some node.
enum Carry {
    Done(Ref),
    /// the node split: (left ref, new right sibling ref, right elem count)
    Split(Ref, Ref, usize),
}

impl<const B: usize> BpTree<B> {
    /// A new empty tree: a single width-0 leaf.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let leaf = Array::create(alloc, NodeFlags::empty())?;
        Ok(BpTree { root: leaf.node_ref() })
    }

    /// Attach to an existing tree root.
    pub fn from_ref(root: Ref) -> Self { BpTree { root } }

    pub fn root_ref(&self) -> Ref { self.root }

    pub fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        subtree_len(alloc.mapping(), self.root)
    }

    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Result<i64> {
        if ndx >= self.len(alloc)? {
            return Err(Error::InvalidArgument("tree index out of range"));
        }
        subtree_get(alloc.mapping(), self.root, ndx)
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        let len = self.len(alloc)?;
        self.insert(alloc, len, value)
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        if ndx > self.len(alloc)? {
            return Err(Error::InvalidArgument("tree index out of range"));
        }
        match Self::insert_recurse(alloc, self.root, ndx, value)? {
            Carry::Done(root) => self.root = root,
            Carry::Split(left, right, right_elems) => {
                // grow the tree by one level; two children always satisfy the
                // compact form with epc = left subtree size
                let left_elems = subtree_len(alloc.mapping(), left)?;
                let node =
                    InnerNode::fresh(vec![left, right], vec![left_elems, right_elems]);
                self.root = node.store(alloc)?;
                log::trace!("tree root split, new root {:#x}", self.root);
            }
        }
        Ok(())
    }

    fn insert_recurse(
        alloc: &mut SlabAlloc,
        node: Ref,
        ndx: usize,
        value: i64,
    ) -> Result<Carry> {
        if !is_inner(alloc.mapping(), node)? {
            let mut leaf = Array::from_ref(alloc, node)?;
            if leaf.len() < B {
                leaf.insert(alloc, ndx, value)?;
                return Ok(Carry::Done(leaf.node_ref()));
            }
            // leaf is full; split. Appends get a bare single-element sibling
            // so sequential loads fill leaves completely.
            if ndx == leaf.len() {
                let mut sibling = Array::create(alloc, NodeFlags::empty())?;
                sibling.add(alloc, value)?;
                return Ok(Carry::Split(leaf.node_ref(), sibling.node_ref(), 1));
            }
            let mut tail = Vec::with_capacity(leaf.len() - ndx);
            for i in ndx..leaf.len() {
                tail.push(leaf.get(alloc, i)?);
            }
            leaf.truncate(alloc, ndx)?;
            leaf.add(alloc, value)?;
            let mut sibling = Array::create(alloc, NodeFlags::empty())?;
            for v in &tail {
                sibling.add(alloc, *v)?;
            }
            let right_elems = tail.len();
            return Ok(Carry::Split(leaf.node_ref(), sibling.node_ref(), right_elems));
        }

        let mut inner = InnerNode::load(alloc.mapping(), node)?;
        let appending = ndx == inner.total();
        let (ci, base) = inner.locate(ndx);
        let child = inner.children[ci];
        match Self::insert_recurse(alloc, child, ndx - base, value)? {
            Carry::Done(child) => {
                inner.children[ci] = child;
                inner.sizes[ci] += 1;
            }
            Carry::Split(child, sibling, sibling_elems) => {
                inner.children[ci] = child;
                inner.sizes[ci] = inner.sizes[ci] + 1 - sibling_elems;
                inner.children.insert(ci + 1, sibling);
                inner.sizes.insert(ci + 1, sibling_elems);
                if inner.count() > B {
                    return Self::split_inner(alloc, inner, appending);
                }
            }
        }
        Ok(Carry::Done(inner.store(alloc)?))
    }

    /// Split an overflowing inner node. On pure appends the new sibling takes
    /// only the trailing child, preserving the compact form on the left; an
    /// interior split divides the child table in half.
    fn split_inner(alloc: &mut SlabAlloc, mut inner: InnerNode, appending: bool) -> Result<Carry> {
        let split_at = if appending { inner.count() - 1 } else { inner.count() / 2 };
        let r_children = inner.children.split_off(split_at);
        let r_sizes = inner.sizes.split_off(split_at);
        let right = InnerNode::fresh(r_children, r_sizes);
        let right_elems = right.total();
        let right_ref = right.store(alloc)?;
        let left_ref = inner.store(alloc)?;
        Ok(Carry::Split(left_ref, right_ref, right_elems))
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> Result<()> {
        if ndx >= self.len(alloc)? {
            return Err(Error::InvalidArgument("tree index out of range"));
        }
        self.root = Self::erase_recurse(alloc, self.root, ndx)?;
        // a root inner node left with a single child hands its role down,
        // shrinking the tree's height
        while is_inner(alloc.mapping(), self.root)? {
            let inner = InnerNode::load(alloc.mapping(), self.root)?;
            if inner.count() > 1 {
                break;
            }
            let lone = inner.children[0];
            let shell = inner.r;
            if inner.offsets_ref != NULL_REF {
                alloc.free(inner.offsets_ref)?;
            }
            alloc.free(shell)?;
            self.root = lone;
        }
        Ok(())
    }

    fn erase_recurse(alloc: &mut SlabAlloc, node: Ref, ndx: usize) -> Result<Ref> {
        if !is_inner(alloc.mapping(), node)? {
            let mut leaf = Array::from_ref(alloc, node)?;
            leaf.erase(alloc, ndx)?;
            return Ok(leaf.node_ref());
        }

        let mut inner = InnerNode::load(alloc.mapping(), node)?;
        let (ci, base) = inner.locate(ndx);
        let new_child = Self::erase_recurse(alloc, inner.children[ci], ndx - base)?;
        inner.children[ci] = new_child;
        inner.sizes[ci] -= 1;

        if inner.sizes[ci] == 0 {
            // fully drained subtree: remove it (only ever a leaf; inner
            // children collapse before they empty)
            alloc.free(inner.children.remove(ci))?;
            inner.sizes.remove(ci);
        } else {
            Self::fix_underflow(alloc, &mut inner, ci)?;
        }
        inner.store(alloc)
    }

    /// Restore the shape invariants around child `ci` after an erase:
    /// leaves merge with a neighbor when both halves fit in one node, and an
    /// inner child never keeps fewer than two children (merging its lone
    /// child into a sibling, or borrowing one back when the sibling is full).
    fn fix_underflow(alloc: &mut SlabAlloc, parent: &mut InnerNode, ci: usize) -> Result<()> {
        if parent.count() < 2 {
            return Ok(()); // no sibling to rebalance with
        }
        let child = parent.children[ci];
        if !is_inner(alloc.mapping(), child)? {
            if parent.sizes[ci] >= B / 2 {
                return Ok(());
            }
            let si = if ci > 0 { ci - 1 } else { ci + 1 };
            if parent.sizes[ci] + parent.sizes[si] > B {
                return Ok(());
            }
            // merge the two leaves, right into left
            let (li, ri) = if si < ci { (si, ci) } else { (ci, si) };
            let mut left = Array::from_ref(alloc, parent.children[li])?;
            let right = Array::from_ref(alloc, parent.children[ri])?;
            for i in 0..right.len() {
                let v = right.get(alloc, i)?;
                left.add(alloc, v)?;
            }
            right.destroy(alloc)?;
            parent.children[li] = left.node_ref();
            parent.sizes[li] += parent.sizes[ri];
            parent.children.remove(ri);
            parent.sizes.remove(ri);
            return Ok(());
        }

        let lower = InnerNode::load(alloc.mapping(), child)?;
        if lower.count() >= 2 {
            return Ok(());
        }
        let si = if ci > 0 { ci - 1 } else { ci + 1 };
        let mut sib = InnerNode::load(alloc.mapping(), parent.children[si])?;
        if sib.count() < B {
            // the lone grandchild moves over; the emptied shell goes away
            let grandchild = lower.children[0];
            let grand_size = lower.sizes[0];
            if si < ci {
                sib.children.push(grandchild);
                sib.sizes.push(grand_size);
            } else {
                sib.children.insert(0, grandchild);
                sib.sizes.insert(0, grand_size);
            }
            if lower.offsets_ref != NULL_REF {
                alloc.free(lower.offsets_ref)?;
            }
            alloc.free(lower.r)?;
            parent.children[si] = sib.store(alloc)?;
            parent.sizes[si] += grand_size;
            parent.children.remove(ci);
            parent.sizes.remove(ci);
        } else {
            // sibling is full: borrow its adjacent child instead
            let mut lower = lower;
            let (moved, moved_size) = if si < ci {
                let r = sib.children.pop().expect("sibling is full");
                let s = sib.sizes.pop().expect("sibling is full");
                lower.children.insert(0, r);
                lower.sizes.insert(0, s);
                (r, s)
            } else {
                let r = sib.children.remove(0);
                let s = sib.sizes.remove(0);
                lower.children.push(r);
                lower.sizes.push(s);
                (r, s)
            };
            let _ = moved;
            parent.children[si] = sib.store(alloc)?;
            parent.sizes[si] -= moved_size;
            parent.children[ci] = lower.store(alloc)?;
            parent.sizes[ci] += moved_size;
        }
        Ok(())
    }

    /// Free every node of the tree. Consumes the accessor.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Self::destroy_subtree(alloc, self.root)
    }

    fn destroy_subtree(alloc: &mut SlabAlloc, node: Ref) -> Result<()> {
        if is_inner(alloc.mapping(), node)? {
            let inner = InnerNode::load(alloc.mapping(), node)?;
            for &child in &inner.children {
                Self::destroy_subtree(alloc, child)?;
            }
            if inner.offsets_ref != NULL_REF {
                alloc.free(inner.offsets_ref)?;
            }
        }
        alloc.free(node)
    }
}

/// Read-only tree accessor for read transactions.
pub struct ReadTree<'a> {
    map: &'a Mapping,
    root: Ref,
}

impl<'a> ReadTree<'a> {
    pub(crate) fn new(map: &'a Mapping, root: Ref) -> ReadTree<'a> {
        ReadTree { map, root }
    }

    pub fn len(&self) -> Result<usize> { subtree_len(self.map, self.root) }

    pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

    pub fn get(&self, ndx: usize) -> Result<i64> {
        if ndx >= self.len()? {
            return Err(Error::InvalidArgument("tree index out of range"));
        }
        subtree_get(self.map, self.root, ndx)
    }
}
