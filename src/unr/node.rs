use std::ops::Range;

use bitvec::prelude::*;

/// Number of units one bitmap chunk can track.
///
/// A chunk's bit storage is a fixed inline array, so converting a plain run
/// into a bitmap (and back) never touches the heap.
pub const BITMAP_BITS: usize = 256;

type BitmapWords = BitArr!(for BITMAP_BITS, in u64, Lsb0);

/// A run of ≤ [`BITMAP_BITS`] units with mixed state, tracked bit-by-bit.
/// A set bit is an allocated unit.
#[derive(Clone)]
pub(crate) struct BitmapRun {
    pub(crate) len: u32,
    pub(crate) busy: u32,
    bits: BitmapWords,
}

impl BitmapRun {
    /// Bitmap covering `len` units, every bit set (`busy`) or clear (`free`).
    pub(crate) fn filled(len: u32, busy: bool) -> Self {
        debug_assert!(0 < len && len as usize <= BITMAP_BITS);
        let mut bm = Self {
            len,
            busy: if busy { len } else { 0 },
            bits: BitArray::ZERO,
        };
        if busy {
            bm.set_range(0..len as usize, true);
        }
        bm
    }

    #[inline]
    pub(crate) fn bit(&self, i: usize) -> bool {
        debug_assert!(i < self.len as usize);
        self.bits[i]
    }

    #[inline]
    pub(crate) fn set_bit(&mut self, i: usize, value: bool) {
        debug_assert!(i < BITMAP_BITS);
        self.bits.set(i, value);
    }

    pub(crate) fn set_range(&mut self, range: Range<usize>, value: bool) {
        self.bits
            .get_mut(range)
            .expect("bit range within bitmap capacity")
            .fill(value);
    }

    /// Offset of the lowest free unit in the chunk, if any.
    #[inline]
    pub(crate) fn first_clear(&self) -> Option<usize> {
        self.bits[..self.len as usize].first_zero()
    }

    /// Set bits below `len`, recounted from the raw bit array.
    pub(crate) fn count_set(&self) -> usize {
        self.bits[..self.len as usize].count_ones()
    }
}

/// Discriminant of a [`Run`], detached from its payload so callers can
/// branch without holding a borrow on the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Free,
    Busy,
    Bitmap,
}

/// One entry of the ordered middle list: a maximal free run, a maximal
/// allocated run, or a bitmap chunk.
#[derive(Clone)]
pub(crate) enum Run {
    Free(u64),
    Busy(u64),
    Bitmap(BitmapRun),
}

impl Run {
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        match self {
            Run::Free(len) | Run::Busy(len) => *len,
            Run::Bitmap(bm) => u64::from(bm.len),
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Run::Free(_) => Kind::Free,
            Run::Busy(_) => Kind::Busy,
            Run::Bitmap(_) => Kind::Bitmap,
        }
    }

    /// Length if this is a plain allocated run.
    #[inline]
    pub(crate) fn as_busy(&self) -> Option<u64> {
        match self {
            Run::Busy(len) => Some(*len),
            _ => None,
        }
    }

    /// Length if this is a plain free run.
    #[inline]
    pub(crate) fn as_free(&self) -> Option<u64> {
        match self {
            Run::Free(len) => Some(*len),
            _ => None,
        }
    }

    /// Allocated units contributed by this run.
    #[inline]
    pub(crate) fn busy_units(&self) -> u64 {
        match self {
            Run::Free(_) => 0,
            Run::Busy(len) => *len,
            Run::Bitmap(bm) => u64::from(bm.busy),
        }
    }

    /// Two plain runs of the same kind can merge; bitmaps never merge here
    /// (adjacent bitmaps may exceed one chunk's capacity).
    #[inline]
    pub(crate) fn same_plain_kind(&self, other: &Run) -> bool {
        matches!(
            (self, other),
            (Run::Free(_), Run::Free(_)) | (Run::Busy(_), Run::Busy(_))
        )
    }

    /// Grow a plain run. Panics on a bitmap.
    #[inline]
    pub(crate) fn grow(&mut self, delta: u64) {
        match self {
            Run::Free(len) | Run::Busy(len) => *len += delta,
            Run::Bitmap(_) => unreachable!("grow on a bitmap chunk"),
        }
    }

    /// Shrink a plain run. Panics on a bitmap or underflow.
    #[inline]
    pub(crate) fn shrink(&mut self, delta: u64) {
        match self {
            Run::Free(len) | Run::Busy(len) => *len -= delta,
            Run::Bitmap(_) => unreachable!("shrink on a bitmap chunk"),
        }
    }

    /// Storage cost for the optimize pass: bitmaps weigh double to reflect
    /// their heavier footprint.
    #[inline]
    pub(crate) fn chunk_weight(&self) -> u32 {
        match self {
            Run::Free(_) | Run::Busy(_) => 1,
            Run::Bitmap(_) => 2,
        }
    }
}

pub(crate) type NodeIdx = u32;

/// Null link for the index-based list.
pub(crate) const NIL: NodeIdx = u32::MAX;

/// One arena slot: a run plus its list links. Free slots chain through
/// `next`; a slot on the deferred list does the same.
pub(crate) struct Slot {
    pub(crate) prev: NodeIdx,
    pub(crate) next: NodeIdx,
    pub(crate) run: Run,
}

/// Slab of list slots with an intrusive free list. Stable `u32` handles
/// stand in for the reference implementation's raw node pointers; growing
/// the backing `Vec` is the only operation here that touches the heap.
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free_head: NodeIdx,
    free_len: usize,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            free_len: 0,
        }
    }

    /// Make sure at least one free slot exists. May allocate; callers keep
    /// this out of the no-allocation paths.
    pub(crate) fn reserve_slot(&mut self) {
        if self.free_head == NIL {
            let idx = u32::try_from(self.slots.len()).expect("arena slot index overflow");
            assert!(idx != NIL, "arena slot index overflow");
            self.slots.push(Slot {
                prev: NIL,
                next: NIL,
                run: Run::Free(0),
            });
            self.free_head = idx;
            self.free_len = 1;
        }
    }

    /// Pop a slot off the free list. Panics if none was reserved.
    pub(crate) fn grab(&mut self) -> NodeIdx {
        let idx = self.free_head;
        assert!(idx != NIL, "arena free list exhausted without a reserve");
        self.free_head = self.slots[idx as usize].next;
        self.free_len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.prev = NIL;
        slot.next = NIL;
        idx
    }

    /// Return a slot to the free list.
    pub(crate) fn put(&mut self, idx: NodeIdx) {
        let slot = &mut self.slots[idx as usize];
        slot.run = Run::Free(0);
        slot.prev = NIL;
        slot.next = self.free_head;
        self.free_head = idx;
        self.free_len += 1;
    }

    #[inline]
    pub(crate) fn slot(&self, idx: NodeIdx) -> &Slot {
        &self.slots[idx as usize]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, idx: NodeIdx) -> &mut Slot {
        &mut self.slots[idx as usize]
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn free_len(&self) -> usize {
        self.free_len
    }
}

/// Up to two pre-obtained, unattached arena slots.
///
/// The free path may need to split an allocated run into three pieces, so it
/// takes its slots up front and the locked routines never grow the arena.
/// Spares must go back via [`UnitPool::return_spares`] (or be consumed by the
/// operation they were obtained for); the pool tracks them and `destroy`
/// refuses a pool with spares still outstanding.
///
/// [`UnitPool::return_spares`]: super::pool::UnitPool::return_spares
pub struct Spares {
    idx: [NodeIdx; 2],
    len: u8,
}

impl Spares {
    pub(crate) fn empty() -> Self {
        Self {
            idx: [NIL; 2],
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, idx: NodeIdx) {
        assert!((self.len as usize) < 2, "spare slot pair overfilled");
        self.idx[self.len as usize] = idx;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NodeIdx> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.idx[self.len as usize])
    }

    /// Spare slots not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        usize::from(self.len)
    }
}
