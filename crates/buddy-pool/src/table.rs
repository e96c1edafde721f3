//! Size-class table.
//!
//! The table holds one circular doubly-linked list per size class. A list
//! tracks both free and occupied blocks of its class, and each slot keeps a
//! running count of the free bytes on its list:
//!
//! ```text
//! slots[e]: head ──▶ ┌───────┐ ◀──▶ ┌───────┐ ◀──▶ ┌───────┐
//!   free_bytes       │ free  │      │ occ.  │      │ free  │ ──┐
//!   = 2 * 2^e        └───────┘      └───────┘      └───────┘   │
//!                        ▲─────────────────────────────────────┘
//! ```
//!
//! The free-byte counter of a class always equals `2^e` times the number of
//! free blocks on its list. Blocks are linked at the tail and searched from
//! the head.

use core::{iter::FusedIterator, marker::PhantomData, ptr};

use crate::{
    class::{CLASS_COUNT, SizeClass},
    header::{BlockHeader, BlockState},
};

#[derive(Debug, Clone, Copy)]
struct ClassSlot {
    head: *mut BlockHeader,
    free_bytes: usize,
}

impl ClassSlot {
    const EMPTY: Self = Self {
        head: ptr::null_mut(),
        free_bytes: 0,
    };
}

/// Per-class list heads and free-byte counters.
pub(crate) struct SizeClassTable {
    slots: [ClassSlot; CLASS_COUNT],
}

// The table exclusively owns the headers it links; they are never shared
// with another table.
unsafe impl Send for SizeClassTable {}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeClassTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [ClassSlot::EMPTY; CLASS_COUNT],
        }
    }

    fn slot(&self, class: SizeClass) -> &ClassSlot {
        &self.slots[class.index()]
    }

    fn slot_mut(&mut self, class: SizeClass) -> &mut ClassSlot {
        &mut self.slots[class.index()]
    }

    /// Returns `true` if no class holds any block.
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.head.is_null())
    }

    pub(crate) fn head(&self, class: SizeClass) -> *mut BlockHeader {
        self.slot(class).head
    }

    pub(crate) fn free_bytes(&self, class: SizeClass) -> usize {
        self.slot(class).free_bytes
    }

    /// Returns the smallest class at or above `class` that has a free block.
    pub(crate) fn first_available(&self, class: SizeClass) -> Option<SizeClass> {
        class.and_larger().find(|&class| {
            let slot = self.slot(class);
            !slot.head.is_null() && slot.free_bytes != 0
        })
    }

    /// Returns an iterator over the blocks linked in `class`, head first.
    pub(crate) fn blocks(&self, class: SizeClass) -> Blocks<'_> {
        let head = self.head(class);
        Blocks {
            head,
            next: head,
            _table: PhantomData,
        }
    }

    /// Returns the first free block of `class` in list order.
    pub(crate) fn find_free(&self, class: SizeClass) -> Option<*mut BlockHeader> {
        self.blocks(class)
            .find(|&block| unsafe { (*block).state.is_free() })
    }

    /// Links `block` at the tail of the list of its class.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `block` points to a live header owned by this table's pool
    /// - `block` is not linked in any list
    pub(crate) unsafe fn insert(&mut self, block: *mut BlockHeader) {
        unsafe {
            let class = (*block).class;
            let slot = self.slot_mut(class);
            if slot.head.is_null() {
                (*block).prev = block;
                (*block).next = block;
                slot.head = block;
            } else {
                let head = slot.head;
                let tail = (*head).prev;
                (*block).prev = tail;
                (*block).next = head;
                (*tail).next = block;
                (*head).prev = block;
            }
            if (*block).state.is_free() {
                slot.free_bytes += class.size();
            }
        }
    }

    /// Unlinks `block` from the list of its class.
    ///
    /// The block is left as a singleton list.
    ///
    /// # Safety
    ///
    /// `block` must be linked in the list of its class in this table.
    pub(crate) unsafe fn remove(&mut self, block: *mut BlockHeader) {
        unsafe {
            let class = (*block).class;
            let slot = self.slot_mut(class);
            if ptr::eq(slot.head, block) {
                slot.head = if ptr::eq((*block).next, block) {
                    ptr::null_mut()
                } else {
                    (*block).next
                };
            }
            (*(*block).prev).next = (*block).next;
            (*(*block).next).prev = (*block).prev;
            (*block).prev = block;
            (*block).next = block;
            if (*block).state.is_free() {
                slot.free_bytes -= class.size();
            }
        }
    }

    /// Marks a linked free block as occupied.
    ///
    /// # Safety
    ///
    /// `block` must be a free block linked in this table.
    pub(crate) unsafe fn mark_occupied(&mut self, block: *mut BlockHeader) {
        unsafe {
            debug_assert!((*block).state.is_free());
            (*block).state = BlockState::Occupied;
            self.slot_mut((*block).class).free_bytes -= (*block).class.size();
        }
    }

    /// Marks a linked occupied block as free.
    ///
    /// # Safety
    ///
    /// `block` must be an occupied block linked in this table.
    pub(crate) unsafe fn mark_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            debug_assert!((*block).state.is_occupied(), "block freed twice");
            (*block).state = BlockState::Free;
            self.slot_mut((*block).class).free_bytes += (*block).class.size();
        }
    }

    /// Marks every linked block as free and recomputes the free-byte
    /// counters.
    pub(crate) fn force_all_free(&mut self) {
        for class in SizeClass::all() {
            let mut count = 0;
            for block in self.blocks(class) {
                unsafe {
                    (*block).state = BlockState::Free;
                }
                count += 1;
            }
            self.slot_mut(class).free_bytes = count * class.size();
        }
    }

    /// Detaches every list from the table and returns the table to its empty
    /// state.
    ///
    /// Returns the detached list heads, indexed by class.
    pub(crate) fn take_all(&mut self) -> [*mut BlockHeader; CLASS_COUNT] {
        let slots = core::mem::replace(&mut self.slots, [ClassSlot::EMPTY; CLASS_COUNT]);
        slots.map(|slot| slot.head)
    }
}

/// Iterator over the blocks of one class list.
///
/// The table must not be modified while the iterator is alive, which the
/// borrow it holds guarantees.
pub(crate) struct Blocks<'a> {
    head: *mut BlockHeader,
    next: *mut BlockHeader,
    _table: PhantomData<&'a SizeClassTable>,
}

impl Blocks<'_> {
    /// Walks a detached list starting at `head`.
    ///
    /// # Safety
    ///
    /// `head` must be null or the head of a well-formed circular list whose
    /// headers stay live while the iterator is used.
    pub(crate) unsafe fn detached(head: *mut BlockHeader) -> Self {
        Self {
            head,
            next: head,
            _table: PhantomData,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = *mut BlockHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let current = self.next;
        let next = unsafe { (*current).next };
        self.next = if ptr::eq(next, self.head) {
            ptr::null_mut()
        } else {
            next
        };
        Some(current)
    }
}

impl FusedIterator for Blocks<'_> {}
