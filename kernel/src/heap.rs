//! Next-fit heap allocator over a fixed byte region, with an
//! address-ordered free list and immediate coalescing.
//!
//! Callers are responsible for running every [`Heap`] method inside a
//! critical section; this module only implements the data structure and
//! placement algorithm, grounded directly in the allocator this kernel
//! replaces (next-fit search starting at the last split point, splitting
//! off remainders no smaller than a header, merging with both neighbors
//! on return).

use core::cell::Cell;
use core::ptr::{self, NonNull};

use rtos_infra::list::{self, ListNode};
use rtos_kconfig::MEMORY_ALIGNMENT;

/// Header prefixed to every block, free or allocated. The same `link`
/// field threads the block onto the heap's free list while it is free, or
/// onto an owner's memory list while it is allocated — the two memberships
/// never overlap in time.
#[repr(C)]
struct BlockHeader {
    link: ListNode,
    size: usize,
}

fn header_size() -> usize {
    round_up(core::mem::size_of::<BlockHeader>())
}

/// Rounds `n` up to the nearest multiple of [`MEMORY_ALIGNMENT`].
pub fn round_up(n: usize) -> usize {
    let rem = n % MEMORY_ALIGNMENT;
    if rem == 0 {
        n
    } else {
        n + (MEMORY_ALIGNMENT - rem)
    }
}

fn block_link(block: NonNull<BlockHeader>) -> NonNull<ListNode> {
    unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*block.as_ptr()).link)) }
}

fn link_block(link: NonNull<ListNode>) -> NonNull<BlockHeader> {
    link.cast()
}

fn block_end(block: NonNull<BlockHeader>) -> *mut u8 {
    unsafe {
        (block.as_ptr() as *mut u8).add((*block.as_ptr()).size)
    }
}

/// A fixed-size heap. Must be initialized with [`Heap::init`] before use,
/// which hands over ownership of the backing region.
pub struct Heap {
    first: Cell<Option<NonNull<BlockHeader>>>,
    current: Cell<Option<NonNull<BlockHeader>>>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            first: Cell::new(None),
            current: Cell::new(None),
        }
    }

    /// Carves the region `[start, start + len)` into a single free block
    /// and makes it the whole heap. `start` must already satisfy
    /// [`MEMORY_ALIGNMENT`]; `len` must be at least one header's worth.
    ///
    /// # Safety
    /// `start .. start + len` must be writable memory with no other owner
    /// for the lifetime of this heap.
    pub unsafe fn init(&self, start: *mut u8, len: usize) {
        debug_assert!(start as usize % MEMORY_ALIGNMENT == 0);
        debug_assert!(len >= header_size());

        let block = start as *mut BlockHeader;
        let mut link = NonNull::new_unchecked(ptr::addr_of_mut!((*block).link));
        link.as_mut().init();
        (*block).size = len - (len % MEMORY_ALIGNMENT);

        let block = NonNull::new_unchecked(block);
        self.first.set(Some(block));
        self.current.set(Some(block));
    }

    fn insert_to_heap(&self, block: NonNull<BlockHeader>) {
        let link = block_link(block);
        match self.first.get() {
            None => {
                self.first.set(Some(block));
                self.current.set(Some(block));
            }
            Some(first) => {
                if block.as_ptr() < first.as_ptr() {
                    unsafe { list::insert_before(block_link(first), link) };
                    self.first.set(Some(block));
                } else {
                    let last = unsafe { block_link(first).as_ref().raw_prev() };
                    if block.as_ptr() > link_block(last).as_ptr() {
                        unsafe { list::insert_before(block_link(first), link) };
                    } else {
                        let mut cursor = unsafe { block_link(first).as_ref().raw_next() };
                        loop {
                            if block.as_ptr() < link_block(cursor).as_ptr() {
                                break;
                            }
                            cursor = unsafe { cursor.as_ref().raw_next() };
                        }
                        unsafe { list::insert_before(cursor, link) };
                    }
                }
            }
        }
    }

    fn remove_from_heap(&self, block: NonNull<BlockHeader>) {
        let link = block_link(block);
        // A self-referencing node here means "the only block in the
        // heap", not "not linked" — a one-member ring looks identical to
        // a detached node, so this is not an error case.
        let next = unsafe { link.as_ref().raw_next() };
        if ptr::eq(next.as_ptr(), link.as_ptr()) {
            self.first.set(None);
            self.current.set(None);
        } else {
            if self.first.get().map(|f| f.as_ptr()) == Some(block.as_ptr()) {
                self.first.set(Some(link_block(next)));
            }
            if self.current.get().map(|c| c.as_ptr()) == Some(block.as_ptr()) {
                self.current.set(Some(link_block(next)));
            }
        }
        unsafe { list::remove(link) };
    }

    /// Merges `block` with an adjacent next and/or previous free block.
    /// Returns the (possibly different) block that now represents the
    /// merged region.
    fn merge_in_heap(&self, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let mut result = block;

        let next = unsafe { block_link(result).as_ref().raw_next() };
        if !ptr::eq(next.as_ptr(), block_link(result).as_ptr()) {
            let next_block = link_block(next);
            if block_end(result) as *const u8 == next_block.as_ptr() as *const u8 {
                if self.current.get().map(|c| c.as_ptr()) == Some(next_block.as_ptr()) {
                    self.current.set(Some(result));
                }
                if self.first.get().map(|f| f.as_ptr()) == Some(next_block.as_ptr()) {
                    self.first.set(Some(result));
                }
                unsafe {
                    (*result.as_ptr()).size += (*next_block.as_ptr()).size;
                }
                self.remove_from_heap(next_block);
            }
        }

        let prev = unsafe { block_link(result).as_ref().raw_prev() };
        if !ptr::eq(prev.as_ptr(), block_link(result).as_ptr()) {
            let prev_block = link_block(prev);
            if block_end(prev_block) as *const u8 == result.as_ptr() as *const u8 {
                if self.current.get().map(|c| c.as_ptr()) == Some(result.as_ptr()) {
                    self.current.set(Some(prev_block));
                }
                if self.first.get().map(|f| f.as_ptr()) == Some(result.as_ptr()) {
                    self.first.set(Some(prev_block));
                }
                unsafe {
                    (*prev_block.as_ptr()).size += (*result.as_ptr()).size;
                }
                self.remove_from_heap(result);
                result = prev_block;
            }
        }

        result
    }

    fn return_to_heap(&self, block: NonNull<BlockHeader>) {
        self.insert_to_heap(block);
        self.merge_in_heap(block);
    }

    fn split(block: NonNull<BlockHeader>, size: usize) -> NonNull<BlockHeader> {
        unsafe {
            let total = (*block.as_ptr()).size;
            debug_assert!(total > size);
            debug_assert!(total - size >= header_size());

            let new_block = (block.as_ptr() as *mut u8).add(size) as *mut BlockHeader;
            let mut link = NonNull::new_unchecked(ptr::addr_of_mut!((*new_block).link));
            link.as_mut().init();
            (*new_block).size = total - size;
            (*block.as_ptr()).size = size;

            NonNull::new_unchecked(new_block)
        }
    }

    fn get_block(&self, size: usize) -> Option<NonNull<BlockHeader>> {
        let needed = round_up(size + header_size());
        let start = self.current.get()?;

        let mut cursor = start;
        loop {
            let cur_size = unsafe { (*cursor.as_ptr()).size };
            if needed <= cur_size {
                let remaining = cur_size - needed;
                if remaining >= header_size() {
                    let new_block = Self::split(cursor, needed);
                    self.insert_to_heap(new_block);
                    self.current.set(Some(new_block));
                }
                self.remove_from_heap(cursor);
                return Some(cursor);
            }
            let next = unsafe { block_link(cursor).as_ref().raw_next() };
            let next_block = link_block(next);
            if ptr::eq(next_block.as_ptr(), start.as_ptr()) {
                return None;
            }
            cursor = next_block;
        }
    }

    fn find_block_at(&self, addr: *mut u8) -> Option<NonNull<BlockHeader>> {
        let first = self.first.get()?;
        let mut cursor = first;
        loop {
            if cursor.as_ptr() as *mut u8 == addr {
                return Some(cursor);
            }
            let next = unsafe { block_link(cursor).as_ref().raw_next() };
            let next_block = link_block(next);
            if ptr::eq(next_block.as_ptr(), first.as_ptr()) {
                return None;
            }
            cursor = next_block;
        }
    }

    fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((block.as_ptr() as *mut u8).add(header_size())) }
    }

    fn block_of(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(header_size()) as *mut BlockHeader) }
    }

    /// Allocates `size` bytes, linking the new block into `owner` (a
    /// memory-list head) instead of leaving it untracked.
    pub fn allocate(&self, size: usize, owner: NonNull<ListNode>) -> Option<NonNull<u8>> {
        let block = self.get_block(size)?;
        unsafe { list::insert_before(owner, block_link(block)) };
        Some(Self::payload_of(block))
    }

    /// Returns `payload` to the heap. The caller must separately unlink it
    /// from whatever memory list it was linked into — a head node carries
    /// no extra bookkeeping here, so removal never needs it.
    ///
    /// # Safety
    /// `payload` must be a live allocation previously returned by
    /// [`Heap::allocate`] or [`Heap::reallocate`] from this heap.
    pub unsafe fn free(&self, payload: NonNull<u8>) {
        let block = Self::block_of(payload);
        list::remove(block_link(block));
        self.return_to_heap(block);
    }

    /// Frees every block linked into `owner`, for bulk reclamation when a
    /// thread (or other allocation owner) is destroyed.
    ///
    /// # Safety
    /// Every node linked into `owner` must be a live block header from
    /// this heap.
    pub unsafe fn free_all(&self, owner: NonNull<ListNode>) {
        while let Some(link) = list::pop_front(owner) {
            self.return_to_heap(link_block(link));
        }
    }

    /// Size in bytes usable by the caller, which may exceed the size
    /// originally requested due to rounding.
    ///
    /// # Safety
    /// `payload` must be a live allocation from this heap.
    pub unsafe fn usable_size(&self, payload: NonNull<u8>) -> usize {
        let block = Self::block_of(payload);
        (*block.as_ptr()).size - header_size()
    }

    /// Grows or shrinks an allocation in place when possible, otherwise
    /// allocates fresh, copies, and frees the old block. `payload = None`
    /// behaves as `allocate`; `new_size == 0` frees and returns `None`.
    ///
    /// # Safety
    /// `payload`, if present, must be a live allocation from this heap
    /// linked into `owner`.
    pub unsafe fn reallocate(
        &self,
        payload: Option<NonNull<u8>>,
        new_size: usize,
        owner: NonNull<ListNode>,
    ) -> Option<NonNull<u8>> {
        let payload = match payload {
            None => return self.allocate(new_size, owner),
            Some(p) => p,
        };
        if new_size == 0 {
            self.free(payload);
            return None;
        }

        let block = Self::block_of(payload);
        let current_size = (*block.as_ptr()).size;
        let target_size = round_up(new_size + header_size());

        if target_size == current_size {
            return Some(payload);
        }

        if target_size > current_size {
            let missing = target_size - current_size;
            if let Some(next) = self.find_block_at(block_end(block)) {
                let next_size = (*next.as_ptr()).size;
                if next_size >= missing {
                    if next_size - missing >= header_size() {
                        let tail = Self::split(next, missing);
                        self.insert_to_heap(tail);
                        if self.current.get().map(|c| c.as_ptr()) == Some(next.as_ptr()) {
                            self.current.set(Some(tail));
                        }
                        self.remove_from_heap(next);
                        (*block.as_ptr()).size = target_size;
                    } else {
                        self.remove_from_heap(next);
                        (*block.as_ptr()).size += next_size;
                    }
                    return Some(payload);
                }
            }

            let new_payload = self.allocate(new_size, owner)?;
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                new_payload.as_ptr(),
                current_size - header_size(),
            );
            self.free(payload);
            Some(new_payload)
        } else {
            let spare = current_size - target_size;
            if spare >= header_size() {
                let tail = Self::split(block, target_size);
                self.return_to_heap(tail);
            }
            Some(payload)
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
