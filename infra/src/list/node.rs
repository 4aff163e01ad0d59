use core::cell::Cell;
use core::ptr::{self, NonNull};

/// An intrusive doubly linked list node.
///
/// Embed this as a field of the struct that needs to be linkable. A
/// detached node has `next` and `prev` pointing at itself, which doubles
/// as the empty-list representation when a `ListNode` is used as a list
/// head: a head with no members is simply a detached node.
#[repr(C)]
pub struct ListNode {
    next: Cell<NonNull<ListNode>>,
    prev: Cell<NonNull<ListNode>>,
}

// Single-CPU kernel: all access happens with interrupts masked or from a
// single thread of control, so sharing these cells across the `Send`
// boundary is sound even though `Cell` alone would forbid it.
unsafe impl Send for ListNode {}
unsafe impl Sync for ListNode {}

impl ListNode {
    /// Creates a detached node.
    pub const fn new() -> Self {
        // Filled in properly by `init`; a node must never be read before
        // that, since `NonNull::dangling` is not a real self-pointer.
        Self {
            next: Cell::new(NonNull::dangling()),
            prev: Cell::new(NonNull::dangling()),
        }
    }

    /// Makes `self` point at itself. Must be called once, after the node
    /// has reached its final address (kernel objects live in the heap or
    /// in `static` storage and never move once initialized).
    pub fn init(self: &mut Self) {
        let me = NonNull::from(&*self);
        self.next.set(me);
        self.prev.set(me);
    }

    /// True if `self` is not linked to any other node (includes: is an
    /// empty list head).
    pub fn is_detached(&self) -> bool {
        ptr::eq(self.next.get().as_ptr(), self)
    }

    /// Next node, or `None` if `self` is a list head with no members (or
    /// is itself detached).
    ///
    /// # Safety
    /// Caller must ensure the returned pointer outlives its use; intrusive
    /// lists do not borrow-check across node boundaries.
    pub unsafe fn next(&self) -> Option<NonNull<ListNode>> {
        if self.is_detached() {
            None
        } else {
            Some(self.next.get())
        }
    }

    /// Previous node, or `None` symmetric to [`ListNode::next`].
    ///
    /// # Safety
    /// Same caveat as [`ListNode::next`].
    pub unsafe fn prev(&self) -> Option<NonNull<ListNode>> {
        if self.is_detached() {
            None
        } else {
            Some(self.prev.get())
        }
    }

    /// Next pointer without the head-of-empty-list interpretation: for a
    /// solo node (the only member of a headless ring, as in the heap's
    /// address-ordered free list) this returns the node itself rather than
    /// `None`, since there is no separate head to distinguish "empty" from
    /// "one member".
    ///
    /// # Safety
    /// Same caveat as [`ListNode::next`].
    pub unsafe fn raw_next(&self) -> NonNull<ListNode> {
        self.next.get()
    }

    /// Previous pointer, symmetric to [`ListNode::raw_next`].
    ///
    /// # Safety
    /// Same caveat as [`ListNode::next`].
    pub unsafe fn raw_prev(&self) -> NonNull<ListNode> {
        self.prev.get()
    }
}

impl Default for ListNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Links `node` into the list immediately after `anchor`.
///
/// # Safety
/// `node` must be detached. `anchor` must be part of a valid list (or be a
/// list head).
pub unsafe fn insert_after(anchor: NonNull<ListNode>, node: NonNull<ListNode>) {
    debug_assert!((*node.as_ptr()).is_detached());

    let anchor_ref = &*anchor.as_ptr();
    let old_next = anchor_ref.next.get();
    let node_ref = &*node.as_ptr();

    node_ref.prev.set(anchor);
    node_ref.next.set(old_next);
    (*old_next.as_ptr()).prev.set(node);
    anchor_ref.next.set(node);
}

/// Links `node` into the list immediately before `anchor`.
///
/// # Safety
/// Same requirements as [`insert_after`].
pub unsafe fn insert_before(anchor: NonNull<ListNode>, node: NonNull<ListNode>) {
    debug_assert!((*node.as_ptr()).is_detached());

    let anchor_ref = &*anchor.as_ptr();
    let old_prev = anchor_ref.prev.get();
    let node_ref = &*node.as_ptr();

    node_ref.next.set(anchor);
    node_ref.prev.set(old_prev);
    (*old_prev.as_ptr()).next.set(node);
    anchor_ref.prev.set(node);
}

/// Unlinks `node`, leaving it detached. No-op if already detached.
///
/// # Safety
/// `node` must be either detached or a member of a valid list.
pub unsafe fn remove(node: NonNull<ListNode>) {
    let node_ref = &*node.as_ptr();
    if node_ref.is_detached() {
        return;
    }
    let next = node_ref.next.get();
    let prev = node_ref.prev.get();
    (*next.as_ptr()).prev.set(prev);
    (*prev.as_ptr()).next.set(next);
    node_ref.next.set(node);
    node_ref.prev.set(node);
}

/// True if `head` has no members.
///
/// # Safety
/// `head` must be a valid, initialized node.
pub unsafe fn is_empty(head: NonNull<ListNode>) -> bool {
    (*head.as_ptr()).is_detached()
}

/// Unlinks and returns the first member of the list rooted at `head`.
///
/// # Safety
/// `head` must be a valid list head.
pub unsafe fn pop_front(head: NonNull<ListNode>) -> Option<NonNull<ListNode>> {
    let first = (*head.as_ptr()).next()?;
    remove(first);
    Some(first)
}

/// Unlinks and returns the last member of the list rooted at `head`.
///
/// # Safety
/// `head` must be a valid list head.
pub unsafe fn pop_back(head: NonNull<ListNode>) -> Option<NonNull<ListNode>> {
    let last = (*head.as_ptr()).prev()?;
    remove(last);
    Some(last)
}

/// Inserts `node` into the list rooted at `head`, kept sorted ascending by
/// `key_of`. Among members with a key equal to `key`, `node` is placed
/// after all of them (first-in-first-out for ties).
///
/// This walks the list from the front and stops at the first member whose
/// key is strictly greater than `key`, matching a ready list or timer list
/// scanned from the highest-priority / earliest-deadline end.
///
/// # Safety
/// `head` must be a valid list head; `node` must be detached; `key_of`
/// must be safe to call with any live member of the list.
pub unsafe fn insert_by_key(
    head: NonNull<ListNode>,
    node: NonNull<ListNode>,
    key: u32,
    key_of: impl Fn(NonNull<ListNode>) -> u32,
) {
    debug_assert!((*node.as_ptr()).is_detached());

    let mut cursor = head;
    loop {
        let next = match (*cursor.as_ptr()).next() {
            Some(n) if !ptr::eq(n.as_ptr(), head.as_ptr()) => n,
            _ => {
                insert_after(cursor, node);
                return;
            }
        };
        if key_of(next) > key {
            insert_before(next, node);
            return;
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell as StdCell;

    fn boxed(node: ListNode) -> NonNull<ListNode> {
        let boxed = Box::new(node);
        let mut ptr = NonNull::new(Box::into_raw(boxed)).unwrap();
        unsafe { ptr.as_mut().init() };
        ptr
    }

    fn free(ptr: NonNull<ListNode>) {
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    #[test]
    fn fresh_node_is_detached() {
        let head = boxed(ListNode::new());
        unsafe {
            assert!(is_empty(head));
            assert!((*head.as_ptr()).next().is_none());
            assert!((*head.as_ptr()).prev().is_none());
        }
        free(head);
    }

    #[test]
    fn push_back_preserves_order() {
        let head = boxed(ListNode::new());
        let a = boxed(ListNode::new());
        let b = boxed(ListNode::new());

        unsafe {
            insert_before(head, a);
            insert_before(head, b);

            let first = (*head.as_ptr()).next().unwrap();
            assert!(ptr::eq(first.as_ptr(), a.as_ptr()));
            let second = (*first.as_ptr()).next().unwrap();
            assert!(ptr::eq(second.as_ptr(), b.as_ptr()));
            assert!(ptr::eq(
                (*second.as_ptr()).next().unwrap().as_ptr(),
                head.as_ptr()
            ));

            remove(a);
            remove(b);
        }
        free(a);
        free(b);
        free(head);
    }

    #[test]
    fn remove_is_idempotent() {
        let head = boxed(ListNode::new());
        let a = boxed(ListNode::new());
        unsafe {
            insert_after(head, a);
            remove(a);
            assert!((*a.as_ptr()).is_detached());
            remove(a);
            assert!((*a.as_ptr()).is_detached());
            assert!(is_empty(head));
        }
        free(a);
        free(head);
    }

    #[test]
    fn pop_front_and_back_unlink() {
        let head = boxed(ListNode::new());
        let a = boxed(ListNode::new());
        let b = boxed(ListNode::new());
        let c = boxed(ListNode::new());
        unsafe {
            insert_before(head, a);
            insert_before(head, b);
            insert_before(head, c);

            let front = pop_front(head).unwrap();
            assert!(ptr::eq(front.as_ptr(), a.as_ptr()));
            let back = pop_back(head).unwrap();
            assert!(ptr::eq(back.as_ptr(), c.as_ptr()));
            assert!(!is_empty(head));
            let last = pop_front(head).unwrap();
            assert!(ptr::eq(last.as_ptr(), b.as_ptr()));
            assert!(is_empty(head));
        }
        free(a);
        free(b);
        free(c);
        free(head);
    }

    struct KeyedNode {
        link: ListNode,
        key: StdCell<u32>,
    }

    fn keyed(key: u32) -> NonNull<KeyedNode> {
        let boxed = Box::new(KeyedNode {
            link: ListNode::new(),
            key: StdCell::new(key),
        });
        let mut ptr = NonNull::new(Box::into_raw(boxed)).unwrap();
        unsafe {
            let link = NonNull::from(&mut ptr.as_mut().link);
            (*link.as_ptr()).init();
        }
        ptr
    }

    fn key_of(node: NonNull<ListNode>) -> u32 {
        unsafe { (*node.cast::<KeyedNode>().as_ptr()).key.get() }
    }

    fn link_of(node: NonNull<KeyedNode>) -> NonNull<ListNode> {
        unsafe { NonNull::from(&mut (*node.as_ptr()).link) }
    }

    #[test]
    fn insert_by_key_orders_ascending_and_fifo_among_ties() {
        let head = boxed(ListNode::new());
        let five_a = keyed(5);
        let one = keyed(1);
        let five_b = keyed(5);
        let three = keyed(3);

        unsafe {
            insert_by_key(head, link_of(five_a), 5, key_of);
            insert_by_key(head, link_of(one), 1, key_of);
            insert_by_key(head, link_of(five_b), 5, key_of);
            insert_by_key(head, link_of(three), 3, key_of);

            let mut seen: std::vec::Vec<u32> = std::vec::Vec::new();
            let mut cursor = (*head.as_ptr()).next();
            while let Some(n) = cursor {
                seen.push(key_of(n));
                let next = (*n.as_ptr()).next.get();
                if ptr::eq(next.as_ptr(), head.as_ptr()) {
                    break;
                }
                cursor = Some(next);
            }
            assert_eq!(seen, std::vec![1, 3, 5, 5]);

            let first_five = (*link_of(one).as_ptr()).next().unwrap();
            assert!(ptr::eq(first_five.as_ptr(), link_of(five_a).as_ptr()));

            remove(link_of(five_a));
            remove(link_of(one));
            remove(link_of(five_b));
            remove(link_of(three));
        }
        free_keyed(five_a);
        free_keyed(one);
        free_keyed(five_b);
        free_keyed(three);
        free(head);
    }

    fn free_keyed(ptr: NonNull<KeyedNode>) {
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    use std::boxed::Box;
}
