//! Byte-oriented ring-buffer queue. Producers and consumers that don't fit
//! block on separate waiter lists; whenever space or data changes, an
//! equation solver walks both lists looking for transfers it can now
//! satisfy.
//!
//! Besides the regular FIFO send/receive, a queue also supports a
//! priority-jump pair: `send_ahead` writes a message to the *front* of the
//! ring instead of the back (so it is the next thing read out, jumping
//! ahead of whatever is already buffered) and `receive_behind` consumes a
//! message from the back instead of the front. Each has its own waiter
//! list; the solver picks whichever of a regular/jump pair has the
//! higher-priority waiter at its head, falling to the regular side on ties.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use rtos_arch::Port;
use rtos_infra::list::{self, ListNode};

use crate::critical;
use crate::sched::Kernel;
use crate::thread::{priority_key_of, Thread};

struct WaitDescriptor {
    data: *mut u8,
    len: usize,
    result: Cell<bool>,
}

/// A fixed-capacity byte queue with blocking send/receive.
pub struct Queue<P: Port> {
    buffer: Cell<Option<NonNull<u8>>>,
    /// Ring capacity in bytes, one larger than the usable capacity so full
    /// and empty are distinguishable without a separate counter.
    size: Cell<usize>,
    read: Cell<usize>,
    write: Cell<usize>,
    writers: ListNode,
    readers: ListNode,
    /// Waiters for [`Queue::send_ahead`]/[`Queue::send_ahead_non_block`].
    writers_ahead: ListNode,
    /// Waiters for [`Queue::receive_behind`]/[`Queue::receive_behind_non_block`].
    readers_behind: ListNode,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for Queue<P> {}
unsafe impl<P: Port> Sync for Queue<P> {}

impl<P: Port> Queue<P> {
    const fn new() -> Self {
        Self {
            buffer: Cell::new(None),
            size: Cell::new(0),
            read: Cell::new(0),
            write: Cell::new(0),
            writers: ListNode::new(),
            readers: ListNode::new(),
            writers_ahead: ListNode::new(),
            readers_behind: ListNode::new(),
            _port: PhantomData,
        }
    }

    unsafe fn init(&mut self) {
        self.writers.init();
        self.readers.init();
        self.writers_ahead.init();
        self.readers_behind.init();
    }

    fn writers(&self) -> NonNull<ListNode> {
        NonNull::from(&self.writers)
    }

    fn readers(&self) -> NonNull<ListNode> {
        NonNull::from(&self.readers)
    }

    fn writers_ahead(&self) -> NonNull<ListNode> {
        NonNull::from(&self.writers_ahead)
    }

    fn readers_behind(&self) -> NonNull<ListNode> {
        NonNull::from(&self.readers_behind)
    }

    fn used(&self) -> usize {
        let size = self.size.get();
        (self.write.get() + size - self.read.get()) % size
    }

    fn free(&self) -> usize {
        self.get_size() - self.used()
    }

    /// Usable capacity: one less than the ring's raw byte count.
    pub fn get_size(&self) -> usize {
        self.size.get() - 1
    }

    pub unsafe fn get_used(&self, kernel: &'static Kernel<P>) -> usize {
        let _g = critical::enter::<P>(&kernel.critical);
        self.used()
    }

    pub unsafe fn get_free(&self, kernel: &'static Kernel<P>) -> usize {
        let _g = critical::enter::<P>(&kernel.critical);
        self.free()
    }

    unsafe fn write_bytes(&self, data: *const u8, len: usize) {
        let buffer = self.buffer.get().unwrap().as_ptr();
        let size = self.size.get();
        let mut pos = self.write.get();
        for i in 0..len {
            ptr::write(buffer.add(pos), *data.add(i));
            pos = (pos + 1) % size;
        }
        self.write.set(pos);
    }

    unsafe fn read_bytes(&self, data: *mut u8, len: usize) {
        let buffer = self.buffer.get().unwrap().as_ptr();
        let size = self.size.get();
        let mut pos = self.read.get();
        for i in 0..len {
            *data.add(i) = ptr::read(buffer.add(pos));
            pos = (pos + 1) % size;
        }
        self.read.set(pos);
    }

    /// Writes `len` bytes to the front of the ring, one byte per step of
    /// `read` walked backward, so the message becomes the next thing a
    /// regular receive pulls out. Each byte lands immediately behind the
    /// previous one, so the message is stored back-to-front: a multi-byte
    /// `send_ahead` is read back in reverse order, matching
    /// `queue_writeAhead` in the source this is ported from.
    unsafe fn write_ahead_bytes(&self, data: *const u8, len: usize) {
        let buffer = self.buffer.get().unwrap().as_ptr();
        let size = self.size.get();
        let mut pos = self.read.get();
        for i in 0..len {
            pos = if pos > 0 { pos - 1 } else { size - 1 };
            ptr::write(buffer.add(pos), *data.add(i));
        }
        self.read.set(pos);
    }

    /// Reads `len` bytes from the back of the ring, one byte per step of
    /// `write` walked backward. Symmetric to [`Queue::write_ahead_bytes`]:
    /// consumes the most recently written bytes first, in reverse order.
    unsafe fn read_behind_bytes(&self, data: *mut u8, len: usize) {
        let buffer = self.buffer.get().unwrap().as_ptr();
        let size = self.size.get();
        let mut pos = self.write.get();
        for i in 0..len {
            pos = if pos > 0 { pos - 1 } else { size - 1 };
            *data.add(i) = ptr::read(buffer.add(pos));
        }
        self.write.set(pos);
    }

    /// Repeatedly tries to satisfy a pending write, then a pending read,
    /// until neither side makes progress. Each side has a regular and a
    /// "jump" waiter list (ahead for writes, behind for reads); when both
    /// have a waiter, the one with the strictly higher-priority head wins,
    /// with the regular list winning ties. Waiters that don't yet fit are
    /// left in place rather than popped and requeued, preserving FIFO
    /// order among same-priority waiters.
    unsafe fn solve(&self, kernel: &'static Kernel<P>) {
        let mut can_write = true;
        let mut can_read = true;

        while can_write || can_read {
            if can_write {
                match self.pick_writer() {
                    None => can_write = false,
                    Some((link, ahead)) => {
                        let thread = Thread::from_scheduler_link(link);
                        let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                        if self.free() >= (*desc).len {
                            list::remove(link);
                            if ahead {
                                self.write_ahead_bytes((*desc).data, (*desc).len);
                            } else {
                                self.write_bytes((*desc).data, (*desc).len);
                            }
                            (*desc).result.set(true);
                            kernel.ready_thread(thread);
                            can_read = true;
                        } else {
                            can_write = false;
                        }
                    }
                }
            }

            if can_read {
                match self.pick_reader() {
                    None => can_read = false,
                    Some((link, behind)) => {
                        let thread = Thread::from_scheduler_link(link);
                        let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                        if self.used() >= (*desc).len {
                            list::remove(link);
                            if behind {
                                self.read_behind_bytes((*desc).data, (*desc).len);
                            } else {
                                self.read_bytes((*desc).data, (*desc).len);
                            }
                            (*desc).result.set(true);
                            kernel.ready_thread(thread);
                            can_write = true;
                        } else {
                            can_read = false;
                        }
                    }
                }
            }
        }
        kernel.reschedule();
    }

    /// Picks which of the regular/ahead writer lists should go next: the
    /// other list's head if one list is empty, otherwise whichever head
    /// has the (strictly) higher priority, with the regular list winning
    /// ties. `true` in the result means the ahead list was picked.
    unsafe fn pick_writer(&self) -> Option<(NonNull<ListNode>, bool)> {
        match (self.writers.next(), self.writers_ahead.next()) {
            (Some(regular), Some(ahead)) => {
                if priority_key_of(regular) < priority_key_of(ahead) {
                    Some((regular, false))
                } else {
                    Some((ahead, true))
                }
            }
            (Some(regular), None) => Some((regular, false)),
            (None, Some(ahead)) => Some((ahead, true)),
            (None, None) => None,
        }
    }

    /// Symmetric to [`Queue::pick_writer`] for the regular/behind reader
    /// lists.
    unsafe fn pick_reader(&self) -> Option<(NonNull<ListNode>, bool)> {
        match (self.readers.next(), self.readers_behind.next()) {
            (Some(regular), Some(behind)) => {
                if priority_key_of(regular) < priority_key_of(behind) {
                    Some((regular, false))
                } else {
                    Some((behind, true))
                }
            }
            (Some(regular), None) => Some((regular, false)),
            (None, Some(behind)) => Some((behind, true)),
            (None, None) => None,
        }
    }

    /// Allocates the queue control block and its ring buffer (`capacity +
    /// 1` bytes) from the kernel heap. Rolls back the control-block
    /// allocation if the buffer allocation fails.
    ///
    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(kernel: &'static Kernel<P>, capacity: usize) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new());
        let mut queue = NonNull::new_unchecked(ptr);
        queue.as_mut().init();

        let buffer = match kernel.heap().allocate(capacity + 1, kernel.kernel_memory()) {
            Some(buffer) => buffer,
            None => {
                kernel.heap().free(NonNull::new_unchecked(ptr as *mut u8));
                return None;
            }
        };
        queue.as_ref().buffer.set(Some(buffer));
        queue.as_ref().size.set(capacity + 1);
        Some(queue)
    }

    /// Wakes every waiter on both lists (their descriptors stay `false`)
    /// and frees the control block and its ring buffer.
    ///
    /// # Safety
    /// `queue` must be a live queue from [`Queue::create`], never used
    /// again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, queue: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        kernel.ready_all(queue.as_ref().readers_behind());
        kernel.ready_all(queue.as_ref().readers());
        kernel.ready_all(queue.as_ref().writers_ahead());
        kernel.ready_all(queue.as_ref().writers());
        kernel.reschedule();
        if let Some(buffer) = queue.as_ref().buffer.get() {
            kernel.heap().free(buffer);
        }
        kernel.heap().free(NonNull::new_unchecked(queue.as_ptr() as *mut u8));
    }

    /// Sends `len` bytes from `data`, blocking for up to `timeout` ticks
    /// (`0` = forever) until enough room frees up.
    ///
    /// # Safety
    /// `data` must be valid for `len` reads for the duration of the call
    /// (including while blocked). `self` must be initialized.
    pub unsafe fn send(&self, kernel: &'static Kernel<P>, data: *const u8, len: usize, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.writers()) && self.free() >= len {
            self.write_bytes(data, len);
            self.solve(kernel);
            return true;
        }
        let desc = WaitDescriptor {
            data: data as *mut u8,
            len,
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.writers()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Queue::send`] but never blocks.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn send_non_block(&self, kernel: &'static Kernel<P>, data: *const u8, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.writers()) && self.free() >= len {
            self.write_bytes(data, len);
            self.solve(kernel);
            true
        } else {
            false
        }
    }

    /// Sends `len` bytes to the *front* of the queue instead of the back,
    /// so they become the next thing a regular receive pulls out, jumping
    /// ahead of whatever is already buffered. Blocks for up to `timeout`
    /// ticks (`0` = forever) until enough room frees up; see
    /// [`Queue::write_ahead_bytes`] for why a multi-byte message is stored
    /// (and read back) reversed.
    ///
    /// # Safety
    /// `data` must be valid for `len` reads for the duration of the call
    /// (including while blocked). `self` must be initialized.
    pub unsafe fn send_ahead(&self, kernel: &'static Kernel<P>, data: *const u8, len: usize, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.writers_ahead()) && self.free() >= len {
            self.write_ahead_bytes(data, len);
            self.solve(kernel);
            return true;
        }
        let desc = WaitDescriptor {
            data: data as *mut u8,
            len,
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.writers_ahead()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Queue::send_ahead`] but never blocks.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn send_ahead_non_block(&self, kernel: &'static Kernel<P>, data: *const u8, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.writers_ahead()) && self.free() >= len {
            self.write_ahead_bytes(data, len);
            self.solve(kernel);
            true
        } else {
            false
        }
    }

    /// Receives `len` bytes into `data`, blocking for up to `timeout`
    /// ticks (`0` = forever) until enough data is available.
    ///
    /// # Safety
    /// `data` must be valid for `len` writes for the duration of the call
    /// (including while blocked). `self` must be initialized.
    pub unsafe fn receive(&self, kernel: &'static Kernel<P>, data: *mut u8, len: usize, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.readers()) && self.used() >= len {
            self.read_bytes(data, len);
            self.solve(kernel);
            return true;
        }
        let desc = WaitDescriptor {
            data,
            len,
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.readers()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Queue::receive`] but never blocks.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn receive_non_block(&self, kernel: &'static Kernel<P>, data: *mut u8, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.readers()) && self.used() >= len {
            self.read_bytes(data, len);
            self.solve(kernel);
            true
        } else {
            false
        }
    }

    /// Receives `len` bytes from the *back* of the queue instead of the
    /// front, consuming the most recently written bytes first. Blocks for
    /// up to `timeout` ticks (`0` = forever) until enough data is
    /// available; see [`Queue::read_behind_bytes`] for why a multi-byte
    /// message comes out reversed.
    ///
    /// # Safety
    /// `data` must be valid for `len` writes for the duration of the call
    /// (including while blocked). `self` must be initialized.
    pub unsafe fn receive_behind(&self, kernel: &'static Kernel<P>, data: *mut u8, len: usize, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.readers_behind()) && self.used() >= len {
            self.read_behind_bytes(data, len);
            self.solve(kernel);
            return true;
        }
        let desc = WaitDescriptor {
            data,
            len,
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.readers_behind()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Queue::receive_behind`] but never blocks.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn receive_behind_non_block(&self, kernel: &'static Kernel<P>, data: *mut u8, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if list::is_empty(self.readers_behind()) && self.used() >= len {
            self.read_behind_bytes(data, len);
            self.solve(kernel);
            true
        } else {
            false
        }
    }

    /// `true` if a send of `len` bytes would not need to block right now.
    pub unsafe fn peek_send(&self, kernel: &'static Kernel<P>, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        self.free() >= len
    }

    /// `true` if a receive of `len` bytes would not need to block right
    /// now.
    pub unsafe fn peek_receive(&self, kernel: &'static Kernel<P>, len: usize) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        self.used() >= len
    }

    /// `true` if there is no room left for even a single byte.
    pub unsafe fn is_full(&self, kernel: &'static Kernel<P>) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        self.free() == 0
    }

    /// `true` if there is no data buffered.
    pub unsafe fn is_empty(&self, kernel: &'static Kernel<P>) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        self.used() == 0
    }

    /// Discards all buffered data and wakes waiters that now fit against
    /// an empty queue.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn reset(&self, kernel: &'static Kernel<P>) {
        let _g = critical::enter::<P>(&kernel.critical);
        self.read.set(0);
        self.write.set(0);
        self.solve(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtos_arch::ThreadEntry;
    use std::boxed::Box;

    struct NoopPort;
    impl Port for NoopPort {
        fn disable_interrupts() -> usize {
            0
        }
        fn enable_interrupts(_previous_level: usize) {}
        fn interrupts_active() -> bool {
            true
        }
        unsafe fn make_initial_stack(
            stack_base: *mut u8,
            _stack_size: usize,
            _entry: ThreadEntry,
            _argument: usize,
            _return_hook: extern "C" fn() -> !,
        ) -> *mut u8 {
            stack_base
        }
        fn start_kernel() -> ! {
            loop {}
        }
        unsafe fn yield_now(_current_sp: *mut *mut u8) {}
        fn idle() -> ! {
            loop {}
        }
    }

    fn leak_region(len: usize) -> *mut u8 {
        use std::alloc::{alloc, Layout};
        let layout = Layout::from_size_align(len, rtos_kconfig::MEMORY_ALIGNMENT).unwrap();
        unsafe { alloc(layout) }
    }

    fn started_kernel() -> &'static Kernel<NoopPort> {
        let kernel = Box::leak(Box::new(Kernel::<NoopPort>::new()));
        unsafe {
            kernel.init(leak_region(64 * 1024), 64 * 1024);
            kernel.start();
        }
        kernel
    }

    #[test]
    fn send_receive_round_trip_preserves_bytes() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 8).unwrap();
            let payload = [1u8, 2, 3, 4];
            assert!(queue.as_ref().send_non_block(kernel, payload.as_ptr(), payload.len()));

            let mut out = [0u8; 4];
            assert!(queue.as_ref().receive_non_block(kernel, out.as_mut_ptr(), out.len()));
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn used_plus_free_equals_usable_capacity() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 8).unwrap();
            let payload = [5u8, 6, 7];
            queue.as_ref().send_non_block(kernel, payload.as_ptr(), payload.len());
            assert_eq!(
                queue.as_ref().get_used(kernel) + queue.as_ref().get_free(kernel),
                queue.as_ref().get_size()
            );
        }
    }

    #[test]
    fn blocked_receiver_unblocks_once_enough_bytes_accumulate() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 4).unwrap();

            let mut out = [0u8; 4];
            let desc = WaitDescriptor {
                data: out.as_mut_ptr(),
                len: 4,
                result: Cell::new(false),
            };
            let mut waiter = Box::leak(Box::new(crate::thread::Thread::new()));
            waiter.init(5);
            let link = NonNull::from(&*waiter).as_ref().scheduler_link();
            list::insert_by_key(queue.as_ref().readers(), link, 5, crate::thread::priority_key_of);
            NonNull::from(&*waiter)
                .as_ref()
                .wait_descriptor
                .set(&desc as *const _ as *mut ());

            assert!(queue.as_ref().send_non_block(kernel, [1u8, 2].as_ptr(), 2));
            assert!(!desc.result.get());
            assert!(queue.as_ref().send_non_block(kernel, [3u8, 4].as_ptr(), 2));
            assert!(desc.result.get());
            assert_eq!(out, [1, 2, 3, 4]);
        }
    }

    #[test]
    fn reset_clears_buffered_data() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 4).unwrap();
            queue.as_ref().send_non_block(kernel, [9u8].as_ptr(), 1);
            assert_eq!(queue.as_ref().get_used(kernel), 1);
            queue.as_ref().reset(kernel);
            assert_eq!(queue.as_ref().get_used(kernel), 0);
            assert_eq!(queue.as_ref().get_free(kernel), queue.as_ref().get_size());
        }
    }

    #[test]
    fn send_ahead_jumps_in_front_of_buffered_byte() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 4).unwrap();
            assert!(queue.as_ref().send_non_block(kernel, [1u8].as_ptr(), 1));
            assert!(queue.as_ref().send_ahead_non_block(kernel, [2u8].as_ptr(), 1));

            let mut out = [0u8; 2];
            assert!(queue.as_ref().receive_non_block(kernel, out.as_mut_ptr(), 1));
            assert!(queue.as_ref().receive_non_block(kernel, out.as_mut_ptr().add(1), 1));
            assert_eq!(out, [2, 1]);
        }
    }

    #[test]
    fn receive_behind_consumes_most_recently_written_byte() {
        let kernel = started_kernel();
        unsafe {
            let queue = Queue::create(kernel, 4).unwrap();
            assert!(queue.as_ref().send_non_block(kernel, [1u8].as_ptr(), 1));
            assert!(queue.as_ref().send_non_block(kernel, [2u8].as_ptr(), 1));

            let mut out = 0u8;
            assert!(queue.as_ref().receive_behind_non_block(kernel, &mut out, 1));
            assert_eq!(out, 2);
            assert!(queue.as_ref().receive_non_block(kernel, &mut out, 1));
            assert_eq!(out, 1);
        }
    }

    #[test]
    fn solve_prefers_higher_priority_waiter_between_regular_and_ahead_writers() {
        let kernel = started_kernel();
        unsafe {
            // Fill the one-byte queue so both writers below have to block.
            let queue = Queue::create(kernel, 1).unwrap();
            assert!(queue.as_ref().send_non_block(kernel, [0xffu8].as_ptr(), 1));

            let regular_payload = [1u8];
            let regular_desc = WaitDescriptor {
                data: regular_payload.as_ptr() as *mut u8,
                len: 1,
                result: Cell::new(false),
            };
            let mut regular_waiter = Box::leak(Box::new(crate::thread::Thread::new()));
            regular_waiter.init(5);
            let regular_link = NonNull::from(&*regular_waiter).as_ref().scheduler_link();
            list::insert_by_key(queue.as_ref().writers(), regular_link, 5, crate::thread::priority_key_of);
            NonNull::from(&*regular_waiter)
                .as_ref()
                .wait_descriptor
                .set(&regular_desc as *const _ as *mut ());

            let ahead_payload = [2u8];
            let ahead_desc = WaitDescriptor {
                data: ahead_payload.as_ptr() as *mut u8,
                len: 1,
                result: Cell::new(false),
            };
            let mut ahead_waiter = Box::leak(Box::new(crate::thread::Thread::new()));
            ahead_waiter.init(3);
            let ahead_link = NonNull::from(&*ahead_waiter).as_ref().scheduler_link();
            list::insert_by_key(queue.as_ref().writers_ahead(), ahead_link, 3, crate::thread::priority_key_of);
            NonNull::from(&*ahead_waiter)
                .as_ref()
                .wait_descriptor
                .set(&ahead_desc as *const _ as *mut ());

            // Free exactly one byte: only one of the two waiters can be
            // satisfied. The ahead waiter has the higher priority (lower
            // value), so it must win over the regular waiter.
            let mut drained = 0u8;
            assert!(queue.as_ref().receive_non_block(kernel, &mut drained, 1));

            assert!(ahead_desc.result.get());
            assert!(!regular_desc.result.get());
        }
    }
}
