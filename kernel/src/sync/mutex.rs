//! Mutex and recursive mutex: hand-off locks with no thundering herd. A
//! waiter who wins a hand-off becomes the owner directly; the waiter never
//! has to race anyone else to re-acquire after waking.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

use rtos_arch::Port;
use rtos_infra::list::{self, ListNode};

use crate::critical;
use crate::sched::Kernel;
use crate::thread::Thread;

struct WaitDescriptor {
    result: Cell<bool>,
}

/// A binary mutex with a priority-ordered waiter list.
pub struct Mutex<P: Port> {
    locked: Cell<bool>,
    waiters: ListNode,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for Mutex<P> {}
unsafe impl<P: Port> Sync for Mutex<P> {}

impl<P: Port> Mutex<P> {
    const fn new() -> Self {
        Self {
            locked: Cell::new(false),
            waiters: ListNode::new(),
            _port: PhantomData,
        }
    }

    unsafe fn init(&mut self) {
        self.waiters.init();
    }

    fn waiters(&self) -> NonNull<ListNode> {
        NonNull::from(&self.waiters)
    }

    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(kernel: &'static Kernel<P>) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new());
        let mut mutex = NonNull::new_unchecked(ptr);
        mutex.as_mut().init();
        Some(mutex)
    }

    /// # Safety
    /// `mutex` must be a live mutex from [`Mutex::create`], never used
    /// again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, mutex: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        kernel.ready_all(mutex.as_ref().waiters());
        kernel.reschedule();
        kernel
            .heap()
            .free(NonNull::new_unchecked(mutex.as_ptr() as *mut u8));
    }

    /// `true` if currently unlocked.
    pub fn peek_lock(&self) -> bool {
        !self.locked.get()
    }

    /// Locks if free, otherwise blocks for up to `timeout` ticks (`0` =
    /// forever). A hand-off from [`Mutex::unlock`] transfers ownership
    /// directly, without re-checking `locked`.
    ///
    /// # Safety
    /// Must not be called from interrupt context. `self` must be
    /// initialized.
    pub unsafe fn lock(&self, kernel: &'static Kernel<P>, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if !self.locked.get() {
            self.locked.set(true);
            return true;
        }
        let desc = WaitDescriptor {
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.waiters()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Mutex::lock`] but never blocks.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn lock_non_block(&self, kernel: &'static Kernel<P>) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if !self.locked.get() {
            self.locked.set(true);
            true
        } else {
            false
        }
    }

    /// Hands off to the highest-priority waiter if one exists (ownership
    /// passes directly, `locked` stays `true`); otherwise clears `locked`.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn unlock(&self, kernel: &'static Kernel<P>) {
        let _g = critical::enter::<P>(&kernel.critical);
        match list::pop_front(self.waiters()) {
            Some(link) => {
                let thread = Thread::from_scheduler_link(link);
                let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                (*desc).result.set(true);
                kernel.ready_thread(thread);
                kernel.reschedule();
            }
            None => self.locked.set(false),
        }
    }
}

/// A mutex that the owning thread may lock more than once without
/// deadlocking itself; it unlocks only once the matching number of
/// unlocks has been issued.
pub struct RecursiveMutex<P: Port> {
    owner: Cell<Option<NonNull<Thread>>>,
    count: Cell<u32>,
    waiters: ListNode,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for RecursiveMutex<P> {}
unsafe impl<P: Port> Sync for RecursiveMutex<P> {}

impl<P: Port> RecursiveMutex<P> {
    const fn new() -> Self {
        Self {
            owner: Cell::new(None),
            count: Cell::new(0),
            waiters: ListNode::new(),
            _port: PhantomData,
        }
    }

    unsafe fn init(&mut self) {
        self.waiters.init();
    }

    fn waiters(&self) -> NonNull<ListNode> {
        NonNull::from(&self.waiters)
    }

    pub fn is_locked(&self) -> bool {
        self.count.get() > 0
    }

    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(kernel: &'static Kernel<P>) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new());
        let mut mutex = NonNull::new_unchecked(ptr);
        mutex.as_mut().init();
        Some(mutex)
    }

    /// # Safety
    /// `mutex` must be a live recursive mutex from
    /// [`RecursiveMutex::create`], never used again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, mutex: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        kernel.ready_all(mutex.as_ref().waiters());
        kernel.reschedule();
        kernel
            .heap()
            .free(NonNull::new_unchecked(mutex.as_ptr() as *mut u8));
    }

    /// Re-entrant for the current owner (increments and returns `true`);
    /// otherwise blocks for up to `timeout` ticks (`0` = forever). A
    /// hand-off from [`RecursiveMutex::unlock`] sets the new owner before
    /// signalling the waiter.
    ///
    /// # Safety
    /// Must not be called from interrupt context. `self` must be
    /// initialized.
    pub unsafe fn lock(&self, kernel: &'static Kernel<P>, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        let current = kernel.current_thread();
        if self.count.get() == 0 || self.owner.get() == Some(current) {
            self.count.set(self.count.get() + 1);
            self.owner.set(Some(current));
            return true;
        }
        let desc = WaitDescriptor {
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.waiters()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`RecursiveMutex::lock`] but never blocks.
    ///
    /// Re-entrancy is decided by an equality test against the current
    /// owner, not by unconditionally taking ownership — getting this
    /// backwards would let an unrelated thread "acquire" a mutex it never
    /// actually holds.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn lock_non_block(&self, kernel: &'static Kernel<P>) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        let current = kernel.current_thread();
        if self.count.get() == 0 || self.owner.get() == Some(current) {
            self.count.set(self.count.get() + 1);
            self.owner.set(Some(current));
            true
        } else {
            false
        }
    }

    /// Valid only for the current owner. Decrements the nesting count; at
    /// zero, hands off to the highest-priority waiter (transferring
    /// ownership and leaving the count at whatever it already was) or, if
    /// none, clears ownership entirely.
    ///
    /// # Safety
    /// `self` must be initialized and locked by the calling thread.
    pub unsafe fn unlock(&self, kernel: &'static Kernel<P>) {
        let _g = critical::enter::<P>(&kernel.critical);
        let current = kernel.current_thread();
        debug_assert_eq!(self.owner.get(), Some(current), "unlock by non-owner");
        if self.owner.get() != Some(current) {
            return;
        }

        let count = self.count.get();
        if count > 1 {
            self.count.set(count - 1);
            return;
        }

        match list::pop_front(self.waiters()) {
            Some(link) => {
                let thread = Thread::from_scheduler_link(link);
                self.owner.set(Some(thread));
                let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                (*desc).result.set(true);
                kernel.ready_thread(thread);
                kernel.reschedule();
            }
            None => {
                self.count.set(0);
                self.owner.set(None);
            }
        }
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
    fn lock_unlock_round_trips_to_unlocked() {
        let kernel = started_kernel();
        unsafe {
            let mutex = Mutex::create(kernel).unwrap();
            assert!(mutex.as_ref().peek_lock());
            assert!(mutex.as_ref().lock(kernel, 0));
            assert!(!mutex.as_ref().peek_lock());
            mutex.as_ref().unlock(kernel);
            assert!(mutex.as_ref().peek_lock());
        }
    }

    #[test]
    fn lock_non_block_fails_while_held() {
        let kernel = started_kernel();
        unsafe {
            let mutex = Mutex::create(kernel).unwrap();
            assert!(mutex.as_ref().lock_non_block(kernel));
            assert!(!mutex.as_ref().lock_non_block(kernel));
        }
    }

    #[test]
    fn recursive_lock_n_times_then_unlock_n_times_clears_owner() {
        let kernel = started_kernel();
        unsafe {
            let mutex = RecursiveMutex::create(kernel).unwrap();
            assert!(mutex.as_ref().lock(kernel, 0));
            assert!(mutex.as_ref().lock(kernel, 0));
            assert!(mutex.as_ref().lock(kernel, 0));
            assert!(mutex.as_ref().is_locked());

            mutex.as_ref().unlock(kernel);
            mutex.as_ref().unlock(kernel);
            assert!(mutex.as_ref().is_locked());
            mutex.as_ref().unlock(kernel);

            assert!(!mutex.as_ref().is_locked());
            assert_eq!(mutex.as_ref().owner.get(), None);
        }
    }

    #[test]
    fn recursive_unlock_hands_off_ownership_with_preserved_count() {
        let kernel = started_kernel();
        unsafe {
            let mutex = RecursiveMutex::create(kernel).unwrap();

            // Thread A becomes current and locks twice.
            let mut a = Box::leak(Box::new(crate::thread::Thread::new()));
            a.init(3);
            kernel.resume_thread(NonNull::from(&*a));
            assert_eq!(kernel.current_thread(), NonNull::from(&*a));
            assert!(mutex.as_ref().lock(kernel, 0));
            assert!(mutex.as_ref().lock(kernel, 0));
            assert_eq!(mutex.as_ref().count.get(), 2);

            // Thread B queues as a waiter on the held mutex.
            let mut b = Box::leak(Box::new(crate::thread::Thread::new()));
            b.init(4);
            let b_link = NonNull::from(&*b).as_ref().scheduler_link();
            list::insert_by_key(mutex.as_ref().waiters(), b_link, 4, crate::thread::priority_key_of);
            let b_desc = WaitDescriptor {
                result: Cell::new(false),
            };
            NonNull::from(&*b)
                .as_ref()
                .wait_descriptor
                .set(&b_desc as *const _ as *mut ());

            // First unlock just decrements; A stays owner with no hand-off.
            mutex.as_ref().unlock(kernel);
            assert_eq!(mutex.as_ref().count.get(), 1);
            assert_eq!(mutex.as_ref().owner.get(), Some(NonNull::from(&*a)));
            assert!(!b_desc.result.get());

            // Second unlock hands off: B becomes owner, count stays at 1.
            mutex.as_ref().unlock(kernel);
            assert_eq!(mutex.as_ref().count.get(), 1);
            assert_eq!(mutex.as_ref().owner.get(), Some(NonNull::from(&*b)));
            assert!(b_desc.result.get());
        }
    }
}
