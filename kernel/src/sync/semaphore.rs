//! Counting semaphore.

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

/// A counting semaphore with a priority-ordered waiter list.
pub struct Semaphore<P: Port> {
    counter: Cell<u32>,
    waiters: ListNode,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for Semaphore<P> {}
unsafe impl<P: Port> Sync for Semaphore<P> {}

impl<P: Port> Semaphore<P> {
    const fn new(initial: u32) -> Self {
        Self {
            counter: Cell::new(initial),
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

    pub fn counter(&self) -> u32 {
        self.counter.get()
    }

    /// Reports whether a [`Semaphore::wait`] would succeed without
    /// blocking, without consuming the count.
    pub fn peek_wait(&self) -> bool {
        self.counter.get() > 0
    }

    /// Allocates and initializes a semaphore from the kernel heap.
    ///
    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(kernel: &'static Kernel<P>, initial: u32) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new(initial));
        let mut sem = NonNull::new_unchecked(ptr);
        sem.as_mut().init();
        Some(sem)
    }

    /// Wakes every waiter (their descriptors stay `false`, indistinguishable
    /// from a timeout) and frees the control block.
    ///
    /// # Safety
    /// `sem` must be a live semaphore from [`Semaphore::create`], never
    /// used again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, sem: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        kernel.ready_all(sem.as_ref().waiters());
        kernel.reschedule();
        kernel.heap().free(NonNull::new_unchecked(sem.as_ptr() as *mut u8));
    }

    /// If a thread is waiting, wakes the highest-priority one (FIFO among
    /// ties) and hands it a successful wait; otherwise increments the
    /// counter.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn post(&self, kernel: &'static Kernel<P>) {
        let _g = critical::enter::<P>(&kernel.critical);
        match list::pop_front(self.waiters()) {
            Some(link) => {
                let thread = Thread::from_scheduler_link(link);
                let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                (*desc).result.set(true);
                kernel.ready_thread(thread);
                kernel.reschedule();
            }
            None => self.counter.set(self.counter.get() + 1),
        }
    }

    /// Decrements and returns `true` if the counter is positive; otherwise
    /// blocks for up to `timeout` ticks (`0` = forever) and returns whether
    /// a post (rather than a timeout or deletion) woke this thread.
    ///
    /// # Safety
    /// Must not be called from interrupt context. `self` must be
    /// initialized.
    pub unsafe fn wait(&self, kernel: &'static Kernel<P>, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if self.counter.get() > 0 {
            self.counter.set(self.counter.get() - 1);
            return true;
        }
        let desc = WaitDescriptor {
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.waiters()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Same as [`Semaphore::wait`] with a zero timeout, but never blocks:
    /// returns `false` immediately instead of parking.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn wait_non_block(&self, kernel: &'static Kernel<P>) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        if self.counter.get() > 0 {
            self.counter.set(self.counter.get() - 1);
            true
        } else {
            false
        }
    }

    /// Wakes up to `initial` of the highest-priority waiters (each
    /// receives a successful wait); any remainder of `initial` becomes the
    /// new counter value.
    ///
    /// # Safety
    /// `self` must be initialized.
    pub unsafe fn reset(&self, kernel: &'static Kernel<P>, initial: u32) {
        let _g = critical::enter::<P>(&kernel.critical);
        let mut remaining = initial;
        while remaining > 0 {
            match list::pop_front(self.waiters()) {
                Some(link) => {
                    let thread = Thread::from_scheduler_link(link);
                    let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
                    (*desc).result.set(true);
                    kernel.ready_thread(thread);
                    remaining -= 1;
                }
                None => break,
            }
        }
        self.counter.set(remaining);
        kernel.reschedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadState;
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

    fn leak_kernel() -> &'static Kernel<NoopPort> {
        Box::leak(Box::new(Kernel::<NoopPort>::new()))
    }

    fn leak_region(len: usize) -> *mut u8 {
        use std::alloc::{alloc, Layout};
        let layout = Layout::from_size_align(len, rtos_kconfig::MEMORY_ALIGNMENT).unwrap();
        unsafe { alloc(layout) }
    }

    fn started_kernel() -> &'static Kernel<NoopPort> {
        let kernel = leak_kernel();
        unsafe {
            kernel.init(leak_region(64 * 1024), 64 * 1024);
            kernel.start();
        }
        kernel
    }

    #[test]
    fn wait_and_non_block_consume_available_count() {
        let kernel = started_kernel();
        unsafe {
            let sem = Semaphore::create(kernel, 2).unwrap();
            assert!(sem.as_ref().wait_non_block(kernel));
            assert!(sem.as_ref().wait(kernel, 0));
            assert!(!sem.as_ref().wait_non_block(kernel));
            assert_eq!(sem.as_ref().counter(), 0);
        }
    }

    #[test]
    fn post_wakes_highest_priority_waiter_first() {
        let kernel = started_kernel();
        unsafe {
            let sem = Semaphore::create(kernel, 0).unwrap();

            let mut low = Box::leak(Box::new(crate::thread::Thread::new()));
            low.init(5);
            let mut high = Box::leak(Box::new(crate::thread::Thread::new()));
            high.init(1);

            list::insert_by_key(
                sem.as_ref().waiters(),
                NonNull::from(&*low).as_ref().scheduler_link(),
                5,
                crate::thread::priority_key_of,
            );
            list::insert_by_key(
                sem.as_ref().waiters(),
                NonNull::from(&*high).as_ref().scheduler_link(),
                1,
                crate::thread::priority_key_of,
            );
            let low_desc = WaitDescriptor {
                result: Cell::new(false),
            };
            let high_desc = WaitDescriptor {
                result: Cell::new(false),
            };
            NonNull::from(&*low)
                .as_ref()
                .wait_descriptor
                .set(&low_desc as *const _ as *mut ());
            NonNull::from(&*high)
                .as_ref()
                .wait_descriptor
                .set(&high_desc as *const _ as *mut ());
            low.state.set(ThreadState::Blocked);
            high.state.set(ThreadState::Blocked);

            sem.as_ref().post(kernel);

            assert!(high_desc.result.get());
            assert!(!low_desc.result.get());
            assert_eq!(high.state.get(), ThreadState::Ready);
        }
    }

    #[test]
    fn reset_wakes_exactly_n_waiters_fifo() {
        let kernel = started_kernel();
        unsafe {
            let sem = Semaphore::create(kernel, 0).unwrap();
            let mut descs: std::vec::Vec<Box<WaitDescriptor>> = std::vec::Vec::new();
            let mut threads: std::vec::Vec<Box<crate::thread::Thread>> = std::vec::Vec::new();

            for _ in 0..5 {
                let mut t = Box::new(crate::thread::Thread::new());
                t.init(5);
                threads.push(t);
            }
            for t in &threads {
                let d = Box::new(WaitDescriptor {
                    result: Cell::new(false),
                });
                let link = NonNull::from(&**t).as_ref().scheduler_link();
                list::insert_by_key(sem.as_ref().waiters(), link, 5, crate::thread::priority_key_of);
                NonNull::from(&**t)
                    .as_ref()
                    .wait_descriptor
                    .set(&*d as *const _ as *mut ());
                t.state.set(ThreadState::Blocked);
                descs.push(d);
            }

            sem.as_ref().reset(kernel, 3);

            let woken = descs.iter().filter(|d| d.result.get()).count();
            assert_eq!(woken, 3);
            assert_eq!(sem.as_ref().counter(), 0);
            assert_eq!(threads[0].state.get(), ThreadState::Ready);
            assert_eq!(threads[1].state.get(), ThreadState::Ready);
            assert_eq!(threads[2].state.get(), ThreadState::Ready);
            assert_eq!(threads[3].state.get(), ThreadState::Blocked);
            assert_eq!(threads[4].state.get(), ThreadState::Blocked);
        }
    }
}
