//! Global scheduler state: ready list, timed list, `current`/`next`
//! thread pointers, the tick handler, and the block/ready primitives every
//! blocking synchronization object is built on.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use rtos_arch::{Port, ThreadEntry};
use rtos_infra::list::{self, ListNode};
use rtos_kconfig::THREAD_PRIORITY_MAX;

use crate::critical;
use crate::debug_assert_not_in_interrupt;
use crate::heap::Heap;
use crate::thread::{self, IdleThread, Thread, ThreadState};

/// The kernel singleton: heap, scheduler bookkeeping, and the timer-group
/// list, generic over the board's [`Port`] implementation.
///
/// Every method that mutates scheduler state must be called with the
/// kernel's critical section held; most do so themselves, a few (notably
/// [`Kernel::block_current`]) expect the caller to already hold one because
/// they are one step in a larger primitive-specific critical section.
pub struct Kernel<P: Port> {
    pub(crate) critical: critical::State,
    heap: Heap,
    ready_list: ListNode,
    timed_list: ListNode,
    kernel_memory: ListNode,
    pub(crate) timer_groups: ListNode,
    current_thread: Cell<Option<NonNull<Thread>>>,
    next_thread: Cell<Option<NonNull<Thread>>>,
    system_time: Cell<u32>,
    idle: IdleThread,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for Kernel<P> {}
unsafe impl<P: Port> Sync for Kernel<P> {}

extern "C" fn return_hook<P: Port>() -> ! {
    panic!("thread entry returned without calling thread_delete");
}

impl<P: Port> Kernel<P> {
    pub const fn new() -> Self {
        Self {
            critical: critical::State::new(),
            heap: Heap::new(),
            ready_list: ListNode::new(),
            timed_list: ListNode::new(),
            kernel_memory: ListNode::new(),
            timer_groups: ListNode::new(),
            current_thread: Cell::new(None),
            next_thread: Cell::new(None),
            system_time: Cell::new(0),
            idle: IdleThread::new(),
            _port: PhantomData,
        }
    }

    fn ready_list(&self) -> NonNull<ListNode> {
        NonNull::from(&self.ready_list)
    }

    fn timed_list(&self) -> NonNull<ListNode> {
        NonNull::from(&self.timed_list)
    }

    pub fn kernel_memory(&self) -> NonNull<ListNode> {
        NonNull::from(&self.kernel_memory)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn system_time(&self) -> u32 {
        self.system_time.get()
    }

    pub fn current_thread(&self) -> NonNull<Thread> {
        self.current_thread.get().expect("kernel not started")
    }

    /// Hands the heap a backing region and readies the list heads. Must run
    /// once, before [`Kernel::start`], and before any other kernel call.
    ///
    /// # Safety
    /// `heap_start .. heap_start + heap_len` must be writable memory this
    /// kernel owns exclusively for its lifetime.
    pub unsafe fn init(&self, heap_start: *mut u8, heap_len: usize) {
        self.ready_list().as_mut().init();
        self.timed_list().as_mut().init();
        self.kernel_memory().as_mut().init();
        NonNull::from(&self.timer_groups).as_mut().init();
        self.heap.init(heap_start, heap_len);
    }

    /// Brings up the idle thread, enters it as `current`/`next`, and hands
    /// control to the port. Never returns.
    ///
    /// # Safety
    /// Must run exactly once, after [`Kernel::init`], and `self` must be at
    /// its final (`'static`) address already.
    pub unsafe fn start(&'static self) -> ! {
        self.idle.init::<P>(return_hook::<P>);
        let idle_thread = NonNull::from(&self.idle.thread);
        list::insert_by_key(
            self.ready_list(),
            idle_thread.as_ref().scheduler_link(),
            idle_thread.as_ref().priority(),
            thread::priority_key_of,
        );
        self.current_thread.set(Some(idle_thread));
        self.next_thread.set(Some(idle_thread));
        P::start_kernel()
    }

    fn scheduling_decision(&self) {
        unsafe {
            let head = self
                .ready_list()
                .as_ref()
                .next()
                .expect("ready list must never be empty");
            let head_thread = Thread::from_scheduler_link(head);
            let next = self.next_thread.get().expect("kernel not started");
            if next.as_ref().priority() != head_thread.as_ref().priority() {
                self.next_thread.set(Some(head_thread));
            }
        }
    }

    /// Advances `next_thread` to the following member of the ready list.
    /// This is what produces round-robin: as long as the advance stays
    /// within the highest-priority run, [`Kernel::scheduling_decision`]
    /// retains it; once it falls off that run, the decision snaps back to
    /// the ready list's head.
    fn advance_next_thread(&self) {
        unsafe {
            let next = self.next_thread.get().expect("kernel not started");
            let succ = next
                .as_ref()
                .scheduler_link()
                .as_ref()
                .next()
                .expect("ready list must never be empty");
            self.next_thread.set(Some(Thread::from_scheduler_link(succ)));
        }
    }

    /// Switches to `next_thread` if it differs from `current_thread`.
    ///
    /// Inside an ISR (`critical.irq_nesting() > 0`) the switch happens
    /// directly: the interrupt-enable bracket that a thread-voluntary yield
    /// needs would be wrong to run mid-ISR, and the port's normal interrupt
    /// return already re-enables interrupts. Outside an ISR this goes
    /// through [`critical::State::around_yield`] so the blocked thread's
    /// nesting depth is preserved across the switch.
    ///
    /// # Safety
    /// Must be called with the kernel's critical section held.
    unsafe fn maybe_switch(&'static self) {
        let current = self.current_thread.get().expect("kernel not started");
        let next = self.next_thread.get().expect("kernel not started");
        if ptr::eq(current.as_ptr(), next.as_ptr()) {
            return;
        }
        self.current_thread.set(Some(next));
        if self.critical.irq_nesting() > 0 {
            P::yield_now(current.as_ref().stack_pointer.as_ptr());
        } else {
            self.critical.around_yield::<P>(|| {
                P::yield_now(current.as_ref().stack_pointer.as_ptr());
            });
        }
    }

    /// Detaches `thread` from whatever list holds it, clears its wait
    /// state, and inserts it into the ready list by priority.
    ///
    /// # Safety
    /// Must be called with the kernel's critical section held; `thread`
    /// must be a live thread belonging to this kernel.
    pub(crate) unsafe fn ready_thread(&self, thread: NonNull<Thread>) {
        list::remove(thread.as_ref().scheduler_link());
        list::remove(thread.as_ref().timer_link());
        thread.as_ref().wait_descriptor.set(ptr::null_mut());
        list::insert_by_key(
            self.ready_list(),
            thread.as_ref().scheduler_link(),
            thread.as_ref().priority(),
            thread::priority_key_of,
        );
        thread.as_ref().state.set(ThreadState::Ready);
    }

    /// Re-runs the scheduling decision and switches if it picked someone
    /// new. Called by blocking primitives after they ready one or more
    /// waiters, to implement "yield if the new head outranks current".
    ///
    /// # Safety
    /// Must be called with the kernel's critical section held.
    pub(crate) unsafe fn reschedule(&'static self) {
        self.scheduling_decision();
        self.maybe_switch();
    }

    /// Readies every thread currently linked into `waiter_list`, in list
    /// order (so highest priority first, FIFO among equal priorities).
    ///
    /// # Safety
    /// Same as [`Kernel::ready_thread`]; `waiter_list` must be a valid list
    /// head.
    pub(crate) unsafe fn ready_all(&self, waiter_list: NonNull<ListNode>) {
        while let Some(link) = list::pop_front(waiter_list) {
            self.ready_thread(Thread::from_scheduler_link(link));
        }
    }

    /// The tick handler: advances `system_time`, wakes any thread whose
    /// timeout has expired, round-robins the ready list, and switches if
    /// the scheduling decision picked someone new. The port's periodic
    /// timer interrupt must call this.
    ///
    /// # Safety
    /// Must be called from interrupt context with this kernel already
    /// started.
    pub unsafe fn tick(&'static self) {
        self.critical.enter_isr();
        {
            let _g = critical::enter::<P>(&self.critical);

            self.system_time.set(self.system_time.get().wrapping_add(1));

            loop {
                let head = match self.timed_list().as_ref().next() {
                    Some(h) => h,
                    None => break,
                };
                let th = Thread::from_timer_link(head);
                if th.as_ref().wakeup_at.get() > self.system_time.get() {
                    break;
                }
                self.ready_thread(th);
            }

            self.advance_next_thread();
            self.scheduling_decision();
            self.maybe_switch();
        }
        self.critical.exit_isr();
    }

    /// Blocks the current thread, the shared primitive used by every
    /// semaphore/mutex/queue/signal wait path.
    ///
    /// `timeout == 0` means wait indefinitely. On return, the caller reads
    /// whatever the wait descriptor's `result` field says: `true` if a
    /// waker fired, `false` if the tick handler woke this thread on
    /// timeout (or the primitive was deleted out from under it).
    ///
    /// # Safety
    /// Must be called with the critical section held; the current thread
    /// must be Ready and a member of the ready list. Not valid from
    /// interrupt context.
    pub(crate) unsafe fn block_current(
        &'static self,
        waiter_list: Option<NonNull<ListNode>>,
        timeout: u32,
        wait_descriptor: *mut (),
    ) {
        debug_assert_not_in_interrupt!(self.critical);

        let current = self.current_thread.get().expect("kernel not started");

        if ptr::eq(
            self.next_thread.get().expect("kernel not started").as_ptr(),
            current.as_ptr(),
        ) {
            let succ = current
                .as_ref()
                .scheduler_link()
                .as_ref()
                .next()
                .expect("ready list must never be empty");
            self.next_thread.set(Some(Thread::from_scheduler_link(succ)));
        }

        list::remove(current.as_ref().scheduler_link());
        current.as_ref().state.set(ThreadState::Blocked);

        if let Some(waiters) = waiter_list {
            list::insert_by_key(
                waiters,
                current.as_ref().scheduler_link(),
                current.as_ref().priority(),
                thread::priority_key_of,
            );
        }

        if timeout != 0 {
            current.as_ref().wakeup_at.set(self.system_time.get().wrapping_add(timeout));
            list::insert_by_key(
                self.timed_list(),
                current.as_ref().timer_link(),
                current.as_ref().wakeup_at.get(),
                thread::wakeup_key_of,
            );
        }

        current.as_ref().wait_descriptor.set(wait_descriptor);

        self.scheduling_decision();
        self.maybe_switch();
    }

    /// Creates a thread, allocating its control block and stack from the
    /// kernel heap, and readies it. Returns `None` on allocation failure
    /// (no partial construction is left visible).
    ///
    /// # Safety
    /// Must not be called from interrupt context. `entry` must be a valid
    /// thread entry point for the port.
    pub unsafe fn create_thread(
        &'static self,
        priority: u32,
        stack_size: usize,
        entry: ThreadEntry,
        argument: usize,
    ) -> Option<NonNull<Thread>> {
        debug_assert!(priority < THREAD_PRIORITY_MAX);
        let _g = critical::enter::<P>(&self.critical);

        let tcb_mem = self.heap.allocate(core::mem::size_of::<Thread>(), self.kernel_memory())?;
        let thread_ptr = tcb_mem.as_ptr() as *mut Thread;
        ptr::write(thread_ptr, Thread::new());
        let mut thread = NonNull::new_unchecked(thread_ptr);
        thread.as_mut().init(priority);

        let stack = match self.heap.allocate(stack_size, self.kernel_memory()) {
            Some(s) => s,
            None => {
                self.heap.free(tcb_mem);
                log::warn!("create_thread: stack allocation of {stack_size} bytes failed");
                return None;
            }
        };

        let sp = P::make_initial_stack(stack.as_ptr(), stack_size, entry, argument, return_hook::<P>);
        let thread_ref = thread.as_ref();
        thread_ref.stack_pointer.set(sp);
        thread_ref.stack_memory.set(Some(stack));
        thread_ref.stack_size.set(stack_size);

        self.ready_thread(thread);
        self.scheduling_decision();
        self.maybe_switch();

        log::debug!("created thread {:p} at priority {priority}", thread.as_ptr());
        Some(thread)
    }

    /// Destroys `thread`: detaches it from every list, bulk-frees its
    /// owned allocations, frees its stack and control block. If `thread`
    /// is the calling thread, this never returns to the caller.
    ///
    /// # Safety
    /// `thread` must be a live thread belonging to this kernel, never used
    /// again after this call (including as `thread` itself, which is freed
    /// memory on return).
    pub unsafe fn delete_thread(&'static self, thread: NonNull<Thread>) {
        let _g = critical::enter::<P>(&self.critical);
        let deleting_self = ptr::eq(self.current_thread().as_ptr(), thread.as_ptr());
        log::debug!("deleting thread {:p}", thread.as_ptr());

        if deleting_self
            && ptr::eq(
                self.next_thread.get().expect("kernel not started").as_ptr(),
                thread.as_ptr(),
            )
        {
            let succ = thread
                .as_ref()
                .scheduler_link()
                .as_ref()
                .next()
                .expect("ready list must never be empty");
            self.next_thread.set(Some(Thread::from_scheduler_link(succ)));
        }

        list::remove(thread.as_ref().scheduler_link());
        list::remove(thread.as_ref().timer_link());
        self.heap.free_all(thread.as_ref().local_memory_link());
        if let Some(stack) = thread.as_ref().stack_memory.get() {
            self.heap.free(stack);
        }
        self.heap.free(NonNull::new_unchecked(thread.as_ptr() as *mut u8));

        if deleting_self {
            self.scheduling_decision();
            self.maybe_switch();
            unreachable!("a deleted thread must never run again");
        }
    }

    /// Suspends `thread`, detaching it from the ready or timed list
    /// without readying it anywhere. If `thread` is the current thread,
    /// yields immediately.
    ///
    /// # Safety
    /// `thread` must be a live thread belonging to this kernel.
    pub unsafe fn suspend_thread(&'static self, thread: NonNull<Thread>) {
        let _g = critical::enter::<P>(&self.critical);
        let is_self = ptr::eq(self.current_thread().as_ptr(), thread.as_ptr());

        if is_self
            && ptr::eq(
                self.next_thread.get().expect("kernel not started").as_ptr(),
                thread.as_ptr(),
            )
        {
            let succ = thread
                .as_ref()
                .scheduler_link()
                .as_ref()
                .next()
                .expect("ready list must never be empty");
            self.next_thread.set(Some(Thread::from_scheduler_link(succ)));
        }

        list::remove(thread.as_ref().scheduler_link());
        list::remove(thread.as_ref().timer_link());
        thread.as_ref().state.set(ThreadState::Suspended);

        if is_self {
            self.scheduling_decision();
            self.maybe_switch();
        }
    }

    /// Readies a suspended or blocked `thread`, yielding if it outranks
    /// the current thread.
    ///
    /// # Safety
    /// `thread` must be a live thread belonging to this kernel.
    pub unsafe fn resume_thread(&'static self, thread: NonNull<Thread>) {
        let _g = critical::enter::<P>(&self.critical);
        self.ready_thread(thread);
        self.scheduling_decision();
        self.maybe_switch();
    }

    /// Changes `thread`'s priority, repositioning it in the ready list if
    /// it is currently there, and yields if the change makes it the new
    /// highest-priority ready thread.
    ///
    /// # Safety
    /// `thread` must be a live thread belonging to this kernel.
    pub unsafe fn set_priority(&'static self, thread: NonNull<Thread>, priority: u32) {
        debug_assert!(priority < THREAD_PRIORITY_MAX);
        let _g = critical::enter::<P>(&self.critical);

        thread.as_ref().priority.set(priority);
        if thread.as_ref().state.get() == ThreadState::Ready {
            list::remove(thread.as_ref().scheduler_link());
            list::insert_by_key(
                self.ready_list(),
                thread.as_ref().scheduler_link(),
                priority,
                thread::priority_key_of,
            );
        }

        self.scheduling_decision();
        self.maybe_switch();
    }

    /// Voluntarily yields: advances `next_thread` by one along the ready
    /// list, then switches if the scheduling decision changed anything.
    ///
    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn yield_now(&'static self) {
        debug_assert_not_in_interrupt!(self.critical);
        let _g = critical::enter::<P>(&self.critical);
        self.advance_next_thread();
        self.scheduling_decision();
        self.maybe_switch();
    }

    /// Blocks the current thread for `ticks` system ticks with no waiter
    /// list. `ticks == 0` is a no-op (it is not treated as "forever",
    /// unlike a timeout of zero elsewhere in this kernel).
    ///
    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn delay(&'static self, ticks: u32) {
        debug_assert_not_in_interrupt!(self.critical);
        if ticks == 0 {
            return;
        }
        let _g = critical::enter::<P>(&self.critical);
        self.block_current(None, ticks, ptr::null_mut());
    }
}

impl<P: Port> Default for Kernel<P> {
    fn default() -> Self {
        Self::new()
    }
}
