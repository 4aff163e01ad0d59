//! Thread control blocks and the thread-level API built on the scheduler
//! primitives in [`crate::sched`].

use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, NonNull};

use rtos_arch::Port;
use rtos_infra::container_of;
use rtos_infra::list::ListNode;
use rtos_kconfig::{IDLE_THREAD_STACK_SIZE, PRIO_IDLE};

/// Cached thread state. List membership is authoritative; this is kept only
/// so a caller can query state without walking lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Blocked,
    Suspended,
}

/// A thread control block.
///
/// Every field that participates in scheduler bookkeeping is a `Cell` (or
/// intrusive list node) rather than behind a lock: the kernel's critical
/// section is what makes mutation through a shared reference sound, not any
/// per-object synchronization.
#[repr(C)]
pub struct Thread {
    pub(crate) stack_pointer: Cell<*mut u8>,
    /// Membership in exactly one of: the ready list, a primitive's waiter
    /// list, or detached (suspended).
    pub(crate) scheduler_node: ListNode,
    pub(crate) priority: Cell<u32>,
    /// Priority-ordered-by-wakeup-time membership in the timed list.
    /// Detached unless this thread is blocked with a finite timeout.
    pub(crate) timer_node: ListNode,
    pub(crate) wakeup_at: Cell<u32>,
    pub(crate) stack_memory: Cell<Option<NonNull<u8>>>,
    pub(crate) stack_size: Cell<usize>,
    /// Head of this thread's owned-allocations list, bulk-freed on delete.
    pub(crate) local_memory: ListNode,
    /// Opaque pointer to whatever wait descriptor is currently published on
    /// this thread's stack; null when not blocked. The concrete type is
    /// known only to the primitive that set it.
    pub(crate) wait_descriptor: Cell<*mut ()>,
    pub(crate) state: Cell<ThreadState>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Builds a detached thread control block. Must be [`Thread::init`]ed
    /// before any list operation touches its nodes.
    pub const fn new() -> Self {
        Self {
            stack_pointer: Cell::new(ptr::null_mut()),
            scheduler_node: ListNode::new(),
            priority: Cell::new(0),
            timer_node: ListNode::new(),
            wakeup_at: Cell::new(0),
            stack_memory: Cell::new(None),
            stack_size: Cell::new(0),
            local_memory: ListNode::new(),
            wait_descriptor: Cell::new(ptr::null_mut()),
            state: Cell::new(ThreadState::Suspended),
        }
    }

    /// # Safety
    /// Must be called exactly once, after `self` has reached its final
    /// address.
    pub unsafe fn init(self: &mut Self, priority: u32) {
        self.scheduler_node.init();
        self.timer_node.init();
        self.local_memory.init();
        self.priority.set(priority);
    }

    pub fn priority(&self) -> u32 {
        self.priority.get()
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn scheduler_link(&self) -> NonNull<ListNode> {
        NonNull::from(&self.scheduler_node)
    }

    pub(crate) fn timer_link(&self) -> NonNull<ListNode> {
        NonNull::from(&self.timer_node)
    }

    pub(crate) fn local_memory_link(&self) -> NonNull<ListNode> {
        NonNull::from(&self.local_memory)
    }

    pub(crate) unsafe fn from_scheduler_link(node: NonNull<ListNode>) -> NonNull<Thread> {
        NonNull::new_unchecked(container_of!(node.as_ptr(), Thread, scheduler_node))
    }

    pub(crate) unsafe fn from_timer_link(node: NonNull<ListNode>) -> NonNull<Thread> {
        NonNull::new_unchecked(container_of!(node.as_ptr(), Thread, timer_node))
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Safe wrapper (despite the pointer cast inside) so this can be passed
/// directly as an `impl Fn` to [`rtos_infra::list::insert_by_key`], which
/// an `unsafe fn` item cannot be.
pub(crate) fn priority_key_of(node: NonNull<ListNode>) -> u32 {
    unsafe { Thread::from_scheduler_link(node).as_ref().priority.get() }
}

pub(crate) fn wakeup_key_of(node: NonNull<ListNode>) -> u32 {
    unsafe { Thread::from_timer_link(node).as_ref().wakeup_at.get() }
}

/// The statically allocated idle thread: lowest priority, never destroyed,
/// exists so the ready list is never empty.
pub struct IdleThread {
    pub(crate) thread: Thread,
    stack: UnsafeCell<[u8; IDLE_THREAD_STACK_SIZE]>,
}

unsafe impl Send for IdleThread {}
unsafe impl Sync for IdleThread {}

impl IdleThread {
    pub const fn new() -> Self {
        Self {
            thread: Thread::new(),
            stack: UnsafeCell::new([0; IDLE_THREAD_STACK_SIZE]),
        }
    }

    /// # Safety
    /// Must run once, before the kernel starts, and `self` must never move
    /// again afterward.
    pub unsafe fn init<P: Port>(self: &Self, return_hook: extern "C" fn() -> !) {
        let thread = &self.thread;
        let this = thread as *const Thread as *mut Thread;
        (*this).init(PRIO_IDLE);

        let stack_base = self.stack.get() as *mut u8;
        let stack_size = IDLE_THREAD_STACK_SIZE;
        let sp = P::make_initial_stack(stack_base, stack_size, idle_entry::<P>, 0, return_hook);
        thread.stack_pointer.set(sp);
        thread.stack_memory.set(None);
        thread.stack_size.set(stack_size);
        thread.state.set(ThreadState::Ready);
    }
}

impl Default for IdleThread {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn idle_entry<P: Port>(_argument: usize) {
    P::idle()
}
