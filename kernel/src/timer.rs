//! Software timers. A timer is a callback descriptor, not a thread; every
//! timer at a given priority shares that priority's *timer group*, which
//! owns the one daemon thread that dispatches them.

use core::cell::Cell;
use core::ptr::NonNull;

use rtos_arch::Port;
use rtos_infra::container_of;
use rtos_infra::list::{self, ListNode};
use rtos_kconfig::TIMER_THREAD_STACK_SIZE;

use crate::critical;
use crate::sched::Kernel;
use crate::thread::ThreadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

pub type TimerCallback = fn(usize);

/// A software timer. Lives in exactly one of its group's active
/// (priority-ordered by next-fire time) or inactive (unordered) lists.
#[repr(C)]
pub struct Timer<P: Port> {
    mode: Cell<TimerMode>,
    period: Cell<u32>,
    wakeup_at: Cell<u32>,
    callback: Cell<Option<TimerCallback>>,
    argument: Cell<usize>,
    node: ListNode,
    group: Cell<Option<NonNull<TimerGroup<P>>>>,
}

unsafe impl<P: Port> Send for Timer<P> {}
unsafe impl<P: Port> Sync for Timer<P> {}

fn wakeup_key_of<P: Port>(node: NonNull<ListNode>) -> u32 {
    unsafe { Timer::<P>::from_link(node).as_ref().wakeup_at.get() }
}

impl<P: Port> Timer<P> {
    const fn new(mode: TimerMode, period: u32, callback: TimerCallback, argument: usize) -> Self {
        Self {
            mode: Cell::new(mode),
            period: Cell::new(period),
            wakeup_at: Cell::new(0),
            callback: Cell::new(Some(callback)),
            argument: Cell::new(argument),
            node: ListNode::new(),
            group: Cell::new(None),
        }
    }

    unsafe fn init(&mut self) {
        self.node.init();
    }

    fn link(&self) -> NonNull<ListNode> {
        NonNull::from(&self.node)
    }

    unsafe fn from_link(node: NonNull<ListNode>) -> NonNull<Timer<P>> {
        NonNull::new_unchecked(container_of!(node.as_ptr(), Timer<P>, node))
    }

    pub fn get_mode(&self) -> TimerMode {
        self.mode.get()
    }

    pub fn get_period(&self) -> u32 {
        self.period.get()
    }

    /// Allocates a timer parked in its group's inactive list. Looks up the
    /// group for `priority`, creating it (and its daemon thread) if this is
    /// the first timer at that priority.
    ///
    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(
        kernel: &'static Kernel<P>,
        mode: TimerMode,
        priority: u32,
        period: u32,
        callback: TimerCallback,
        argument: usize,
    ) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let group = TimerGroup::find_or_create(kernel, priority)?;

        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new(mode, period, callback, argument));
        let mut timer = NonNull::new_unchecked(ptr);
        timer.as_mut().init();
        timer.as_ref().group.set(Some(group));
        list::insert_after(group.as_ref().inactive(), timer.as_ref().link());
        Some(timer)
    }

    /// Detaches the timer from its group and frees it. If this was the
    /// group's last timer, the group's daemon is deleted and the group is
    /// freed too.
    ///
    /// # Safety
    /// `timer` must be a live timer from [`Timer::create`], never used
    /// again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, timer: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        let group = timer.as_ref().group.get().expect("timer has no group");
        list::remove(timer.as_ref().link());
        kernel.heap().free(NonNull::new_unchecked(timer.as_ptr() as *mut u8));
        group.as_ref().delete_if_empty(kernel, group);
    }

    /// Moves the timer into the active list with `wakeup = now + period`,
    /// waking the group's daemon if it was suspended.
    ///
    /// # Safety
    /// `timer` must be a live timer from [`Timer::create`].
    pub unsafe fn start(kernel: &'static Kernel<P>, timer: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        timer.as_ref().activate(kernel);
    }

    /// Moves the timer back to the inactive list without firing it.
    ///
    /// # Safety
    /// `timer` must be a live timer from [`Timer::create`].
    pub unsafe fn stop(kernel: &'static Kernel<P>, timer: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        let group = timer.as_ref().group.get().expect("timer has no group");
        list::remove(timer.as_ref().link());
        list::insert_after(group.as_ref().inactive(), timer.as_ref().link());
    }

    /// Recomputes `wakeup` from the current time and reinserts into the
    /// active list, waking the daemon if it was suspended. Equivalent to
    /// [`Timer::start`]; kept as a separate entry point to match the
    /// application-facing distinction between "arm for the first time" and
    /// "re-arm from now".
    ///
    /// # Safety
    /// `timer` must be a live timer from [`Timer::create`].
    pub unsafe fn reset(kernel: &'static Kernel<P>, timer: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        timer.as_ref().activate(kernel);
    }

    unsafe fn activate(&self, kernel: &'static Kernel<P>) {
        let group = self.group.get().expect("timer has no group");
        list::remove(self.link());
        self.wakeup_at.set(kernel.system_time().wrapping_add(self.period.get()));
        list::insert_by_key(group.as_ref().active(), self.link(), self.wakeup_at.get(), wakeup_key_of::<P>);

        let daemon = group.as_ref().daemon.get().expect("group has no daemon");
        if daemon.as_ref().state() == ThreadState::Suspended {
            kernel.resume_thread(daemon);
        }
    }

    pub unsafe fn set_period(&self, kernel: &'static Kernel<P>, period: u32) {
        let _g = critical::enter::<P>(&kernel.critical);
        self.period.set(period);
    }

    pub unsafe fn set_mode(&self, kernel: &'static Kernel<P>, mode: TimerMode) {
        let _g = critical::enter::<P>(&kernel.critical);
        self.mode.set(mode);
    }
}

/// One daemon thread and its active/inactive timer lists, for every timer
/// sharing a given priority.
struct TimerGroup<P: Port> {
    priority: u32,
    group_node: ListNode,
    daemon: Cell<Option<NonNull<crate::thread::Thread>>>,
    active: ListNode,
    inactive: ListNode,
    kernel: Cell<Option<NonNull<Kernel<P>>>>,
}

unsafe impl<P: Port> Send for TimerGroup<P> {}
unsafe impl<P: Port> Sync for TimerGroup<P> {}

impl<P: Port> TimerGroup<P> {
    const fn new(priority: u32) -> Self {
        Self {
            priority,
            group_node: ListNode::new(),
            daemon: Cell::new(None),
            active: ListNode::new(),
            inactive: ListNode::new(),
            kernel: Cell::new(None),
        }
    }

    unsafe fn init(&mut self) {
        self.group_node.init();
        self.active.init();
        self.inactive.init();
    }

    fn link(&self) -> NonNull<ListNode> {
        NonNull::from(&self.group_node)
    }

    fn active(&self) -> NonNull<ListNode> {
        NonNull::from(&self.active)
    }

    fn inactive(&self) -> NonNull<ListNode> {
        NonNull::from(&self.inactive)
    }

    unsafe fn from_link(node: NonNull<ListNode>) -> NonNull<TimerGroup<P>> {
        NonNull::new_unchecked(container_of!(node.as_ptr(), TimerGroup<P>, group_node))
    }

    unsafe fn find(kernel: &'static Kernel<P>, priority: u32) -> Option<NonNull<Self>> {
        let head = NonNull::from(&kernel.timer_groups);
        let mut cursor = head.as_ref().next()?;
        loop {
            let group = Self::from_link(cursor);
            if group.as_ref().priority == priority {
                return Some(group);
            }
            match cursor.as_ref().next() {
                Some(n) if !core::ptr::eq(n.as_ptr(), head.as_ptr()) => cursor = n,
                _ => return None,
            }
        }
    }

    /// Finds the group for `priority`, or allocates one and spins up its
    /// daemon thread. Rolls back the allocation if the daemon thread can't
    /// be created.
    unsafe fn find_or_create(kernel: &'static Kernel<P>, priority: u32) -> Option<NonNull<Self>> {
        if let Some(group) = Self::find(kernel, priority) {
            return Some(group);
        }

        let mem = kernel.heap().allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new(priority));
        let mut group = NonNull::new_unchecked(ptr);
        group.as_mut().init();
        group.as_ref().kernel.set(Some(NonNull::from(kernel)));
        list::insert_after(NonNull::from(&kernel.timer_groups), group.as_ref().link());

        let argument = ptr as usize;
        match kernel.create_thread(priority, TIMER_THREAD_STACK_SIZE, daemon_entry::<P>, argument) {
            Some(daemon) => {
                group.as_ref().daemon.set(Some(daemon));
                Some(group)
            }
            None => {
                list::remove(group.as_ref().link());
                kernel.heap().free(NonNull::new_unchecked(ptr as *mut u8));
                None
            }
        }
    }

    /// If both the active and inactive lists are empty, detaches this
    /// group, deletes its daemon, and frees the group's own allocation.
    unsafe fn delete_if_empty(&self, kernel: &'static Kernel<P>, group: NonNull<Self>) {
        if !list::is_empty(self.active()) || !list::is_empty(self.inactive()) {
            return;
        }
        let daemon = self.daemon.get();
        list::remove(self.link());
        kernel.heap().free(NonNull::new_unchecked(group.as_ptr() as *mut u8));
        if let Some(daemon) = daemon {
            kernel.delete_thread(daemon);
        }
    }
}

enum NextStep {
    Sleep(u32),
    Suspend,
    Exit,
}

/// Fires every active timer whose wakeup has already arrived, then reports
/// what the daemon should do once the active list has nothing left that's
/// due: sleep until the new head's wakeup, suspend (timers remain, just
/// none active), or exit (the group is now entirely empty).
unsafe fn drain_due_timers<P: Port>(kernel: &'static Kernel<P>, group: NonNull<TimerGroup<P>>) -> NextStep {
    loop {
        let due = {
            let _g = critical::enter::<P>(&kernel.critical);
            match group.as_ref().active().as_ref().next() {
                None => None,
                Some(head) => {
                    let timer = Timer::<P>::from_link(head);
                    if timer.as_ref().wakeup_at.get() <= kernel.system_time() {
                        list::remove(head);
                        Some(timer)
                    } else {
                        None
                    }
                }
            }
        };

        let timer = match due {
            Some(timer) => timer,
            None => break,
        };

        let callback = timer.as_ref().callback.get();
        let argument = timer.as_ref().argument.get();
        if let Some(callback) = callback {
            callback(argument);
        }

        let _g = critical::enter::<P>(&kernel.critical);
        if timer.as_ref().mode.get() == TimerMode::Periodic {
            timer
                .as_ref()
                .wakeup_at
                .set(kernel.system_time().wrapping_add(timer.as_ref().period.get()));
            list::insert_by_key(group.as_ref().active(), timer.as_ref().link(), timer.as_ref().wakeup_at.get(), wakeup_key_of::<P>);
        } else {
            list::insert_after(group.as_ref().inactive(), timer.as_ref().link());
        }
    }

    let _g = critical::enter::<P>(&kernel.critical);
    if let Some(head) = group.as_ref().active().as_ref().next() {
        let timer = Timer::<P>::from_link(head);
        let ticks = timer.as_ref().wakeup_at.get().saturating_sub(kernel.system_time()).max(1);
        return NextStep::Sleep(ticks);
    }
    if !list::is_empty(group.as_ref().inactive()) {
        NextStep::Suspend
    } else {
        NextStep::Exit
    }
}

/// Entry point for a timer group's daemon thread. Never calls
/// [`crate::sched::Kernel::delete_thread`] on anything but itself, and only
/// as its very last action: the library has no generic way for a
/// zero-argument port return hook to recover which `'static Kernel<P>`
/// instance is running, so self-termination happens by direct call here
/// rather than by returning and letting a hook do it.
extern "C" fn daemon_entry<P: Port + 'static>(argument: usize) {
    let group = unsafe { NonNull::new_unchecked(argument as *mut TimerGroup<P>) };
    let kernel = unsafe { group.as_ref().kernel.get().expect("timer group has no kernel").as_ref() };

    loop {
        match unsafe { drain_due_timers(kernel, group) } {
            NextStep::Sleep(ticks) => unsafe { kernel.delay(ticks) },
            NextStep::Suspend => unsafe { kernel.suspend_thread(kernel.current_thread()) },
            NextStep::Exit => {
                unsafe {
                    let _g = critical::enter::<P>(&kernel.critical);
                    list::remove(group.as_ref().link());
                    kernel.heap().free(NonNull::new_unchecked(group.as_ptr() as *mut u8));
                }
                unsafe { kernel.delete_thread(kernel.current_thread()) };
                unreachable!("a deleted thread must never run again");
            }
        }
    }
}
