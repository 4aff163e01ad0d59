#![no_std]

//! Compile-time tunables for the kernel.
//!
//! The upstream kernel this crate is modeled on loads these values from a
//! Kconfig tree (`cargo-kconfig`). We have no board-configuration tool in
//! this workspace, so the same knobs are plain `const`s here; a downstream
//! integrator wanting per-board configuration can turn this crate into a
//! build-script-generated one without touching callers.

/// Alignment, in bytes, that every heap allocation is rounded up to.
/// Must be a power of two.
pub const MEMORY_ALIGNMENT: usize = 8;

/// Number of distinct thread priority levels. Priority `0` is highest;
/// `THREAD_PRIORITY_MAX - 1` is reserved for the idle thread.
pub const THREAD_PRIORITY_MAX: u32 = 32;

/// Priority reserved for the statically allocated idle thread.
pub const PRIO_IDLE: u32 = THREAD_PRIORITY_MAX - 1;

/// Stack size, in bytes, of the statically allocated idle thread.
pub const IDLE_THREAD_STACK_SIZE: usize = 512;

/// Stack size, in bytes, given to each timer-group daemon thread.
pub const TIMER_THREAD_STACK_SIZE: usize = 1024;

/// Ticks per second the port's periodic timer is expected to generate.
/// Informational only; the kernel itself only counts raw ticks.
pub const TICK_PER_SECOND: u32 = 1000;
