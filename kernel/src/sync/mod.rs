//! Blocking synchronization primitives. Each owns a priority-ordered
//! waiter list and shares the same block/wake contract: a blocker
//! publishes an on-stack descriptor through [`crate::thread::Thread`]'s
//! `wait_descriptor` field before parking, and a waker fills it in before
//! readying the thread.

pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod signal;

pub use mutex::{Mutex, RecursiveMutex};
pub use queue::Queue;
pub use semaphore::Semaphore;
pub use signal::Signal;
