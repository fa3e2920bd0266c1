//! Lock-free building blocks for the corio runtime.
//!
//! Everything in this crate is platform-agnostic and free of runtime policy:
//! the work-stealing deque, the overflow stack, the pooled allocator, the
//! rendezvous cell that task/IO completion rides on, and cooperative stop
//! tokens. The scheduler and the io_uring service are layered on top in
//! `corio-runtime` and `corio-io`.

pub mod env;
pub mod error;
pub mod kprint;
pub mod pool;
pub mod rendezvous;
pub mod ring_buf;
pub mod spinlock;
pub mod stack;
pub mod steal_queue;
pub mod stop;
pub mod work_queue;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{RtError, RtResult};
pub use pool::PoolAlloc;
pub use rendezvous::Rendezvous;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use stack::OverflowStack;
pub use steal_queue::StealQueue;
pub use stop::{StopCallback, StopSource, StopToken};
pub use work_queue::WorkQueue;
