//! Facade over the corio crates.
//!
//! Pulls the scheduler, task types, and io_uring service into one
//! namespace. Most programs want exactly this:
//!
//! ```no_run
//! use std::sync::Arc;
//! use corio::{launch, IoService, Scheduler};
//!
//! let sched = Scheduler::new();
//! let io = Arc::new(IoService::new().unwrap());
//! let greeting = launch(async move {
//!     io.write(1, b"hello\n", 0).await
//! })
//! .schedule_on(&sched)
//! .join();
//! assert_eq!(greeting, 6);
//! sched.shutdown();
//! ```

pub use corio_core::{
    env_get, env_get_bool, env_get_opt, OverflowStack, PoolAlloc, Rendezvous, RtError, RtResult,
    SpinLock, StealQueue, StopCallback, StopSource, StopToken, WorkQueue,
};
pub use corio_io::{
    delayed, IoAccept, IoBatch, IoConfig, IoFuture, IoLink, IoSelect, IoService, MAX_IO_THREADS,
};
pub use corio_runtime::{
    chain, current_scheduler, current_stop_token, generator, launch, spawn, CancelRequest, Chain,
    Event, Generator, GeneratorResume, Launch, Scheduler, SchedulerConfig, Spawn, Yielder,
    MAX_WORKERS,
};
