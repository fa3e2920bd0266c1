//! io_uring-backed asynchronous I/O for the corio runtime.
//!
//! One [`IoService`] wraps one ring and serves the whole process. Any
//! task, on any scheduler, prepares operations through lock-free
//! per-thread pipelines and awaits the returned [`IoFuture`]; completions
//! arrive on a dedicated reaper thread that resumes each waiting task
//! where it runs. Results are raw CQE values: byte counts or fds on
//! success, negative errno on failure.
//!
//! ```no_run
//! use std::sync::Arc;
//! use corio_runtime::{launch, Scheduler};
//! use corio_io::IoService;
//!
//! let sched = Scheduler::new();
//! let io = Arc::new(IoService::new().unwrap());
//! let n = launch(async move {
//!     let mut buf = [0u8; 4096];
//!     io.read(0, &mut buf, 0).await
//! })
//! .schedule_on(&sched)
//! .join();
//! assert!(n >= 0);
//! sched.shutdown();
//! ```

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("corio-io is built on io_uring and only builds on Linux");
    }
}

mod batch;
mod op;
mod pipeline;
mod record;
mod service;

pub use batch::{IoBatch, IoLink};
pub use record::{IoAccept, IoFuture, IoSelect};
pub use service::{IoConfig, IoService, MAX_IO_THREADS};

use std::future::Future;
use std::time::Duration;

/// Run `future` after `delay` has elapsed on the ring's clock.
pub async fn delayed<F: Future>(io: &IoService, delay: Duration, future: F) -> F::Output {
    io.sleep(delay).await;
    future.await
}
