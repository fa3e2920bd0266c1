//! Work-stealing cooperative scheduler and task types.
//!
//! A [`Scheduler`] owns a set of worker threads, each with a private
//! work-stealing queue of continuations. Tasks are futures wrapped in a
//! reference-counted core ([`task`]); completion and cancellation hand off
//! through rendezvous cells so that whichever side arrives second resumes
//! the other, with no locks on the hot path.
//!
//! ```no_run
//! use corio_runtime::{launch, spawn, Scheduler};
//!
//! let sched = Scheduler::new();
//! let total = launch(async {
//!     let a = spawn(async { 2 });
//!     let b = spawn(async { 3 });
//!     a.await + b.await
//! })
//! .schedule_on(&sched)
//! .join();
//! assert_eq!(total, 5);
//! sched.shutdown();
//! ```

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("corio-runtime parks workers on futexes and only builds on Linux");
    }
}

pub mod context;
pub mod event;
mod park;
pub mod scheduler;
pub mod task;

pub use context::{current_scheduler, current_stop_token, resume_target_for, ResumeTarget};
pub use event::Event;
pub use scheduler::{Scheduler, SchedulerConfig, MAX_WORKERS};
pub use task::{
    chain, generator, launch, spawn, CancelRequest, Chain, Continuation, Generator,
    GeneratorResume, Launch, Spawn, Yielder,
};
