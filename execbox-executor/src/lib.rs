//! Language executors for execbox.
//!
//! An [`Executor`] turns source text into captured output by composing two
//! worker pools: a private builder pool carrying the language toolchain and
//! the service-wide sandboxed runner pool. The [`ExecutorService`] owns the
//! registry of executors, keyed by language tag, and the shared runner pool.

mod golang;
mod service;

pub use golang::GolangExecutor;
pub use service::{Executor, ExecutorService};
