//! weft — a cooperative-concurrency runtime.
//!
//! Thousands of stackful tasks are multiplexed over a small pool of
//! worker threads. Workers pull tasks from a shared queue; an idle
//! worker becomes the reactor, waiting on descriptor readiness bounded
//! by the next timer deadline. Socket I/O issued from a task suspends
//! on would-block and resumes when the reactor reports readiness, so
//! straight-line blocking code scales without callbacks.

pub mod channel;
pub mod fd;
pub mod hook;
pub mod net;
mod notify;
pub mod reactor;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

pub use channel::{Channel, ChannelClosed, PopError};
pub use fd::{FdContext, FdTable, INFINITE};
pub use hook::{connect_timeout_ms, hook_enabled, set_connect_timeout_ms, set_hook_enabled, sleep_ms};
pub use net::Socket;
pub use reactor::{IoEvent, ReactorError};
pub use runtime::{Runtime, yield_now};
pub use sync::{TaskCondVar, TaskMutex, TaskMutexGuard, TaskSemaphore};
pub use task::{DEFAULT_STACK_SIZE, Task, TaskState};
pub use time::now_ms;
pub use timer::TimerHandle;
