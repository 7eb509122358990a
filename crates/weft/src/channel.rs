//! Bounded multi-producer multi-consumer channel between tasks.
//!
//! Push blocks while the queue is full, pop while it is empty; both fail
//! once the channel is closed. Insertion order is preserved. Handles are
//! cheap clones sharing one core.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::sync::{TaskCondVar, TaskMutex};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("channel closed")]
    Closed,
    #[error("pop timed out")]
    Timeout,
}

struct ChanState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct ChannelCore<T> {
    capacity: usize,
    mutex: TaskMutex,
    push_cv: TaskCondVar,
    pop_cv: TaskCondVar,
    state: spin::Mutex<ChanState<T>>,
}

pub struct Channel<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone() }
    }
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be non-zero");
        Self {
            core: Arc::new(ChannelCore {
                capacity,
                mutex: TaskMutex::new(),
                push_cv: TaskCondVar::new(),
                pop_cv: TaskCondVar::new(),
                state: spin::Mutex::new(ChanState { queue: VecDeque::new(), closed: false }),
            }),
        }
    }

    /// Blocks while the channel is at capacity.
    pub fn push(&self, v: T) -> Result<(), ChannelClosed> {
        let mut guard = self.core.mutex.lock();
        let mut slot = Some(v);
        loop {
            {
                let mut st = self.core.state.lock();
                if st.closed {
                    return Err(ChannelClosed);
                }
                if st.queue.len() < self.core.capacity {
                    st.queue.push_back(slot.take().expect("push value present"));
                    break;
                }
            }
            guard = self.core.push_cv.wait(guard);
        }
        self.core.pop_cv.notify_one();
        drop(guard);
        Ok(())
    }

    /// Blocks while empty; `None` once closed.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.core.mutex.lock();
        loop {
            {
                let mut st = self.core.state.lock();
                if st.closed {
                    return None;
                }
                if let Some(v) = st.queue.pop_front() {
                    drop(st);
                    self.core.push_cv.notify_one();
                    drop(guard);
                    return Some(v);
                }
            }
            guard = self.core.pop_cv.wait(guard);
        }
    }

    /// Bounded pop: `Timeout` if nothing arrives within `ms`.
    pub fn pop_timeout(&self, ms: u64) -> Result<T, PopError> {
        let mut guard = self.core.mutex.lock();
        loop {
            {
                let mut st = self.core.state.lock();
                if st.closed {
                    return Err(PopError::Closed);
                }
                if let Some(v) = st.queue.pop_front() {
                    drop(st);
                    self.core.push_cv.notify_one();
                    drop(guard);
                    return Ok(v);
                }
            }
            let (g, timed_out) = self.core.pop_cv.wait_for(guard, ms);
            guard = g;
            if timed_out {
                let mut st = self.core.state.lock();
                if st.closed {
                    return Err(PopError::Closed);
                }
                match st.queue.pop_front() {
                    Some(v) => {
                        drop(st);
                        self.core.push_cv.notify_one();
                        drop(guard);
                        return Ok(v);
                    }
                    None => return Err(PopError::Timeout),
                }
            }
        }
    }

    /// Wake every waiter and fail all later pushes/pops. Pending items
    /// are discarded.
    pub fn close(&self) {
        let guard = self.core.mutex.lock();
        {
            let mut st = self.core.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.queue.clear();
        }
        self.core.push_cv.notify_all();
        self.core.pop_cv.notify_all();
        drop(guard);
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }
}
