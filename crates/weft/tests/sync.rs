use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use weft::{Channel, PopError, Runtime, TaskCondVar, TaskMutex, TaskSemaphore, now_ms, yield_now};

const RECV_WAIT: Duration = Duration::from_secs(10);

#[test]
fn mutex_excludes_concurrent_writers() {
    let rt = Runtime::new(3, "mutex");
    let mutex = Arc::new(TaskMutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let tx = tx.clone();
        rt.submit(move || {
            for _ in 0..500 {
                let guard = mutex.lock();
                // A deliberately non-atomic increment: correct only
                // under mutual exclusion.
                let v = counter.load(Ordering::Relaxed);
                yield_now();
                counter.store(v + 1, Ordering::Relaxed);
                drop(guard);
            }
            tx.send(()).unwrap();
        });
    }
    for _ in 0..4 {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2000);
    rt.stop();
}

#[test]
fn mutex_waiters_acquire_in_fifo_order() {
    let rt = Runtime::new(2, "fair");
    let mutex = Arc::new(TaskMutex::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    // A holder keeps the lock while the contenders queue up behind it.
    {
        let mutex = mutex.clone();
        rt.submit(move || {
            let guard = mutex.lock();
            weft::sleep_ms(500);
            drop(guard);
        });
    }
    std::thread::sleep(Duration::from_millis(60));

    // Stagger the contenders so their enqueue order is their index
    // order; unlock hands the lock front-of-queue first.
    for i in 0..5u32 {
        let mutex = mutex.clone();
        let order = order.clone();
        let tx = tx.clone();
        rt.submit(move || {
            weft::sleep_ms(u64::from(i) * 60);
            let guard = mutex.lock();
            order.lock().unwrap().push(i);
            drop(guard);
            tx.send(i).unwrap();
        });
    }

    // Every waiter acquires the lock (no starvation)...
    for _ in 0..5 {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    // ...and in the order it started waiting.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    rt.stop();
}

#[test]
fn mutex_is_reentrant_for_owner() {
    let rt = Runtime::new(2, "reent");
    let (tx, rx) = mpsc::channel();
    rt.submit(move || {
        let mutex = TaskMutex::new();
        let outer = mutex.lock();
        let inner = mutex.lock();
        drop(inner);
        drop(outer);
        // Still usable afterwards.
        drop(mutex.lock());
        tx.send(()).unwrap();
    });
    rx.recv_timeout(RECV_WAIT).unwrap();
    rt.stop();
}

#[test]
fn condvar_wait_for_times_out_without_notify() {
    let rt = Runtime::new(2, "cv-to");
    let (tx, rx) = mpsc::channel();
    rt.submit(move || {
        let mutex = TaskMutex::new();
        let cv = TaskCondVar::new();
        let t0 = now_ms();
        let (guard, timed_out) = cv.wait_for(mutex.lock(), 50);
        drop(guard);
        tx.send((timed_out, now_ms() - t0)).unwrap();
    });
    let (timed_out, elapsed) = rx.recv_timeout(RECV_WAIT).unwrap();
    assert!(timed_out);
    assert!(elapsed >= 50, "woke after only {elapsed} ms");
    rt.stop();
}

#[test]
fn condvar_notify_beats_the_deadline() {
    let rt = Runtime::new(2, "cv-notify");
    let mutex = Arc::new(TaskMutex::new());
    let cv = Arc::new(TaskCondVar::new());
    let (tx, rx) = mpsc::channel();
    {
        let mutex = mutex.clone();
        let cv = cv.clone();
        rt.submit(move || {
            let (guard, timed_out) = cv.wait_for(mutex.lock(), 5_000);
            drop(guard);
            tx.send(timed_out).unwrap();
        });
    }
    {
        let cv = cv.clone();
        rt.submit(move || {
            weft::sleep_ms(30);
            cv.notify_one();
        });
    }
    assert!(!rx.recv_timeout(RECV_WAIT).unwrap());
    rt.stop();
}

#[test]
fn semaphore_bounds_concurrency() {
    let rt = Runtime::new(3, "sem");
    let sem = Arc::new(TaskSemaphore::new(2));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let sem = sem.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        let tx = tx.clone();
        rt.submit(move || {
            sem.acquire();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            weft::sleep_ms(10);
            inside.fetch_sub(1, Ordering::SeqCst);
            sem.release();
            tx.send(()).unwrap();
        });
    }
    for _ in 0..8 {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    rt.stop();
}

#[test]
fn channel_is_fifo_across_capacity_pressure() {
    let rt = Runtime::new(2, "fifo");
    let chan: Channel<u32> = Channel::new(4);
    let (tx, rx) = mpsc::channel();
    {
        let chan = chan.clone();
        rt.submit(move || {
            for i in 0..100u32 {
                chan.push(i).unwrap();
            }
        });
    }
    {
        let chan = chan.clone();
        rt.submit(move || {
            for i in 0..100u32 {
                assert_eq!(chan.pop(), Some(i));
            }
            tx.send(()).unwrap();
        });
    }
    rx.recv_timeout(RECV_WAIT).unwrap();
    rt.stop();
}

#[test]
fn push_blocks_exactly_at_capacity() {
    let rt = Runtime::new(2, "block");
    let chan: Channel<u32> = Channel::new(2);
    let progressed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    {
        let chan = chan.clone();
        let progressed = progressed.clone();
        rt.submit(move || {
            for i in 0..3u32 {
                chan.push(i).unwrap();
                progressed.store(i as usize + 1, Ordering::SeqCst);
            }
            tx.send(()).unwrap();
        });
    }
    std::thread::sleep(Duration::from_millis(100));
    // Two fit, the third push is parked.
    assert_eq!(progressed.load(Ordering::SeqCst), 2);
    {
        let chan = chan.clone();
        rt.submit(move || {
            assert_eq!(chan.pop(), Some(0));
        });
    }
    rx.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(progressed.load(Ordering::SeqCst), 3);
    rt.stop();
}

#[test]
fn pop_timeout_reports_timeout_then_value() {
    let rt = Runtime::new(2, "pop-to");
    let chan: Channel<u32> = Channel::new(1);
    let (tx, rx) = mpsc::channel();
    {
        let chan = chan.clone();
        rt.submit(move || {
            assert_eq!(chan.pop_timeout(40), Err(PopError::Timeout));
            tx.send(()).unwrap();
            assert_eq!(chan.pop_timeout(5_000), Ok(7));
            tx.send(()).unwrap();
        });
    }
    rx.recv_timeout(RECV_WAIT).unwrap();
    {
        let chan = chan.clone();
        rt.submit(move || {
            chan.push(7).unwrap();
        });
    }
    rx.recv_timeout(RECV_WAIT).unwrap();
    rt.stop();
}

#[test]
fn close_wakes_and_fails_everyone() {
    let rt = Runtime::new(2, "close");
    let chan: Channel<u32> = Channel::new(1);
    let (tx, rx) = mpsc::channel();
    {
        let chan = chan.clone();
        let tx = tx.clone();
        rt.submit(move || {
            // Blocks empty, then the close lands.
            tx.send(chan.pop()).unwrap();
        });
    }
    std::thread::sleep(Duration::from_millis(50));
    {
        let chan = chan.clone();
        rt.submit(move || {
            chan.close();
        });
    }
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), None);
    assert!(chan.is_closed());
    rt.stop();
}
