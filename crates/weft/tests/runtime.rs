use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use weft::{Runtime, Socket, now_ms, sleep_ms};

const RECV_WAIT: Duration = Duration::from_secs(10);

#[test]
fn submitted_tasks_all_run() {
    let rt = Runtime::new(3, "all-run");
    let (tx, rx) = mpsc::channel();
    for i in 0..32 {
        let tx = tx.clone();
        rt.submit(move || {
            tx.send(i).unwrap();
        });
    }
    let mut got: Vec<i32> = (0..32).map(|_| rx.recv_timeout(RECV_WAIT).unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..32).collect::<Vec<_>>());
    rt.stop();
}

#[test]
fn stop_joins_workers() {
    let rt = Runtime::new(2, "stop");
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let c = counter.clone();
        rt.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    rt.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    assert!(rt.stopping());
}

#[test]
fn pinned_jobs_run_on_their_worker() {
    let rt = Runtime::new(2, "pin");
    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let tx = tx.clone();
        rt.submit_pinned(1, move || {
            tx.send(Runtime::worker_id()).unwrap();
        });
    }
    for _ in 0..4 {
        assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), Some(1));
    }
    rt.stop();
}

#[test]
fn sleep_suspends_for_at_least_the_duration() {
    let rt = Runtime::new(2, "sleep");
    let (tx, rx) = mpsc::channel();
    rt.submit(move || {
        let t0 = now_ms();
        sleep_ms(60);
        tx.send(now_ms() - t0).unwrap();
    });
    let elapsed = rx.recv_timeout(RECV_WAIT).unwrap();
    assert!(elapsed >= 60, "slept only {elapsed} ms");
    rt.stop();
}

#[test]
fn sleeping_tasks_run_concurrently() {
    // Two 80 ms sleeps on one worker finish together, not serially.
    let rt = Runtime::new(1, "conc");
    let (tx, rx) = mpsc::channel();
    let t0 = now_ms();
    for _ in 0..2 {
        let tx = tx.clone();
        rt.submit(move || {
            sleep_ms(80);
            tx.send(()).unwrap();
        });
    }
    rx.recv_timeout(RECV_WAIT).unwrap();
    rx.recv_timeout(RECV_WAIT).unwrap();
    let elapsed = now_ms() - t0;
    assert!(elapsed < 160, "sleeps ran serially: {elapsed} ms");
    rt.stop();
}

#[test]
fn timer_callback_fires() {
    let rt = Runtime::new(2, "timer");
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let _t = rt.add_timer(
        20,
        move || {
            let _ = tx.lock().unwrap().send(());
        },
        false,
    );
    rx.recv_timeout(RECV_WAIT).unwrap();
    rt.stop();
}

#[test]
fn recurring_timer_fires_repeatedly() {
    let rt = Runtime::new(2, "recur");
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let t = rt.add_timer(
        15,
        move || {
            let _ = tx.lock().unwrap().send(());
        },
        true,
    );
    for _ in 0..3 {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    t.cancel();
    rt.stop();
}

#[test]
fn socket_echo_roundtrip() {
    let rt = Runtime::new(2, "echo");
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = Arc::new(Socket::tcp(&bind).unwrap());
    listener.bind(&bind).unwrap();
    listener.listen(16).unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let listener = listener.clone();
        rt.submit(move || {
            let (peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = peer.recv(&mut buf[got..]).unwrap();
                assert!(n > 0);
                got += n;
            }
            let mut sent = 0;
            while sent < buf.len() {
                sent += peer.send(&buf[sent..]).unwrap();
            }
            peer.close();
        });
    }
    rt.submit(move || {
        let sock = Socket::tcp(&addr).unwrap();
        sock.connect(&addr, Some(2_000)).unwrap();
        let mut sent = 0;
        while sent < 5 {
            sent += sock.send(&b"hello"[sent..]).unwrap();
        }
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            let n = sock.recv(&mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        sock.close();
        tx.send(buf).unwrap();
    });
    assert_eq!(&rx.recv_timeout(RECV_WAIT).unwrap(), b"hello");
    listener.close();
    rt.stop();
}

#[test]
fn recv_timeout_returns_etimedout() {
    let rt = Runtime::new(2, "rcvto");
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = Arc::new(Socket::tcp(&bind).unwrap());
    listener.bind(&bind).unwrap();
    listener.listen(4).unwrap();
    let addr = listener.local_addr().unwrap();

    let keeper = listener.clone();
    rt.submit(move || {
        // Accept and hold the connection open without writing.
        let _conn = keeper.accept().unwrap();
        sleep_ms(1_000);
    });

    let (tx, rx) = mpsc::channel();
    rt.submit(move || {
        let sock = Socket::tcp(&addr).unwrap();
        sock.connect(&addr, Some(2_000)).unwrap();
        sock.set_recv_timeout(50);
        let t0 = now_ms();
        let mut buf = [0u8; 1];
        let err = sock.recv(&mut buf).unwrap_err();
        tx.send((err.raw_os_error(), now_ms() - t0)).unwrap();
        sock.close();
    });
    let (errno, elapsed) = rx.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!(elapsed >= 50, "timed out after only {elapsed} ms");
    listener.close();
}
