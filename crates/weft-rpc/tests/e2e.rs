use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use weft::{Runtime, sleep_ms};
use weft_codec::Serializer;
use weft_rpc::{Registry, RpcClient, RpcCode, RpcPool, RpcResult, RpcServer, Strategy};

const RECV_WAIT: Duration = Duration::from_secs(15);

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Run `f` on a scheduler task and hand its result back to the test
/// thread.
fn on_task<T: Send + 'static>(
    rt: &Arc<Runtime>,
    f: impl FnOnce() -> T + Send + 'static,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel();
    rt.submit(move || {
        let _ = tx.send(f());
    });
    rx
}

fn start_server(rt: &Arc<Runtime>, registry: Option<SocketAddr>) -> (Arc<RpcServer>, SocketAddr) {
    let server = RpcServer::new();
    server.register("add", |a: i32, b: i32| a + b);
    server.register("len", |s: String| s.len() as u64);
    server.register("sleep", |ms: u64| sleep_ms(ms));
    server.register("hello", || String::from("hi"));
    server.bind(&any_addr()).unwrap();
    let addr = server.local_addr().unwrap();
    let srv = server.clone();
    on_task(rt, move || {
        if let Some(reg) = registry {
            srv.connect_registry(&reg).unwrap();
        }
        srv.start();
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    (server, addr)
}

#[test]
fn echo_method_returns_the_sum() {
    let rt = Runtime::new(4, "echo-e2e");
    let (_server, addr) = start_server(&rt, None);
    let result = on_task(&rt, move || {
        let client = RpcClient::new(true);
        client.connect(&addr).unwrap();
        let res: RpcResult<i32> = client.call("add", (2i32, 3i32));
        client.close();
        res
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(result.code, RpcCode::Success);
    assert_eq!(result.val, Some(5));
}

#[test]
fn unknown_method_is_no_method() {
    let rt = Runtime::new(4, "nosuch-e2e");
    let (_server, addr) = start_server(&rt, None);
    let result = on_task(&rt, move || {
        let client = RpcClient::new(true);
        client.connect(&addr).unwrap();
        let res: RpcResult<i32> = client.call("nosuch", ());
        client.close();
        res
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(result.code, RpcCode::NoMethod);
}

#[test]
fn wrong_argument_type_is_args_not_match() {
    let rt = Runtime::new(4, "badargs-e2e");
    let (_server, addr) = start_server(&rt, None);
    let result = on_task(&rt, move || {
        let client = RpcClient::new(true);
        client.connect(&addr).unwrap();
        // "len" expects a string; hand it an int64 instead.
        let res: RpcResult<u64> = client.call("len", (123_456_789i64,));
        client.close();
        res
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(result.code, RpcCode::ArgsNotMatch);
}

#[test]
fn call_times_out_and_leaks_no_pending_entry() {
    let rt = Runtime::new(4, "timeout-e2e");
    let (_server, addr) = start_server(&rt, None);
    let (code, pending) = on_task(&rt, move || {
        let client = RpcClient::new(true);
        client.connect(&addr).unwrap();
        client.set_timeout(50);
        let res: RpcResult<()> = client.call("sleep", (200u64,));
        let pending = client.pending_calls();
        client.close();
        (res.code, pending)
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(code, RpcCode::Timeout);
    assert_eq!(pending, 0);
}

#[test]
fn subscriber_receives_published_payload() {
    let rt = Runtime::new(4, "pubsub-e2e");
    let (server, addr) = start_server(&rt, None);
    let (tx, rx) = mpsc::channel::<(String, u64)>();
    on_task(&rt, move || {
        let client = RpcClient::new(true);
        client.connect(&addr).unwrap();
        let tx = std::sync::Mutex::new(tx);
        client.subscribe("news", move |s: &mut Serializer| {
            let payload = s.read::<(String, u64)>().expect("payload decode");
            let _ = tx.lock().unwrap().send(payload);
        });
        // Keep the session alive while the push arrives.
        sleep_ms(2_000);
        client.close();
    });
    // Give the subscription time to land server-side.
    std::thread::sleep(Duration::from_millis(300));
    let srv = server.clone();
    rt.submit(move || {
        srv.publish("news", &(String::from("launch"), 7u64));
    });
    let (tag, n) = rx.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(tag, "launch");
    assert_eq!(n, 7);
}

#[test]
fn discover_then_call_through_the_pool() {
    let rt = Runtime::new(4, "discover-e2e");
    let registry = Registry::new();
    registry.bind(&any_addr()).unwrap();
    let reg_addr = registry.local_addr().unwrap();
    let reg = registry.clone();
    on_task(&rt, move || reg.start()).recv_timeout(RECV_WAIT).unwrap();

    let (_server, server_addr) = start_server(&rt, Some(reg_addr));
    assert_eq!(registry.providers_of("hello"), vec![server_addr.to_string()]);

    let result = on_task(&rt, move || {
        let pool = RpcPool::new(2_000, Strategy::Random);
        pool.connect(&reg_addr).unwrap();
        let res: RpcResult<String> = pool.call("hello", ());
        pool.close();
        res
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(result.code, RpcCode::Success);
    assert_eq!(result.val.as_deref(), Some("hi"));
}

#[test]
fn provider_disappearance_empties_the_pool_cache() {
    let rt = Runtime::new(4, "lifecycle-e2e");
    let registry = Registry::new();
    registry.bind(&any_addr()).unwrap();
    let reg_addr = registry.local_addr().unwrap();
    let reg = registry.clone();
    on_task(&rt, move || reg.start()).recv_timeout(RECV_WAIT).unwrap();

    let (server, _server_addr) = start_server(&rt, Some(reg_addr));

    let pool = RpcPool::new(2_000, Strategy::Random);
    {
        let pool = pool.clone();
        let first = on_task(&rt, move || {
            pool.connect(&reg_addr).unwrap();
            pool.call::<String, ()>("hello", ())
        })
        .recv_timeout(RECV_WAIT)
        .unwrap();
        assert_eq!(first.code, RpcCode::Success);
    }

    // Kill the provider; the registry publishes launch=false and the
    // pool's cache drains.
    server.stop();
    std::thread::sleep(Duration::from_millis(500));
    assert!(registry.providers_of("hello").is_empty());

    let second = {
        let pool = pool.clone();
        on_task(&rt, move || pool.call::<String, ()>("hello", ()))
            .recv_timeout(RECV_WAIT)
            .unwrap()
    };
    assert_eq!(second.code, RpcCode::NoMethod);
    let pool2 = pool.clone();
    rt.submit(move || pool2.close());
}

#[test]
fn round_robin_pool_spreads_over_providers() {
    let rt = Runtime::new(4, "rr-e2e");
    let registry = Registry::new();
    registry.bind(&any_addr()).unwrap();
    let reg_addr = registry.local_addr().unwrap();
    let reg = registry.clone();
    on_task(&rt, move || reg.start()).recv_timeout(RECV_WAIT).unwrap();

    let (_s1, a1) = start_server(&rt, Some(reg_addr));
    let (_s2, a2) = start_server(&rt, Some(reg_addr));
    std::thread::sleep(Duration::from_millis(200));
    let mut providers = registry.providers_of("hello");
    providers.sort();
    let mut expect = vec![a1.to_string(), a2.to_string()];
    expect.sort();
    assert_eq!(providers, expect);

    let result = on_task(&rt, move || {
        let pool = RpcPool::new(2_000, Strategy::RoundRobin);
        pool.connect(&reg_addr).unwrap();
        let res: RpcResult<String> = pool.call("hello", ());
        pool.close();
        res
    })
    .recv_timeout(RECV_WAIT)
    .unwrap();
    assert_eq!(result.code, RpcCode::Success);
}
