//! Client-side connection pool over the registry.
//!
//! Service names resolve to provider addresses through discovery on the
//! (single, reused) registry connection; sessions to providers open
//! lazily and are cached per service. A lifecycle subscription keeps the
//! address cache in step as providers join and leave.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};
use weft::channel::Channel;
use weft::sync::TaskMutex;
use weft::{INFINITE, Runtime, Socket, TimerHandle};
use weft_codec::{Decode, Encode, Frame, MsgType, Serializer};

use crate::client::{RpcClient, SubscribeCallback};
use crate::registry::service_subscribe_key;
use crate::result::{RpcCode, RpcResult};
use crate::route::{RouteSelector, Strategy};
use crate::stream::Session;

const REGISTRY_CHANNEL_CAPACITY: usize = 1;
const HEARTBEAT_PERIOD_MS: u64 = 30_000;

#[derive(Default)]
struct PoolState {
    /// service → open client session.
    sessions: HashMap<String, Arc<RpcClient>>,
    /// service → cached provider addresses.
    addresses: HashMap<String, Vec<String>>,
}

pub struct RpcPool {
    registry: spin::Mutex<Option<Arc<Session>>>,
    outbound: Channel<Frame>,
    /// service name → channel a discovering task waits on.
    discover_waits: spin::Mutex<HashMap<String, Channel<Frame>>>,
    subscribes: spin::Mutex<HashMap<String, SubscribeCallback>>,
    /// Serializes resolution and (re)connection per pool; dispatch into
    /// an open session drops it first.
    connect_mutex: TaskMutex,
    // Shared with the lifecycle subscription callbacks.
    state: Arc<spin::Mutex<PoolState>>,
    selector: RouteSelector,
    timeout_ms: AtomicU64,
    closed: AtomicBool,
    heartbeat_outstanding: AtomicBool,
    heartbeat_timer: spin::Mutex<Option<TimerHandle>>,
}

impl RpcPool {
    pub fn new(timeout_ms: u64, strategy: Strategy) -> Arc<Self> {
        Arc::new(Self {
            registry: spin::Mutex::new(None),
            outbound: Channel::new(REGISTRY_CHANNEL_CAPACITY),
            discover_waits: spin::Mutex::new(HashMap::new()),
            subscribes: spin::Mutex::new(HashMap::new()),
            connect_mutex: TaskMutex::new(),
            state: Arc::new(spin::Mutex::new(PoolState::default())),
            selector: RouteSelector::new(strategy),
            timeout_ms: AtomicU64::new(timeout_ms),
            closed: AtomicBool::new(true),
            heartbeat_outstanding: AtomicBool::new(false),
            heartbeat_timer: spin::Mutex::new(None),
        })
    }

    /// Connect to the registry and start the pool's sender/receiver
    /// tasks. Must run on a scheduler task.
    pub fn connect(self: &Arc<Self>, addr: &SocketAddr) -> io::Result<()> {
        let sock = Socket::tcp(addr)?;
        let timeout = self.timeout_ms.load(Ordering::Acquire);
        sock.connect(addr, (timeout != INFINITE).then_some(timeout))?;
        let session = Arc::new(Session::new(Arc::new(sock)));
        info!(registry = %addr, "pool connected");
        *self.registry.lock() = Some(session);
        self.closed.store(false, Ordering::Release);
        self.heartbeat_outstanding.store(false, Ordering::Release);

        let rt = Runtime::current_or_global();
        let me = self.clone();
        rt.submit(move || me.sender_loop());
        let me = self.clone();
        rt.submit(move || me.receiver_loop());

        let weak = Arc::downgrade(self);
        let timer = rt.add_timer(
            HEARTBEAT_PERIOD_MS,
            move || {
                let Some(pool) = weak.upgrade() else { return };
                if pool.heartbeat_outstanding.load(Ordering::Acquire) {
                    info!("registry heartbeat lost, closing pool");
                    pool.close();
                    return;
                }
                pool.heartbeat_outstanding.store(true, Ordering::Release);
                let _ = pool.outbound.push(Frame::heartbeat());
            },
            true,
        );
        *self.heartbeat_timer.lock() = Some(timer);
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("pool close");
        self.heartbeat_outstanding.store(true, Ordering::Release);
        self.outbound.close();
        if let Some(t) = self.heartbeat_timer.lock().take() {
            t.cancel();
        }
        let waits: Vec<Channel<Frame>> =
            self.discover_waits.lock().drain().map(|(_, c)| c).collect();
        for w in waits {
            w.close();
        }
        let clients: Vec<Arc<RpcClient>> = {
            let mut st = self.state.lock();
            st.addresses.clear();
            st.sessions.drain().map(|(_, c)| c).collect()
        };
        for c in clients {
            c.close();
        }
        if let Some(reg) = self.registry.lock().take() {
            reg.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Call `name(args…)` on some provider of the service, resolving and
    /// connecting as needed.
    pub fn call<T: Decode, A: Encode>(&self, name: &str, args: A) -> RpcResult<T> {
        let mut s = Serializer::new();
        s.write(name);
        s.write(&args);
        self.call_encoded(name, s.into_vec())
    }

    /// Fire-and-collect variant: the returned one-slot channel is filled
    /// by a background task running the call.
    pub fn async_call<T, A>(self: &Arc<Self>, name: &str, args: A) -> Channel<RpcResult<T>>
    where
        T: Decode + Send + 'static,
        A: Encode + Send + 'static,
    {
        let chan = Channel::new(1);
        let out = chan.clone();
        let me = self.clone();
        let name = name.to_owned();
        Runtime::current_or_global().submit(move || {
            let _ = out.push(me.call::<T, A>(&name, args));
        });
        chan
    }

    fn call_encoded<T: Decode>(&self, name: &str, body: Vec<u8>) -> RpcResult<T> {
        // Fast path: a cached session, dispatched outside the pool lock.
        let cached = {
            let _guard = self.connect_mutex.lock();
            self.state.lock().sessions.get(name).cloned()
        };
        if let Some(client) = cached {
            let res = client.call_raw::<T>(body.clone());
            if res.code != RpcCode::Closed {
                return res;
            }
            // The provider went away under us; forget it and resolve
            // again.
            let _guard = self.connect_mutex.lock();
            let mut st = self.state.lock();
            if let Some(addrs) = st.addresses.get_mut(name) {
                if let Some(peer) = client.peer_addr() {
                    let peer = peer.to_string();
                    addrs.retain(|a| *a != peer);
                }
            }
            st.sessions.remove(name);
        }
        self.resolve_and_call(name, body)
    }

    fn resolve_and_call<T: Decode>(&self, name: &str, body: Vec<u8>) -> RpcResult<T> {
        let guard = self.connect_mutex.lock();
        let mut addrs = self.state.lock().addresses.get(name).cloned().unwrap_or_default();
        if addrs.is_empty() {
            let registry_alive = self
                .registry
                .lock()
                .as_ref()
                .is_some_and(|s| s.is_connected());
            if self.is_closed() || !registry_alive {
                return RpcResult::closed("registry closed");
            }
            addrs = self.discover(name);
            if addrs.is_empty() {
                return RpcResult::no_method(format!("no method {name}"));
            }
            self.state.lock().addresses.insert(name.to_owned(), addrs.clone());
        }

        let pick = self.selector.select(&addrs).to_owned();
        let Ok(addr) = pick.parse::<SocketAddr>() else {
            warn!(provider = %pick, "unparseable provider address");
            return RpcResult::fail("call fail");
        };
        let client = RpcClient::new(true);
        client.set_timeout(self.timeout_ms.load(Ordering::Acquire));
        if client.connect(&addr).is_ok() {
            self.state.lock().sessions.insert(name.to_owned(), client.clone());
            drop(guard);
            return client.call_raw::<T>(body);
        }
        RpcResult::fail("call fail")
    }

    /// Ask the registry for the providers of `name`, blocking on a
    /// per-name reply channel. Installs the lifecycle subscription on
    /// first resolution.
    fn discover(&self, name: &str) -> Vec<String> {
        let reply: Channel<Frame> = Channel::new(1);
        self.discover_waits.lock().insert(name.to_owned(), reply.clone());

        let mut s = Serializer::new();
        s.write(name);
        if self
            .outbound
            .push(Frame::new(MsgType::ServiceDiscover, s.into_vec(), 0))
            .is_err()
        {
            self.discover_waits.lock().remove(name);
            return Vec::new();
        }

        let response = reply.pop();
        self.discover_waits.lock().remove(name);
        let Some(response) = response else { return Vec::new() };

        let mut s = Serializer::from_bytes(&response.body);
        let Ok(_echoed_name) = s.read::<String>() else { return Vec::new() };
        let Ok(count) = s.read::<u32>() else { return Vec::new() };
        let mut found = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match s.read::<RpcResult<String>>() {
                Ok(res) if res.code == RpcCode::Success => {
                    if let Some(addr) = res.val {
                        found.push(addr);
                    }
                }
                Ok(_) => return Vec::new(),
                Err(e) => {
                    warn!(error = %e, "discover response decode failed");
                    return Vec::new();
                }
            }
        }

        self.ensure_lifecycle_subscription(name);
        found
    }

    /// Subscribe to the service's join/leave stream: a joining provider
    /// is appended to the cache, a leaving one removed.
    fn ensure_lifecycle_subscription(&self, name: &str) {
        let key = service_subscribe_key(name);
        if self.subscribes.lock().contains_key(&key) {
            return;
        }
        let service = name.to_owned();
        let shared = self.state.clone();
        let cb: SubscribeCallback = Arc::new(move |s: &mut Serializer| {
            let Ok((launch, addr)) = s.read::<(bool, String)>() else {
                debug!("lifecycle payload decode failed");
                return;
            };
            let mut st = shared.lock();
            let entry = st.addresses.entry(service.clone()).or_default();
            if launch {
                debug!(service = %service, provider = %addr, "provider joined");
                if !entry.contains(&addr) {
                    entry.push(addr);
                }
            } else {
                debug!(service = %service, provider = %addr, "provider left");
                entry.retain(|a| *a != addr);
            }
        });
        self.subscribes.lock().insert(key.clone(), cb);

        let mut s = Serializer::new();
        s.write(&key);
        let _ = self.outbound.push(Frame::new(MsgType::SubscribeRequest, s.into_vec(), 0));
    }

    fn registry_session(&self) -> Option<Arc<Session>> {
        self.registry.lock().clone()
    }

    fn sender_loop(&self) {
        let Some(session) = self.registry_session() else { return };
        while let Some(frame) = self.outbound.pop() {
            if let Err(e) = session.send_frame(&frame) {
                warn!(error = %e, "registry send failed");
                break;
            }
        }
        debug!("pool sender exit");
    }

    fn receiver_loop(&self) {
        let Some(session) = self.registry_session() else { return };
        loop {
            let frame = match session.recv_frame() {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "registry receive failed, closing pool");
                    self.close();
                    break;
                }
            };
            self.heartbeat_outstanding.store(false, Ordering::Release);
            match frame.msg_type() {
                Some(MsgType::Heartbeat) => {}
                Some(MsgType::PublishRequest) => {
                    let seq = frame.seq_id;
                    self.on_publish(&frame);
                    let _ =
                        self.outbound.push(Frame::new(MsgType::PublishResponse, Vec::new(), seq));
                }
                Some(MsgType::ServiceDiscoverResponse) => self.on_discover_response(frame),
                Some(MsgType::SubscribeResponse) => {}
                _ => debug!(ty = frame.ty, "pool ignoring frame"),
            }
        }
        debug!("pool receiver exit");
    }

    fn on_publish(&self, frame: &Frame) {
        let mut s = Serializer::from_bytes(&frame.body);
        let Ok(key) = s.read::<String>() else { return };
        let cb = self.subscribes.lock().get(&key).cloned();
        if let Some(cb) = cb {
            cb(&mut s);
        }
    }

    /// Route the response to whichever task is waiting on this service
    /// name; the waiter does the full decode itself.
    fn on_discover_response(&self, frame: Frame) {
        let mut s = Serializer::from_bytes(&frame.body);
        let Ok(name) = s.read::<String>() else { return };
        let chan = self.discover_waits.lock().get(&name).cloned();
        if let Some(chan) = chan {
            let _ = chan.push(frame);
        }
    }
}

impl Drop for RpcPool {
    fn drop(&mut self) {
        self.close();
    }
}
