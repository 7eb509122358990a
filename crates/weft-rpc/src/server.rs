//! RPC server: a TCP acceptor spawning one handler task per connection,
//! a type-erased method registry, a subscriber set with publish fanout,
//! and the provider-side registry protocol (announce, register,
//! heartbeat).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};
use weft::{Runtime, Socket, TimerHandle, sleep_ms};
use weft_codec::{Decode, Encode, Frame, MsgType, Serializer};

use crate::result::{RpcCode, RpcResult};
use crate::stream::Session;

const HEARTBEAT_DEADLINE_MS: u64 = 40_000;
const REGISTRY_HEARTBEAT_MS: u64 = 30_000;
const SUBSCRIBER_SWEEP_MS: u64 = 5_000;

/// A registered method, erased to `fn(response serializer, body bytes)`.
type ErasedHandler = Arc<dyn Fn(&mut Serializer, &[u8]) + Send + Sync + 'static>;

/// Adapter from plain functions/closures to RPC methods. Implemented
/// for `Fn(A1, .., An) -> R` up to eight arguments; the argument pack
/// travels as a tuple (`()` for none).
pub trait RpcHandler<A, R>: Send + Sync + 'static {
    fn invoke(&self, args: A) -> R;
}

macro_rules! impl_rpc_handler {
    ($(($ty:ident, $var:ident)),*) => {
        impl<Fun, Ret, $($ty),*> RpcHandler<($($ty,)*), Ret> for Fun
        where
            Fun: Fn($($ty),*) -> Ret + Send + Sync + 'static,
        {
            fn invoke(&self, args: ($($ty,)*)) -> Ret {
                let ($($var,)*) = args;
                (self)($($var),*)
            }
        }
    };
}

impl<Fun, Ret> RpcHandler<(), Ret> for Fun
where
    Fun: Fn() -> Ret + Send + Sync + 'static,
{
    fn invoke(&self, (): ()) -> Ret {
        (self)()
    }
}

impl_rpc_handler!((A1, a1));
impl_rpc_handler!((A1, a1), (A2, a2));
impl_rpc_handler!((A1, a1), (A2, a2), (A3, a3));
impl_rpc_handler!((A1, a1), (A2, a2), (A3, a3), (A4, a4));
impl_rpc_handler!((A1, a1), (A2, a2), (A3, a3), (A4, a4), (A5, a5));
impl_rpc_handler!((A1, a1), (A2, a2), (A3, a3), (A4, a4), (A5, a5), (A6, a6));
impl_rpc_handler!((A1, a1), (A2, a2), (A3, a3), (A4, a4), (A5, a5), (A6, a6), (A7, a7));
impl_rpc_handler!(
    (A1, a1),
    (A2, a2),
    (A3, a3),
    (A4, a4),
    (A5, a5),
    (A6, a6),
    (A7, a7),
    (A8, a8)
);

pub struct RpcServer {
    listeners: spin::Mutex<Vec<Arc<Socket>>>,
    conns: spin::Mutex<Vec<Weak<Socket>>>,
    services: spin::Mutex<HashMap<String, ErasedHandler>>,
    subscribers: spin::Mutex<HashMap<String, Vec<Weak<Session>>>>,
    registry: spin::Mutex<Option<Arc<Session>>>,
    registry_heartbeat: spin::Mutex<Option<TimerHandle>>,
    // The runtime start() ran on; teardown from foreign threads is
    // submitted there so reactor registrations are cleaned up.
    worker: spin::Mutex<Option<Arc<Runtime>>>,
    port: AtomicU16,
    stop: AtomicBool,
    heartbeat_deadline_ms: u64,
}

impl RpcServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: spin::Mutex::new(Vec::new()),
            conns: spin::Mutex::new(Vec::new()),
            services: spin::Mutex::new(HashMap::new()),
            subscribers: spin::Mutex::new(HashMap::new()),
            registry: spin::Mutex::new(None),
            registry_heartbeat: spin::Mutex::new(None),
            worker: spin::Mutex::new(None),
            port: AtomicU16::new(0),
            stop: AtomicBool::new(false),
            heartbeat_deadline_ms: HEARTBEAT_DEADLINE_MS,
        })
    }

    /// Expose `f` as method `name`. The generated wrapper decodes the
    /// argument tuple (answering `ArgsNotMatch` when that fails) and
    /// encodes `Result<R>` around the return value.
    pub fn register<A, R, F>(&self, name: &str, f: F)
    where
        A: Decode + Send + 'static,
        R: Encode + Send + 'static,
        F: RpcHandler<A, R>,
    {
        let handler: ErasedHandler = Arc::new(move |out: &mut Serializer, body: &[u8]| {
            let mut input = Serializer::from_bytes(body);
            match input.read::<A>() {
                Ok(args) => {
                    let ret = f.invoke(args);
                    out.write(&RpcResult::success(ret));
                }
                Err(e) => {
                    debug!(error = %e, "argument decode failed");
                    out.write(&RpcResult::<R>::args_not_match("args not match"));
                }
            }
        });
        self.services.lock().insert(name.to_owned(), handler);
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let sock = Socket::tcp(addr)?;
        sock.bind(addr)?;
        sock.listen(1024)?;
        let local = sock.local_addr()?;
        info!(%local, "server bound");
        self.port.store(local.port(), Ordering::Release);
        self.listeners.lock().push(Arc::new(sock));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.lock().first()?.local_addr().ok()
    }

    /// Connect to the registry and announce our listen port. Must run
    /// on a scheduler task, after `bind`.
    pub fn connect_registry(self: &Arc<Self>, addr: &SocketAddr) -> io::Result<()> {
        let sock = Socket::tcp(addr)?;
        sock.connect(addr, None)?;
        let session = Arc::new(Session::new(Arc::new(sock)));
        debug!(registry = %addr, "connected to registry");

        let mut s = Serializer::new();
        s.write(&u32::from(self.port.load(Ordering::Acquire)));
        session.send_frame(&Frame::new(MsgType::ProviderAnnounce, s.into_vec(), 0))?;
        *self.registry.lock() = Some(session);
        Ok(())
    }

    /// Start serving: push registrations to the registry (when
    /// connected), arm the registry heartbeat, start the subscriber
    /// sweeper and the accept loop. Must run on a scheduler task.
    pub fn start(self: &Arc<Self>) {
        let rt = Runtime::current_or_global();
        *self.worker.lock() = Some(rt.clone());
        if self.registry.lock().is_some() {
            let names: Vec<String> = self.services.lock().keys().cloned().collect();
            for name in names {
                debug!(service = %name, "registering");
                self.register_service(&name);
            }
            if let Some(reg) = self.registry.lock().clone() {
                reg.socket().set_recv_timeout(REGISTRY_HEARTBEAT_MS);
            }
            let weak = Arc::downgrade(self);
            let timer = rt.add_timer(
                REGISTRY_HEARTBEAT_MS,
                move || {
                    let Some(server) = weak.upgrade() else { return };
                    server.registry_heartbeat_tick();
                },
                true,
            );
            *self.registry_heartbeat.lock() = Some(timer);
        }

        // Periodically drop subscribers whose session is gone.
        let weak = Arc::downgrade(self);
        rt.submit(move || {
            loop {
                sleep_ms(SUBSCRIBER_SWEEP_MS);
                let Some(server) = weak.upgrade() else { return };
                if server.stop.load(Ordering::Acquire) {
                    return;
                }
                let mut subs = server.subscribers.lock();
                for entries in subs.values_mut() {
                    entries.retain(|w| w.upgrade().is_some_and(|s| s.is_connected()));
                }
                subs.retain(|_, v| !v.is_empty());
            }
        });

        let listeners: Vec<Arc<Socket>> = self.listeners.lock().clone();
        for listener in listeners {
            let me = self.clone();
            let accept_rt = rt.clone();
            rt.submit(move || me.accept_loop(&accept_rt, listener));
        }
    }

    /// Close the listeners, live connections and the registry link;
    /// handler tasks observe the closes and exit. From a foreign thread
    /// the closes run as a submitted task on the serving runtime.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("server stopping");
        if let Some(t) = self.registry_heartbeat.lock().take() {
            t.cancel();
        }
        let listeners: Vec<Arc<Socket>> = self.listeners.lock().clone();
        let conns: Vec<Arc<Socket>> =
            self.conns.lock().drain(..).filter_map(|w| w.upgrade()).collect();
        let registry = self.registry.lock().take();
        let close_all = move || {
            for l in &listeners {
                l.close();
            }
            for c in &conns {
                c.close();
            }
            if let Some(r) = &registry {
                r.close();
            }
        };
        if Runtime::current().is_some() {
            close_all();
        } else if let Some(rt) = self.worker.lock().clone() {
            rt.submit(close_all);
        } else {
            close_all();
        }
    }

    /// Push one message to every live subscriber of `key`.
    pub fn publish<T: Encode>(&self, key: &str, data: &T) {
        let sessions: Vec<Arc<Session>> = {
            let subs = self.subscribers.lock();
            subs.get(key)
                .map(|v| v.iter().filter_map(Weak::upgrade).collect())
                .unwrap_or_default()
        };
        if sessions.is_empty() {
            return;
        }
        let mut s = Serializer::new();
        s.write(key);
        s.write(data);
        let body = s.into_vec();
        for session in sessions {
            let _ = session.send_frame(&Frame::new(MsgType::PublishRequest, body.clone(), 0));
        }
    }

    fn accept_loop(self: Arc<Self>, rt: &Arc<Runtime>, listener: Arc<Socket>) {
        while !self.stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((sock, peer)) => {
                    info!(%peer, "client connected");
                    let sock = Arc::new(sock);
                    let session = Arc::new(Session::new(sock.clone()));
                    self.conns.lock().push(Arc::downgrade(&sock));
                    let me = self.clone();
                    rt.submit(move || me.handle_client(&session));
                }
                Err(e) => {
                    debug!(error = %e, "accept loop exit");
                    break;
                }
            }
        }
    }

    fn refresh_deadline(&self, deadline: &mut Option<TimerHandle>, sock: &Arc<Socket>) {
        match deadline {
            Some(t) => {
                t.reset(self.heartbeat_deadline_ms, true);
            }
            None => {
                let sock = sock.clone();
                let rt = Runtime::current_or_global();
                *deadline = Some(rt.add_timer(
                    self.heartbeat_deadline_ms,
                    move || {
                        info!(fd = sock.raw_fd(), "heartbeat deadline, closing client");
                        sock.close();
                    },
                    false,
                ));
            }
        }
    }

    fn handle_client(&self, session: &Arc<Session>) {
        let sock = session.socket().clone();
        let mut deadline = None;
        self.refresh_deadline(&mut deadline, &sock);
        loop {
            let frame = match session.recv_frame() {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "client receive ended");
                    break;
                }
            };
            self.refresh_deadline(&mut deadline, &sock);
            match frame.msg_type() {
                Some(MsgType::Heartbeat) => {
                    let _ = session.send_frame(&Frame::heartbeat());
                }
                Some(MsgType::MethodRequest) => {
                    let response = self.handle_method(&frame);
                    let _ = session.send_frame(&response);
                }
                Some(MsgType::SubscribeRequest) => {
                    if let Some(response) = self.handle_subscribe(&frame, session) {
                        let _ = session.send_frame(&response);
                    }
                }
                // The ack of a push we sent; this flow is done.
                Some(MsgType::PublishResponse) => break,
                _ => debug!(ty = frame.ty, "ignored frame"),
            }
        }
        if let Some(t) = deadline {
            t.cancel();
        }
        session.close();
    }

    fn handle_method(&self, frame: &Frame) -> Frame {
        let mut s = Serializer::from_bytes(&frame.body);
        let name = s.read::<String>().unwrap_or_default();
        let handler = self.services.lock().get(&name).cloned();
        let mut out = Serializer::new();
        match handler {
            Some(handler) => {
                let args = s.to_vec();
                handler(&mut out, &args);
            }
            // Unknown method: an empty response body.
            None => debug!(method = %name, "no such method"),
        }
        Frame::new(MsgType::MethodResponse, out.into_vec(), frame.seq_id)
    }

    fn handle_subscribe(&self, frame: &Frame, session: &Arc<Session>) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.body);
        let key = match s.read::<String>() {
            Ok(k) => k,
            Err(e) => {
                debug!(error = %e, "subscribe key decode failed");
                return None;
            }
        };
        self.subscribers
            .lock()
            .entry(key)
            .or_default()
            .push(Arc::downgrade(session));
        let mut out = Serializer::new();
        out.write(&RpcResult::success(()));
        Some(Frame::new(MsgType::SubscribeResponse, out.into_vec(), frame.seq_id))
    }

    fn register_service(&self, name: &str) {
        let Some(registry) = self.registry.lock().clone() else { return };
        let mut s = Serializer::new();
        s.write(name);
        if let Err(e) = registry.send_frame(&Frame::new(MsgType::ServiceRegister, s.into_vec(), 0)) {
            warn!(error = %e, "service register send failed");
            return;
        }
        match registry.recv_frame() {
            Ok(response) => {
                let mut s = Serializer::from_bytes(&response.body);
                match s.read::<RpcResult<String>>() {
                    Ok(res) if res.code == RpcCode::Success => {
                        debug!(service = %name, "registered")
                    }
                    Ok(res) => warn!(service = %name, code = ?res.code, msg = %res.msg, "register rejected"),
                    Err(e) => warn!(error = %e, "register response decode failed"),
                }
            }
            Err(e) => warn!(error = %e, "service register response failed"),
        }
    }

    fn registry_heartbeat_tick(&self) {
        let Some(registry) = self.registry.lock().clone() else { return };
        debug!("registry heartbeat");
        if registry.send_frame(&Frame::heartbeat()).is_err() || registry.recv_frame().is_err() {
            // No answer: assume the registry is gone.
            debug!("registry closed");
            if let Some(t) = self.registry_heartbeat.lock().take() {
                t.cancel();
            }
        }
    }
}
