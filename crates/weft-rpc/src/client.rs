//! RPC client: one connection, a sender task draining the outbound
//! channel, a receiver task dispatching inbound frames by type, and
//! per-call single-slot reply channels matched by sequence id.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tracing::{debug, info, warn};
use weft::channel::{Channel, PopError};
use weft::{INFINITE, Runtime, Socket};
use weft_codec::{Decode, Encode, Frame, MsgType, Serializer};

use crate::result::RpcResult;
use crate::stream::Session;

const OUTBOUND_CAPACITY: usize = 2;
const HEARTBEAT_PERIOD_MS: u64 = 30_000;

pub(crate) type SubscribeCallback = Arc<dyn Fn(&mut Serializer) + Send + Sync + 'static>;

pub struct RpcClient {
    session: spin::Mutex<Option<Arc<Session>>>,
    outbound: Channel<Frame>,
    seq: AtomicU32,
    // Sequence id → the caller's single-slot reply channel. `None` in
    // the slot means the session closed under the call.
    calls: spin::Mutex<HashMap<u32, Channel<Option<Frame>>>>,
    subscribes: spin::Mutex<HashMap<String, SubscribeCallback>>,
    timeout_ms: AtomicU64,
    closed: AtomicBool,
    auto_heartbeat: bool,
    heartbeat_outstanding: AtomicBool,
    heartbeat_timer: spin::Mutex<Option<weft::TimerHandle>>,
}

impl RpcClient {
    pub fn new(auto_heartbeat: bool) -> Arc<Self> {
        Arc::new(Self {
            session: spin::Mutex::new(None),
            outbound: Channel::new(OUTBOUND_CAPACITY),
            seq: AtomicU32::new(0),
            calls: spin::Mutex::new(HashMap::new()),
            subscribes: spin::Mutex::new(HashMap::new()),
            timeout_ms: AtomicU64::new(INFINITE),
            closed: AtomicBool::new(true),
            auto_heartbeat,
            heartbeat_outstanding: AtomicBool::new(false),
            heartbeat_timer: spin::Mutex::new(None),
        })
    }

    /// Per-call deadline in milliseconds ([`INFINITE`] disables it).
    pub fn set_timeout(&self, ms: u64) {
        self.timeout_ms.store(ms, Ordering::Release);
    }

    /// Open the connection and start the session's sender and receiver
    /// tasks. Must run on a scheduler task.
    pub fn connect(self: &Arc<Self>, addr: &SocketAddr) -> io::Result<()> {
        let sock = Socket::tcp(addr)?;
        let timeout = self.timeout_ms.load(Ordering::Acquire);
        sock.connect(addr, (timeout != INFINITE).then_some(timeout))?;
        let session = Arc::new(Session::new(Arc::new(sock)));
        debug!(peer = ?session.socket().peer_addr().ok(), "client connected");
        *self.session.lock() = Some(session);
        self.closed.store(false, Ordering::Release);
        self.heartbeat_outstanding.store(false, Ordering::Release);

        let rt = Runtime::current_or_global();
        let me = self.clone();
        rt.submit(move || me.sender_loop());
        let me = self.clone();
        rt.submit(move || me.receiver_loop());

        if self.auto_heartbeat {
            let weak = Arc::downgrade(self);
            let timer = rt.add_timer(
                HEARTBEAT_PERIOD_MS,
                move || {
                    let Some(client) = weak.upgrade() else { return };
                    if client.heartbeat_outstanding.load(Ordering::Acquire) {
                        info!("server heartbeat lost, closing");
                        client.close();
                        return;
                    }
                    client.heartbeat_outstanding.store(true, Ordering::Release);
                    let _ = client.outbound.push(Frame::heartbeat());
                },
                true,
            );
            *self.heartbeat_timer.lock() = Some(timer);
        }
        Ok(())
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session()?.socket().peer_addr().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// In-flight calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Invoke `name` with `args` (a tuple; `()` for none) and decode a
    /// `Result<T>` reply.
    pub fn call<T: Decode, A: Encode>(&self, name: &str, args: A) -> RpcResult<T> {
        let mut s = Serializer::new();
        s.write(name);
        s.write(&args);
        self.call_raw(s.into_vec())
    }

    /// Invoke with a pre-encoded `name + args` body.
    pub fn call_raw<T: Decode>(&self, body: Vec<u8>) -> RpcResult<T> {
        let Some(session) = self.session() else {
            return RpcResult::closed("socket closed");
        };
        if self.is_closed() || !session.is_connected() {
            return RpcResult::closed("socket closed");
        }

        let reply: Channel<Option<Frame>> = Channel::new(1);
        let id = self.seq.fetch_add(1, Ordering::AcqRel);
        self.calls.lock().insert(id, reply.clone());

        if self.outbound.push(Frame::new(MsgType::MethodRequest, body, id)).is_err() {
            self.calls.lock().remove(&id);
            return RpcResult::closed("socket closed");
        }

        let outcome = reply.pop_timeout(self.timeout_ms.load(Ordering::Acquire));
        // The map entry goes away on every exit path.
        self.calls.lock().remove(&id);

        match outcome {
            Err(PopError::Timeout) => RpcResult::timeout("call timeout"),
            Err(PopError::Closed) | Ok(None) => RpcResult::closed("socket closed"),
            Ok(Some(frame)) => {
                if frame.body.is_empty() {
                    return RpcResult::no_method("method not found");
                }
                let mut s = Serializer::from_bytes(&frame.body);
                match s.read::<RpcResult<T>>() {
                    Ok(res) => res,
                    Err(_) => RpcResult::args_not_match("return value not match"),
                }
            }
        }
    }

    /// Register a callback for server-pushed messages under `key` and
    /// tell the server. A duplicate key is a no-op.
    pub fn subscribe(&self, key: &str, cb: impl Fn(&mut Serializer) + Send + Sync + 'static) {
        {
            let mut subs = self.subscribes.lock();
            if subs.contains_key(key) {
                return;
            }
            subs.insert(key.to_owned(), Arc::new(cb));
        }
        let mut s = Serializer::new();
        s.write(key);
        let _ = self.outbound.push(Frame::new(MsgType::SubscribeRequest, s.into_vec(), 0));
    }

    /// Tear the connection down: fail the outbound channel, hand every
    /// pending caller a null frame so it returns `Closed`, stop the
    /// heartbeat, close the socket (which wakes the receiver).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("client close");
        self.heartbeat_outstanding.store(true, Ordering::Release);
        self.outbound.close();
        let pending: Vec<Channel<Option<Frame>>> =
            self.calls.lock().drain().map(|(_, c)| c).collect();
        for c in pending {
            // No producer can find these channels any more; an empty
            // slot takes the null frame without blocking.
            if c.is_empty() {
                let _ = c.push(None);
            }
        }
        if let Some(t) = self.heartbeat_timer.lock().take() {
            t.cancel();
        }
        if let Some(s) = self.session() {
            s.close();
        }
    }

    fn sender_loop(&self) {
        let Some(session) = self.session() else { return };
        while let Some(frame) = self.outbound.pop() {
            if let Err(e) = session.send_frame(&frame) {
                warn!(error = %e, "send failed");
                break;
            }
        }
        debug!("sender task exit");
    }

    fn receiver_loop(&self) {
        let Some(session) = self.session() else { return };
        if !session.is_connected() {
            warn!("receiver started on a dead session");
            return;
        }
        loop {
            let frame = match session.recv_frame() {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "receive failed, closing");
                    self.close();
                    break;
                }
            };
            self.heartbeat_outstanding.store(false, Ordering::Release);
            match frame.msg_type() {
                Some(MsgType::Heartbeat) => {}
                Some(MsgType::MethodResponse) => self.on_method_response(frame),
                Some(MsgType::PublishRequest) => {
                    let seq = frame.seq_id;
                    self.on_publish(&frame);
                    let _ =
                        self.outbound.push(Frame::new(MsgType::PublishResponse, Vec::new(), seq));
                }
                Some(MsgType::SubscribeResponse) => {}
                _ => debug!(ty = frame.ty, "ignored frame"),
            }
        }
        debug!("receiver task exit");
    }

    fn on_method_response(&self, frame: Frame) {
        let chan = self.calls.lock().get(&frame.seq_id).cloned();
        // No entry: the caller gave up (timeout) and already left.
        if let Some(chan) = chan {
            let _ = chan.push(Some(frame));
        }
    }

    fn on_publish(&self, frame: &Frame) {
        let mut s = Serializer::from_bytes(&frame.body);
        let Ok(key) = s.read::<String>() else {
            debug!("publish frame with undecodable key");
            return;
        };
        let cb = self.subscribes.lock().get(&key).cloned();
        if let Some(cb) = cb {
            cb(&mut s);
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}
