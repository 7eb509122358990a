//! Service registry: speaks the same framed protocol, maps service
//! names to provider addresses, and pushes provider lifecycle events to
//! subscribers.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};
use weft::{Runtime, Socket, TimerHandle};
use weft_codec::{Frame, MsgType, Serializer};

use crate::result::RpcResult;
use crate::stream::Session;

/// Reserved key prefix for provider lifecycle subscriptions; the
/// payload under it is `(launch: bool, provider_address: String)`.
pub const SERVICE_SUBSCRIBE_PREFIX: &str = "[[rpc service subscribe]]";

const HEARTBEAT_DEADLINE_MS: u64 = 40_000;

pub fn service_subscribe_key(service: &str) -> String {
    format!("{SERVICE_SUBSCRIBE_PREFIX}{service}")
}

#[derive(Default)]
struct RegistryState {
    /// service name → provider addresses (`host:port`, stored verbatim).
    services: BTreeMap<String, Vec<String>>,
    /// provider address → its service names, for O(k) disconnect sweeps.
    providers: HashMap<String, Vec<String>>,
    subscribers: HashMap<String, Vec<Weak<Session>>>,
}

pub struct Registry {
    listener: spin::Mutex<Option<Arc<Socket>>>,
    state: spin::Mutex<RegistryState>,
    // The runtime start() ran on, for teardown from foreign threads.
    worker: spin::Mutex<Option<Arc<Runtime>>>,
    stop: AtomicBool,
    heartbeat_deadline_ms: u64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listener: spin::Mutex::new(None),
            state: spin::Mutex::new(RegistryState::default()),
            worker: spin::Mutex::new(None),
            stop: AtomicBool::new(false),
            heartbeat_deadline_ms: HEARTBEAT_DEADLINE_MS,
        })
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let sock = Socket::tcp(addr)?;
        sock.bind(addr)?;
        sock.listen(1024)?;
        info!(local = %sock.local_addr()?, "registry bound");
        *self.listener.lock() = Some(Arc::new(sock));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref()?.local_addr().ok()
    }

    /// Start the accept loop. Must run on a scheduler task, after
    /// `bind`.
    pub fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().clone() else {
            warn!("registry started without a bound listener");
            return;
        };
        let rt = Runtime::current_or_global();
        *self.worker.lock() = Some(rt.clone());
        let me = self.clone();
        let accept_rt = rt.clone();
        rt.submit(move || {
            while !me.stop.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((sock, peer)) => {
                        debug!(%peer, "registry connection");
                        let session = Arc::new(Session::new(Arc::new(sock)));
                        let handler = me.clone();
                        accept_rt.submit(move || handler.handle_conn(&session, peer));
                    }
                    Err(e) => {
                        debug!(error = %e, "registry accept loop exit");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(listener) = self.listener.lock().take() else { return };
        if Runtime::current().is_some() {
            listener.close();
        } else if let Some(rt) = self.worker.lock().clone() {
            rt.submit(move || listener.close());
        } else {
            listener.close();
        }
    }

    /// Providers currently registered for `service`.
    pub fn providers_of(&self, service: &str) -> Vec<String> {
        self.state.lock().services.get(service).cloned().unwrap_or_default()
    }

    fn refresh_deadline(&self, deadline: &mut Option<TimerHandle>, session: &Arc<Session>) {
        match deadline {
            Some(t) => {
                t.reset(self.heartbeat_deadline_ms, true);
            }
            None => {
                let sock = session.socket().clone();
                *deadline = Some(Runtime::current_or_global().add_timer(
                    self.heartbeat_deadline_ms,
                    move || {
                        info!(fd = sock.raw_fd(), "registry peer heartbeat deadline");
                        sock.close();
                    },
                    false,
                ));
            }
        }
    }

    fn handle_conn(&self, session: &Arc<Session>, peer: SocketAddr) {
        let mut provider_addr: Option<String> = None;
        let mut deadline = None;
        self.refresh_deadline(&mut deadline, session);
        loop {
            let frame = match session.recv_frame() {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "registry peer gone");
                    break;
                }
            };
            self.refresh_deadline(&mut deadline, session);
            let response = match frame.msg_type() {
                Some(MsgType::Heartbeat) => Some(Frame::heartbeat()),
                Some(MsgType::ProviderAnnounce) => {
                    provider_addr = self.handle_announce(&frame, peer);
                    None
                }
                Some(MsgType::ServiceRegister) => {
                    self.handle_register(&frame, provider_addr.as_deref())
                }
                Some(MsgType::ServiceDiscover) => self.handle_discover(&frame),
                Some(MsgType::SubscribeRequest) => self.handle_subscribe(&frame, session),
                Some(MsgType::PublishResponse) => None,
                _ => {
                    warn!(ty = frame.ty, "registry ignoring frame");
                    None
                }
            };
            if let Some(response) = response {
                if session.send_frame(&response).is_err() {
                    break;
                }
            }
        }
        if let Some(addr) = provider_addr {
            debug!(provider = %addr, "unregistering provider");
            self.unregister_provider(&addr);
        }
        if let Some(t) = deadline {
            t.cancel();
        }
        session.close();
    }

    /// Body carries the provider's listen port; its address is the peer
    /// IP plus that port.
    fn handle_announce(&self, frame: &Frame, peer: SocketAddr) -> Option<String> {
        let mut s = Serializer::from_bytes(&frame.body);
        match s.read::<u32>() {
            Ok(port) => Some(format!("{}:{}", peer.ip(), port)),
            Err(e) => {
                warn!(error = %e, "provider announce decode failed");
                None
            }
        }
    }

    fn handle_register(&self, frame: &Frame, provider: Option<&str>) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.body);
        let name = s.read::<String>().ok()?;
        let Some(addr) = provider else {
            warn!(service = %name, "register without provider announce");
            return None;
        };
        info!(service = %name, provider = %addr, "service registered");
        {
            let mut st = self.state.lock();
            st.services.entry(name.clone()).or_default().push(addr.to_owned());
            st.providers.entry(addr.to_owned()).or_default().push(name.clone());
        }

        let mut out = Serializer::new();
        out.write(&RpcResult::success(name.clone()));
        let response = Frame::new(MsgType::ServiceDiscoverResponse, out.into_vec(), frame.seq_id);

        self.publish_lifecycle(&name, true, addr);
        Some(response)
    }

    /// Reply body: name, count, then count `Result<String>` entries
    /// (one `NoMethod` entry when nothing matches).
    fn handle_discover(&self, frame: &Frame) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.body);
        let name = s.read::<String>().ok()?;
        let providers = self.providers_of(&name);
        let results: Vec<RpcResult<String>> = if providers.is_empty() {
            vec![RpcResult::no_method(format!("discover service: {name}"))]
        } else {
            providers.into_iter().map(RpcResult::success).collect()
        };

        let mut out = Serializer::new();
        out.write(&name);
        out.write(&(results.len() as u32));
        for r in &results {
            out.write(r);
        }
        Some(Frame::new(MsgType::ServiceDiscoverResponse, out.into_vec(), frame.seq_id))
    }

    fn handle_subscribe(&self, frame: &Frame, session: &Arc<Session>) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.body);
        let key = s.read::<String>().ok()?;
        debug!(key = %key, "registry subscription");
        self.state
            .lock()
            .subscribers
            .entry(key)
            .or_default()
            .push(Arc::downgrade(session));
        let mut out = Serializer::new();
        out.write(&RpcResult::success(()));
        Some(Frame::new(MsgType::SubscribeResponse, out.into_vec(), frame.seq_id))
    }

    fn unregister_provider(&self, addr: &str) {
        let names = {
            let mut st = self.state.lock();
            let names = st.providers.remove(addr).unwrap_or_default();
            for name in &names {
                if let Some(list) = st.services.get_mut(name) {
                    list.retain(|a| a != addr);
                    if list.is_empty() {
                        st.services.remove(name);
                    }
                }
            }
            names
        };
        for name in names {
            self.publish_lifecycle(&name, false, addr);
        }
    }

    /// Push `(launch, provider_address)` to every live subscriber of the
    /// service's lifecycle key.
    fn publish_lifecycle(&self, service: &str, launch: bool, addr: &str) {
        let key = service_subscribe_key(service);
        let sessions: Vec<Arc<Session>> = {
            let st = self.state.lock();
            st.subscribers
                .get(&key)
                .map(|v| v.iter().filter_map(Weak::upgrade).collect())
                .unwrap_or_default()
        };
        if sessions.is_empty() {
            return;
        }
        debug!(service = %service, launch, provider = %addr, "lifecycle publish");
        let mut s = Serializer::new();
        s.write(&key);
        s.write(&(launch, addr.to_owned()));
        let body = s.into_vec();
        for session in sessions {
            let _ = session.send_frame(&Frame::new(MsgType::PublishRequest, body.clone(), 0));
        }
    }
}
