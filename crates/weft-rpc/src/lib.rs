//! RPC framework over the weft runtime: a framed binary session layer,
//! client and server peers with heartbeats and pub/sub, a service
//! registry and a client-side connection pool with load-balanced
//! provider selection.

mod client;
mod pool;
mod registry;
mod result;
mod route;
mod server;
mod stream;

pub use client::RpcClient;
pub use pool::RpcPool;
pub use registry::{Registry, SERVICE_SUBSCRIBE_PREFIX, service_subscribe_key};
pub use result::{RpcCode, RpcResult};
pub use route::Strategy;
pub use server::{RpcHandler, RpcServer};
pub use stream::{Session, SocketStream};
