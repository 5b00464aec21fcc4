use thiserror::Error;

pub type ResultT<A> = std::result::Result<A, Error>;

/// Client-side failures. Server error replies are not errors at this level;
/// they are delivered to the caller as [`Reply::Error`](super::protocol::Reply)
/// values.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("pipeline commands in redis cluster must have same hash tag")]
    CrossSlot,

    #[error("redis cluster no valid connection to slot {0}")]
    NoConnection(u16),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("cluster topology error: {0}")]
    Topology(String),
}

/// Connection settings for a single server endpoint.
#[derive(Debug, Clone, Default)]
pub struct RedisConf {
    pub addr: String,
    pub port: u16,
    pub auth: String,
    pub db: i64,
}
