//! Asynchronous client for Redis-compatible servers.
//!
//! Three deployment modes share one submission contract
//! (`query` awaits a [`Reply`], `run` fires and forgets):
//!
//! - [`RedisClient`]: one connection to one server,
//! - [`ClusterClient`]: slot-aware routing over a sharded cluster with
//!   MOVED/ASK redirection handling,
//! - [`RedisSubscriber`]: a long-lived pub/sub connection delivering
//!   server-pushed messages to a callback.
//!
//! Connections reconnect on their own with linear backoff, re-run the
//! handshake, and replay commands that never got their reply.

pub mod redic;

pub use crate::redic::client::{MetaKind, RedisClient, RedisSubscriber, SubscriberCallback};
pub use crate::redic::cluster::{ClusterClient, Node, Slot};
pub use crate::redic::command::{cmd, pipeline, Command};
pub use crate::redic::conn::Conn;
pub use crate::redic::protocol::Reply;
pub use crate::redic::types::{Error, RedisConf, ResultT};
