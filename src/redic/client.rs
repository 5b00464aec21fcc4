use std::sync::Arc;

use log::error;

use super::command::Command;
use super::conn::Conn;
use super::protocol::Reply;
use super::types::{RedisConf, ResultT};

/// Single-node facade: one connection, submissions forwarded as-is.
pub struct RedisClient {
    conn: Arc<Conn>,
}

impl Default for RedisClient {
    fn default() -> Self {
        RedisClient::new()
    }
}

impl RedisClient {
    pub fn new() -> RedisClient {
        RedisClient {
            conn: Arc::new(Conn::new()),
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pass: &str,
        db: i64,
        timeout_ms: u64,
    ) -> ResultT<()> {
        self.conn.connect(host, port, pass, db, timeout_ms).await
    }

    pub async fn connect_conf(&self, conf: &RedisConf, timeout_ms: u64) -> ResultT<()> {
        self.connect(&conf.addr, conf.port, &conf.auth, conf.db, timeout_ms)
            .await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub async fn query(&self, cmd: Command) -> ResultT<Reply> {
        self.conn.query(cmd).await
    }

    pub fn run(&self, cmd: Command) {
        self.conn.run(cmd)
    }

    pub(crate) fn connection(&self) -> &Arc<Conn> {
        &self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

/// Callbacks for server-pushed subscriber traffic. Shared ownership: the
/// subscriber keeps its own `Arc`, so the callback outlives any dispatch
/// still in flight.
pub trait SubscriberCallback: Send + Sync + 'static {
    fn on_message(&self, channel: String, payload: Vec<u8>);
    fn on_pmessage(&self, pattern: String, channel: String, payload: Vec<u8>);
    fn on_meta(&self, kind: MetaKind, channel: Option<String>, count: i64);
}

/// A single-node client flagged subscriber-mode: replies arriving with an
/// empty pending queue are parsed and dispatched to the callback on their
/// own task, never on the connection driver.
pub struct RedisSubscriber {
    client: RedisClient,
    callback: Arc<dyn SubscriberCallback>,
}

impl RedisSubscriber {
    pub fn new(callback: Arc<dyn SubscriberCallback>) -> RedisSubscriber {
        RedisSubscriber {
            client: RedisClient::new(),
            callback,
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pass: &str,
        db: i64,
        timeout_ms: u64,
    ) -> ResultT<()> {
        let conn = self.client.connection();
        conn.mark_subscriber();
        let callback = Arc::clone(&self.callback);
        let addr = format!("{}:{}", host, port);
        conn.set_reply_callback(Arc::new(move |rpl| dispatch(&addr, &callback, rpl)));
        self.client.connect(host, port, pass, db, timeout_ms).await
    }

    pub async fn connect_conf(&self, conf: &RedisConf, timeout_ms: u64) -> ResultT<()> {
        self.connect(&conf.addr, conf.port, &conf.auth, conf.db, timeout_ms)
            .await
    }

    pub async fn close(&self) {
        self.client.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn subscribe(&self, channels: &[&str]) {
        self.send(Command::single().subscribe(channels));
    }

    /// An empty slice unsubscribes from everything.
    pub fn unsubscribe(&self, channels: &[&str]) {
        self.send(Command::single().unsubscribe(channels));
    }

    pub fn psubscribe(&self, patterns: &[&str]) {
        self.send(Command::single().psubscribe(patterns));
    }

    pub fn punsubscribe(&self, patterns: &[&str]) {
        self.send(Command::single().punsubscribe(patterns));
    }

    // acknowledgements come back as unsolicited replies, so the bytes go
    // out without a pending entry
    fn send(&self, cmd: Command) {
        self.client.connection().send(cmd.build().serialize());
    }
}

fn meta_kind(kind: &str) -> Option<MetaKind> {
    match kind {
        "subscribe" => Some(MetaKind::Subscribe),
        "unsubscribe" => Some(MetaKind::Unsubscribe),
        "psubscribe" => Some(MetaKind::PSubscribe),
        "punsubscribe" => Some(MetaKind::PUnsubscribe),
        _ => None,
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Validate the pushed reply's shape and hand it to the callback on a fresh
/// task. Mismatches are logged and dropped.
fn dispatch(addr: &str, callback: &Arc<dyn SubscriberCallback>, rpl: Reply) {
    let kind = match rpl
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(Reply::as_str)
    {
        Some(kind) => kind.to_string(),
        None => {
            error!("subscriber[{}] received unexpected reply: {}", addr, rpl);
            return;
        }
    };
    match kind.as_str() {
        "message" => {
            let mut arr = match rpl.into_array() {
                Some(arr) => arr,
                None => return,
            };
            if arr.len() != 3 || !arr[1].is_string() || !arr[2].is_string() {
                error!("subscriber[{}] received malformed message", addr);
                return;
            }
            let payload = arr.pop().and_then(Reply::into_bytes).unwrap_or_default();
            let channel = arr.pop().and_then(Reply::into_bytes).unwrap_or_default();
            let callback = Arc::clone(callback);
            tokio::spawn(async move {
                callback.on_message(lossy(channel), payload);
            });
        }
        "pmessage" => {
            let mut arr = match rpl.into_array() {
                Some(arr) => arr,
                None => return,
            };
            if arr.len() != 4 || !arr[1].is_string() || !arr[2].is_string() || !arr[3].is_string()
            {
                error!("subscriber[{}] received malformed pmessage", addr);
                return;
            }
            let payload = arr.pop().and_then(Reply::into_bytes).unwrap_or_default();
            let channel = arr.pop().and_then(Reply::into_bytes).unwrap_or_default();
            let pattern = arr.pop().and_then(Reply::into_bytes).unwrap_or_default();
            let callback = Arc::clone(callback);
            tokio::spawn(async move {
                callback.on_pmessage(lossy(pattern), lossy(channel), payload);
            });
        }
        _ => {
            let kind = match meta_kind(&kind) {
                Some(kind) => kind,
                None => {
                    error!("subscriber[{}] received unknown push kind: {}", addr, kind);
                    return;
                }
            };
            let mut arr = match rpl.into_array() {
                Some(arr) => arr,
                None => return,
            };
            if arr.len() != 3 || !(arr[1].is_string() || arr[1].is_null()) || !arr[2].is_integer()
            {
                error!("subscriber[{}] received malformed meta reply", addr);
                return;
            }
            let count = arr.pop().and_then(|r| r.as_integer()).unwrap_or(0);
            let channel = arr.pop().and_then(Reply::into_bytes).map(lossy);
            let callback = Arc::clone(callback);
            tokio::spawn(async move {
                callback.on_meta(kind, channel, count);
            });
        }
    }
}
