use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{span, Instrument, Level};

use super::cluster::ClusterConns;
use super::command::{asking_part, Command, CommandPart};
use super::parser::ReplyDecoder;
use super::protocol::Reply;
use super::types::{Error, ResultT};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const MAX_RECONNECT_DELAY_MS: u64 = 5000;
const REDIRECT_LIMIT: u32 = 5;

/// Installed on subscriber connections; receives every reply that arrives
/// while the pending queue is empty.
pub type ReplyCallback = Arc<dyn Fn(Reply) + Send + Sync>;

/// One submitted command group waiting for its replies. Lives in the
/// connection's pending queue from submission until every slot is filled,
/// the entry is redirected away, or the connection is torn down.
pub(crate) struct PendingEntry {
    parts: Vec<CommandPart>,
    replies: Vec<Option<Reply>>,
    filled: usize,
    reply_tx: Option<oneshot::Sender<Reply>>,
    ignore: bool,
    pipeline: bool,
    pub(crate) redirects: u32,
}

impl PendingEntry {
    fn new(cmd: Command, reply_tx: Option<oneshot::Sender<Reply>>, ignore: bool) -> PendingEntry {
        let pipeline = cmd.is_pipeline();
        let parts = cmd.into_parts();
        let replies = vec![None; parts.len()];
        PendingEntry {
            parts,
            replies,
            filled: 0,
            reply_tx,
            ignore,
            pipeline,
            redirects: 0,
        }
    }

    /// Place one arrived reply into the next unfilled slot.
    fn fill(&mut self, rpl: Reply) {
        for i in 0..self.parts.len() {
            if self.replies[i].is_some() {
                continue;
            }
            if (self.ignore || self.parts[i].ignore) && rpl.is_error() {
                error!("redis command result error: {}", rpl);
            }
            self.replies[i] = Some(rpl);
            self.filled += 1;
            return;
        }
        warn!("received a reply with no unfilled command slot");
    }

    fn is_complete(&self) -> bool {
        self.filled == self.parts.len()
    }

    fn has_redirect(&self) -> bool {
        self.replies.iter().flatten().any(Reply::is_redirect)
    }

    pub(crate) fn has_moved(&self) -> bool {
        self.replies.iter().flatten().any(Reply::is_moved_error)
    }

    pub(crate) fn first_redirect(&self) -> Option<&str> {
        self.replies.iter().flatten().find_map(|rpl| match rpl {
            Reply::MovedError(text) | Reply::AskError(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Clear every redirected and unfilled slot and return the wire bytes to
    /// resend, splicing an ignored `ASKING` ahead of each cleared ASK slot.
    /// Used both by the reconnect replay and by cluster redirection.
    pub(crate) fn resend_bytes(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut i = 0;
        while i < self.parts.len() {
            let ask = match &self.replies[i] {
                None => Some(false),
                Some(rpl) if rpl.is_ask_error() => Some(true),
                Some(rpl) if rpl.is_moved_error() => Some(false),
                Some(_) => None,
            };
            match ask {
                None => i += 1,
                Some(ask) => {
                    if self.replies[i].take().is_some() {
                        self.filled -= 1;
                    }
                    if ask {
                        self.parts.insert(i, asking_part());
                        self.replies.insert(i, None);
                        buf.extend_from_slice(&self.parts[i].bytes);
                        i += 1;
                    }
                    buf.extend_from_slice(&self.parts[i].bytes);
                    i += 1;
                }
            }
        }
        buf
    }

    /// Assemble the final reply and resolve the caller. Ignored parts are
    /// excluded; a one-part non-pipeline result is unwrapped.
    pub(crate) fn complete(mut self) {
        let reply_tx = match self.reply_tx.take() {
            Some(tx) => tx,
            None => return,
        };
        let mut results = Vec::new();
        for (part, rpl) in self.parts.iter().zip(self.replies.drain(0..)) {
            if part.ignore {
                continue;
            }
            if let Some(rpl) = rpl {
                results.push(rpl);
            }
        }
        let reply = if !self.pipeline && results.len() == 1 {
            match results.pop() {
                Some(rpl) => rpl,
                None => Reply::Null,
            }
        } else {
            Reply::Array(results)
        };
        // a dropped caller just discards the reply
        let _ = reply_tx.send(reply);
    }
}

#[derive(Clone)]
struct ConnTarget {
    host: String,
    port: u16,
    pass: String,
    db: i64,
    timeout_ms: u64,
}

struct ConnState {
    cluster: bool,
    subscriber: AtomicBool,
    target: Mutex<Option<ConnTarget>>,
    pending: Mutex<VecDeque<PendingEntry>>,
    connected: AtomicBool,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_count: AtomicU32,
    reply_cb: Mutex<Option<ReplyCallback>>,
    router: Mutex<Weak<ClusterConns>>,
    shutdown: Notify,
}

impl ConnState {
    fn addr(&self) -> String {
        match self.target.lock().unwrap().as_ref() {
            Some(t) => format!("{}:{}", t.host, t.port),
            None => "<unconnected>".to_string(),
        }
    }

    fn target(&self) -> Option<ConnTarget> {
        self.target.lock().unwrap().clone()
    }

    /// Pair one arrived reply against the head pending entry, or hand it to
    /// the subscriber callback when nothing is pending.
    fn on_reply(&self, rpl: Reply) {
        let completed = {
            let mut pending = self.pending.lock().unwrap();
            match pending.front_mut() {
                Some(entry) => {
                    entry.fill(rpl);
                    if entry.is_complete() {
                        pending.pop_front()
                    } else {
                        return;
                    }
                }
                None => {
                    drop(pending);
                    self.dispatch_unsolicited(rpl);
                    return;
                }
            }
        };
        if let Some(entry) = completed {
            self.finish_entry(entry);
        }
    }

    fn dispatch_unsolicited(&self, rpl: Reply) {
        if self.subscriber.load(Ordering::SeqCst) {
            let cb = self.reply_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(rpl);
                return;
            }
        }
        debug!("redis[{}] dropped unsolicited reply: {}", self.addr(), rpl);
    }

    /// A completed entry either goes back out through the cluster router
    /// (redirection) or resolves its caller.
    fn finish_entry(&self, entry: PendingEntry) {
        if self.cluster && entry.has_redirect() {
            if entry.redirects >= REDIRECT_LIMIT {
                warn!(
                    "redis[{}] giving up after {} redirects",
                    self.addr(),
                    entry.redirects
                );
            } else if let Some(router) = self.router.lock().unwrap().upgrade() {
                router.redirect(entry);
                return;
            } else {
                warn!(
                    "redis[{}] redirection dropped, cluster router is gone",
                    self.addr()
                );
            }
        }
        entry.complete();
    }

    /// Build the replay buffer for a fresh socket and flip the connected
    /// flag under the queue lock, so submissions either land in the replay
    /// or write behind it, never both.
    fn replay_and_mark_connected(&self) -> Vec<u8> {
        let mut pending = self.pending.lock().unwrap();
        let mut buf = Vec::new();
        for entry in pending.iter_mut() {
            buf.extend_from_slice(&entry.resend_bytes());
        }
        self.connected.store(true, Ordering::SeqCst);
        buf
    }

    /// Flips `closing` under the queue lock so no submission can slip in
    /// behind the drain and wait forever.
    fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        self.closing.store(true, Ordering::SeqCst);
        if !pending.is_empty() {
            warn!(
                "redis[{}] dropping {} pending command groups",
                self.addr(),
                pending.len()
            );
        }
        // dropping the entries drops their reply senders; waiting callers
        // observe a closed connection
        pending.clear();
    }
}

/// One logical connection to one server endpoint. The socket lives inside a
/// spawned driver task; this handle enqueues work and crosses into the
/// driver over a channel. Cheap to share behind an `Arc`.
pub struct Conn {
    state: Arc<ConnState>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    closed_rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl Default for Conn {
    fn default() -> Self {
        Conn::new()
    }
}

impl Conn {
    pub fn new() -> Conn {
        Conn::with_state(false, Weak::new())
    }

    pub(crate) fn for_cluster(router: Weak<ClusterConns>) -> Conn {
        Conn::with_state(true, router)
    }

    fn with_state(cluster: bool, router: Weak<ClusterConns>) -> Conn {
        Conn {
            state: Arc::new(ConnState {
                cluster,
                subscriber: AtomicBool::new(false),
                target: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_count: AtomicU32::new(0),
                reply_cb: Mutex::new(None),
                router: Mutex::new(router),
                shutdown: Notify::new(),
            }),
            write_tx: Mutex::new(None),
            closed_rx: Mutex::new(None),
        }
    }

    /// Establish the socket and run the handshake (`AUTH` when a password is
    /// set, `SELECT` for a non-zero db outside cluster mode). Resolves once
    /// the handshake went through; the driver keeps running afterwards and
    /// reconnects on its own.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pass: &str,
        db: i64,
        timeout_ms: u64,
    ) -> ResultT<()> {
        {
            let mut target = self.state.target.lock().unwrap();
            if target.is_some() {
                return Err(Error::InvalidArgument("connection already started"));
            }
            *target = Some(ConnTarget {
                host: host.to_string(),
                port,
                pass: pass.to_string(),
                db,
                timeout_ms: if timeout_ms == 0 {
                    DEFAULT_CONNECT_TIMEOUT_MS
                } else {
                    timeout_ms
                },
            });
        }
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        *self.write_tx.lock().unwrap() = Some(write_tx);
        *self.closed_rx.lock().unwrap() = Some(closed_rx);

        let state = Arc::clone(&self.state);
        let span = span!(Level::DEBUG, "redis_conn", addr = %self.addr());
        tokio::spawn(drive(state, write_rx, ready_tx, closed_tx).instrument(span));

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Submit a command group and await its reply. Server error replies are
    /// delivered as values; only client-side failures are `Err`.
    pub async fn query(&self, cmd: Command) -> ResultT<Reply> {
        let cmd = cmd.build();
        if cmd.is_empty() {
            return Err(Error::InvalidArgument("please give at least one command"));
        }
        let bytes = cmd.serialize();
        let (tx, rx) = oneshot::channel();
        self.enqueue(PendingEntry::new(cmd, Some(tx), false), bytes);
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Fire and forget: replies are discarded, error replies logged.
    pub fn run(&self, cmd: Command) {
        let cmd = cmd.build();
        if cmd.is_empty() {
            return;
        }
        let bytes = cmd.serialize();
        self.enqueue(PendingEntry::new(cmd, None, true), bytes);
    }

    /// Write raw bytes without queueing a pending entry. Subscriber verbs
    /// use this; their acknowledgements arrive as unsolicited replies.
    pub fn send(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.write_tx.lock().unwrap().as_ref() {
            if tx.send(bytes).is_err() {
                debug!("redis[{}] write channel is gone", self.addr());
            }
        }
    }

    fn enqueue(&self, entry: PendingEntry, bytes: Vec<u8>) {
        let mut pending = self.state.pending.lock().unwrap();
        if self.state.closing.load(Ordering::SeqCst) {
            // dropping the entry fails the caller's awaitable
            return;
        }
        pending.push_back(entry);
        if self.state.connected.load(Ordering::SeqCst) {
            self.send(bytes);
        }
        // when disconnected the reconnect replay picks the bytes up
    }

    /// Hand an entry back in after redirection; only the cleared parts'
    /// bytes are on the wire again.
    pub(crate) fn requeue(&self, entry: PendingEntry, bytes: Vec<u8>) {
        self.enqueue(entry, bytes);
    }

    /// Idempotent. Signals the driver, which tears the socket down and fails
    /// everything still pending, then waits for the teardown.
    pub async fn close(&self) {
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("close redis connection [{}]", self.addr());
        self.state.shutdown.notify_one();
        self.write_tx.lock().unwrap().take();
        let closed_rx = self.closed_rx.lock().unwrap().clone();
        if let Some(mut closed_rx) = closed_rx {
            while !*closed_rx.borrow() {
                if closed_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst) && !self.state.closing.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::SeqCst)
    }

    pub fn is_cluster_conn(&self) -> bool {
        self.state.cluster
    }

    pub fn is_subscriber_conn(&self) -> bool {
        self.state.subscriber.load(Ordering::SeqCst)
    }

    pub fn mark_subscriber(&self) {
        self.state.subscriber.store(true, Ordering::SeqCst);
    }

    pub fn set_reply_callback(&self, cb: ReplyCallback) {
        *self.state.reply_cb.lock().unwrap() = Some(cb);
    }

    pub fn addr(&self) -> String {
        self.state.addr()
    }
}

/// The connection driver: owns the socket, dials (and re-dials with
/// backoff), handshakes, replays, then multiplexes writes from the channel
/// with reads from the wire until shutdown.
async fn drive(
    state: Arc<ConnState>,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ready_tx: oneshot::Sender<ResultT<()>>,
    closed_tx: watch::Sender<bool>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut decoder = ReplyDecoder::new();
    let target = match state.target() {
        Some(t) => t,
        None => return,
    };

    'dial: loop {
        if state.closing.load(Ordering::SeqCst) {
            break;
        }
        let attempt = state.reconnect_count.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            let delay = (u64::from(attempt) * 1000).min(MAX_RECONNECT_DELAY_MS);
            debug!(
                "redis[{}] reconnect attempt {} in {}ms",
                state.addr(),
                attempt,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = state.shutdown.notified() => break 'dial,
            }
            if state.closing.load(Ordering::SeqCst) {
                break;
            }
        }

        let dial = tokio::time::timeout(
            Duration::from_millis(target.timeout_ms),
            TcpStream::connect((target.host.as_str(), target.port)),
        );
        let stream = tokio::select! {
            res = dial => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(Error::Io(err)));
                        break 'dial;
                    }
                    error!(
                        "connect to redis [{}] err:{}, reconnect_count:{}",
                        state.addr(),
                        err,
                        attempt
                    );
                    continue 'dial;
                }
                Err(_) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(Error::ConnectTimeout {
                            addr: state.addr(),
                            timeout_ms: target.timeout_ms,
                        }));
                        break 'dial;
                    }
                    error!(
                        "connect to redis [{}] timed out after {}ms, reconnect_count:{}",
                        state.addr(),
                        target.timeout_ms,
                        attempt
                    );
                    continue 'dial;
                }
            },
            _ = state.shutdown.notified() => break 'dial,
        };

        let (mut reader, mut writer) = stream.into_split();
        decoder.reset();
        if let Err(err) = handshake(&state, &target, &mut reader, &mut writer, &mut decoder).await
        {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(err));
                break 'dial;
            }
            error!("reconnect to redis[{}] error:{}", state.addr(), err);
            continue 'dial;
        }

        // bytes staged for the dead socket are stale; the replay covers
        // every part that still needs an answer
        while write_rx.try_recv().is_ok() {}
        let replay = state.replay_and_mark_connected();
        state.reconnect_count.store(0, Ordering::SeqCst);
        state.reconnecting.store(false, Ordering::SeqCst);
        if !replay.is_empty() {
            debug!(
                "redis[{}] replaying {} bytes of pending commands",
                state.addr(),
                replay.len()
            );
            if let Err(err) = writer.write_all(&replay).await {
                error!("redis[{}] replay write error:{}", state.addr(), err);
                state.connected.store(false, Ordering::SeqCst);
                state.reconnecting.store(true, Ordering::SeqCst);
                continue 'dial;
            }
        }
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        info!("connected to redis [{}]", state.addr());

        loop {
            tokio::select! {
                biased;
                _ = state.shutdown.notified() => break 'dial,
                op = write_rx.recv() => match op {
                    Some(bytes) => {
                        if let Err(err) = writer.write_all(&bytes).await {
                            error!("redis conn write error:{}", err);
                            break;
                        }
                    }
                    // every handle is gone; nobody can submit or observe
                    None => break 'dial,
                },
                read = reader.read_buf(decoder.buf_mut()) => match read {
                    Ok(0) => {
                        error!("redis conn[{}] lost, closed by server", state.addr());
                        break;
                    }
                    Ok(_) => {
                        let mut corrupt = false;
                        loop {
                            match decoder.next_reply() {
                                Ok(Some(rpl)) => state.on_reply(rpl),
                                Ok(None) => break,
                                Err(err) => {
                                    error!("redis conn[{}] {}", state.addr(), err);
                                    decoder.reset();
                                    corrupt = true;
                                    break;
                                }
                            }
                        }
                        if corrupt {
                            break;
                        }
                    }
                    Err(err) => {
                        error!("redis conn read error:{}", err);
                        break;
                    }
                },
            }
        }

        state.connected.store(false, Ordering::SeqCst);
        if state.closing.load(Ordering::SeqCst) {
            break;
        }
        state.reconnecting.store(true, Ordering::SeqCst);
        warn!("redis conn[{}] lost, reconnecting", state.addr());
    }

    state.connected.store(false, Ordering::SeqCst);
    state.fail_pending();
    let _ = closed_tx.send(true);
    debug!("redis conn[{}] driver stopped", state.addr());
}

async fn handshake(
    state: &ConnState,
    target: &ConnTarget,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    decoder: &mut ReplyDecoder,
) -> ResultT<()> {
    if !target.pass.is_empty() {
        let auth = Command::single().auth(&target.pass).build().serialize();
        writer.write_all(&auth).await?;
        let rpl = read_reply(reader, decoder).await?;
        if rpl.is_error() {
            return Err(Error::Handshake(format!("AUTH failed: {}", rpl)));
        }
    }
    if target.db != 0 && !state.cluster {
        let select = Command::single().select(target.db).build().serialize();
        writer.write_all(&select).await?;
        let rpl = read_reply(reader, decoder).await?;
        if rpl.is_error() {
            return Err(Error::Handshake(format!(
                "SELECT {} failed: {}",
                target.db, rpl
            )));
        }
    }
    Ok(())
}

async fn read_reply(reader: &mut OwnedReadHalf, decoder: &mut ReplyDecoder) -> ResultT<Reply> {
    loop {
        if let Some(rpl) = decoder.next_reply()? {
            return Ok(rpl);
        }
        let n = reader.read_buf(decoder.buf_mut()).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redic::command::{cmd, pipeline};
    use tokio::net::TcpListener;

    /// Read from the socket until `n` complete commands arrived. Commands
    /// come in as RESP arrays, so the reply decoder doubles as the request
    /// decoder.
    async fn expect_commands(
        stream: &mut TcpStream,
        decoder: &mut ReplyDecoder,
        n: usize,
    ) -> Vec<Reply> {
        let mut seen = Vec::new();
        while seen.len() < n {
            if let Some(rpl) = decoder.next_reply().unwrap() {
                seen.push(rpl);
                continue;
            }
            let read = stream.read_buf(decoder.buf_mut()).await.unwrap();
            assert!(read > 0, "client closed early");
        }
        seen
    }

    fn verb(rpl: &Reply) -> String {
        rpl.as_array()
            .and_then(|arr| arr.first())
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string()
    }

    async fn local_listener() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_query_set_get() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "SET");
            stream.write_all(b"+OK\r\n").await.unwrap();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "GET");
            stream.write_all(b"$3\r\nbar\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        assert!(conn.is_connected());
        assert!(!conn.is_cluster_conn());
        assert!(!conn.is_reconnecting());
        let rpl = conn.query(cmd("SET").key("foo").arg("bar")).await.unwrap();
        assert_eq!(rpl, Reply::SimpleString("OK".into()));
        let rpl = conn.query(cmd("GET").key("foo")).await.unwrap();
        assert_eq!(rpl, Reply::BulkString("bar".into()));
        conn.close().await;
        assert!(!conn.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_and_select() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "AUTH");
            stream.write_all(b"+OK\r\n").await.unwrap();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "SELECT");
            stream.write_all(b"+OK\r\n").await.unwrap();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "PING");
            stream.write_all(b"+PONG\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "sekret", 2, 2000).await.unwrap();
        let rpl = conn.query(cmd("PING")).await.unwrap();
        assert_eq!(rpl, Reply::SimpleString("PONG".into()));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_rejected() {
        let (listener, host, port) = local_listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 1).await;
            stream
                .write_all(b"-ERR invalid password\r\n")
                .await
                .unwrap();
        });

        let conn = Conn::new();
        match conn.connect(&host, port, "wrong", 0, 2000).await {
            Err(Error::Handshake(msg)) => assert!(msg.contains("AUTH")),
            other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_pipeline_reply_shape() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 2).await;
            stream.write_all(b"+OK\r\n$1\r\n1\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let rpl = conn.query(pipeline().set("a", "1").get("a")).await.unwrap();
        assert_eq!(
            rpl,
            Reply::Array(vec![
                Reply::SimpleString("OK".into()),
                Reply::BulkString("1".into()),
            ])
        );
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_ignored_part_is_excluded() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 2).await;
            stream.write_all(b"+OK\r\n$1\r\n1\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let rpl = conn
            .query(pipeline().set("a", "1").ignore().get("a"))
            .await
            .unwrap();
        assert_eq!(rpl, Reply::Array(vec![Reply::BulkString("1".into())]));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_pairing() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 2).await;
            stream.write_all(b"$1\r\n1\r\n$1\r\n2\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        // join! polls in order, so q1 is enqueued before q2
        let q1 = conn.query(cmd("GET").key("a"));
        let q2 = conn.query(cmd("GET").key("b"));
        let (r1, r2) = tokio::join!(q1, q2);
        assert_eq!(r1.unwrap(), Reply::BulkString("1".into()));
        assert_eq!(r2.unwrap(), Reply::BulkString("2".into()));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_discards_reply() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 2).await;
            stream.write_all(b"+OK\r\n+PONG\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        conn.run(cmd("SET").key("a").arg("1"));
        let rpl = conn.query(cmd("PING")).await.unwrap();
        assert_eq!(rpl, Reply::SimpleString("PONG".into()));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_query_fails_eagerly() {
        let conn = Conn::new();
        match conn.query(Command::single()).await {
            Err(Error::InvalidArgument(_)) => (),
            other => panic!("expected invalid argument, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (listener, host, port) = local_listener().await;
        let (got_tx, got_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 1).await;
            got_tx.send(()).unwrap();
            // hold the socket open without replying
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let conn = Arc::new(Conn::new());
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.query(cmd("GET").key("a")).await })
        };
        got_rx.await.unwrap();
        conn.close().await;
        match waiter.await.unwrap() {
            Err(Error::ConnectionClosed) => (),
            other => panic!("expected closed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reconnect_replays_unfilled_parts() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            // first connection: swallow the command and drop the socket
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "GET");
            drop(stream);
            // second connection: the replay carries the same command
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            let cmds = expect_commands(&mut stream, &mut decoder, 1).await;
            assert_eq!(verb(&cmds[0]), "GET");
            stream.write_all(b"$2\r\nok\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let rpl = conn.query(cmd("GET").key("a")).await.unwrap();
        assert_eq!(rpl, Reply::BulkString("ok".into()));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_resets_connection() {
        let (listener, host, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 1).await;
            // not a valid RESP type byte
            stream.write_all(b"xxx\r\n").await.unwrap();
            // the client must re-dial and replay
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = ReplyDecoder::new();
            expect_commands(&mut stream, &mut decoder, 1).await;
            stream.write_all(b"+OK\r\n").await.unwrap();
        });

        let conn = Conn::new();
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let rpl = conn.query(cmd("GET").key("a")).await.unwrap();
        assert_eq!(rpl, Reply::SimpleString("OK".into()));
        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_callback_gets_unsolicited_replies() {
        let (listener, host, port) = local_listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n")
                .await
                .unwrap();
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let conn = Conn::new();
        conn.mark_subscriber();
        assert!(conn.is_subscriber_conn());
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_reply_callback(Arc::new(move |rpl| {
            let _ = tx.send(rpl);
        }));
        conn.connect(&host, port, "", 0, 2000).await.unwrap();
        let rpl = rx.recv().await.unwrap();
        assert_eq!(
            rpl,
            Reply::Array(vec![
                Reply::BulkString("message".into()),
                Reply::BulkString("ch".into()),
                Reply::BulkString("hello".into()),
            ])
        );
        conn.close().await;
    }
}
