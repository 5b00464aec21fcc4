use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use rand::Rng;

use super::command::Command;
use super::conn::{Conn, PendingEntry};
use super::protocol::Reply;
use super::types::{Error, RedisConf, ResultT};

pub const SLOT_COUNT: u16 = 16384;
const SLOT_MASK: u16 = 0x3fff;

/* CRC16 implementation according to CCITT standards: the XMODEM variant the
 * cluster specification mandates.
 *
 * Name                       : "XMODEM", also known as "ZMODEM", "CRC-16/ACORN"
 * Width                      : 16 bit
 * Poly                       : 1021 (That is actually x^16 + x^12 + x^5 + 1)
 * Initialization             : 0000
 * Reflect Input byte         : False
 * Reflect Output CRC         : False
 * Xor constant to output CRC : 0000
 * Output for "123456789"     : 31C3
 */
#[rustfmt::skip]
const CRC16_TAB: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

pub fn crc16(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in buf {
        crc = (crc << 8) ^ CRC16_TAB[(((crc >> 8) ^ u16::from(b)) & 0x00ff) as usize];
    }
    crc
}

/// Slot of a key: hash the substring between the first `{` and the next `}`
/// when it is non-empty, the whole key otherwise.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    let open = match key.iter().position(|&c| c == b'{') {
        Some(open) => open,
        None => return crc16(key) & SLOT_MASK,
    };
    match key[open + 1..].iter().position(|&c| c == b'}') {
        // no '}' or nothing between the braces: hash the whole key
        None | Some(0) => crc16(key) & SLOT_MASK,
        Some(len) => crc16(&key[open + 1..open + 1 + len]) & SLOT_MASK,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub min: u16,
    pub max: u16,
}

/// One cluster endpoint. Identity is host and port; the replica flag rides
/// along for bookkeeping only.
#[derive(Debug, Clone)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub replica: bool,
}

impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Node) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Node) -> std::cmp::Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Shard {
    pub slot: Slot,
    pub master: Node,
    pub replicas: Vec<Node>,
}

/// Slot table keyed by each range's `max`, so the owner of a slot is the
/// first entry at or above it.
pub type Shards = BTreeMap<u16, Shard>;

fn shard_for(shards: &Shards, slot: u16) -> Option<&Shard> {
    let (_, shard) = shards.range(slot..).next()?;
    if slot < shard.slot.min {
        return None;
    }
    Some(shard)
}

/// Parse a `CLUSTER SLOTS` reply: one row per range, `[min, max, master,
/// ...replicas]`, each node as `[host, port, ...]`.
pub fn parse_slots(rpl: Reply) -> ResultT<Shards> {
    let rows = rpl
        .into_array()
        .ok_or_else(|| Error::Topology("CLUSTER SLOTS needs an array reply".into()))?;
    if rows.is_empty() {
        return Err(Error::Topology("empty slot table".into()));
    }
    let mut shards = Shards::new();
    for row in rows {
        let cols = row
            .into_array()
            .ok_or_else(|| Error::Topology("slot row must be an array".into()))?;
        if cols.len() < 3 {
            return Err(Error::Topology("slot row is too short".into()));
        }
        let mut cols = cols.into_iter();
        let min = int_field(cols.next(), "slot range start")?;
        let max = int_field(cols.next(), "slot range end")?;
        let master = parse_node(cols.next(), false)?;
        let mut replicas = Vec::new();
        for col in cols {
            replicas.push(parse_node(Some(col), true)?);
        }
        shards.insert(
            max,
            Shard {
                slot: Slot { min, max },
                master,
                replicas,
            },
        );
    }
    Ok(shards)
}

fn int_field(rpl: Option<Reply>, what: &str) -> ResultT<u16> {
    rpl.as_ref()
        .and_then(Reply::as_integer)
        .map(|i| i as u16)
        .ok_or_else(|| Error::Topology(format!("{} must be an integer", what)))
}

fn parse_node(rpl: Option<Reply>, replica: bool) -> ResultT<Node> {
    let arr = rpl
        .and_then(Reply::into_array)
        .ok_or_else(|| Error::Topology("cluster node info must be an array".into()))?;
    if arr.len() < 2 {
        return Err(Error::Topology("cluster node info is too short".into()));
    }
    let mut arr = arr.into_iter();
    let host = arr
        .next()
        .and_then(Reply::into_bytes)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .ok_or_else(|| Error::Topology("cluster node host must be a string".into()))?;
    let port = arr
        .next()
        .as_ref()
        .and_then(Reply::as_integer)
        .ok_or_else(|| Error::Topology("cluster node port must be an integer".into()))?;
    Ok(Node {
        host,
        port: port as u16,
        replica,
    })
}

/// `MOVED <slot> <host>:<port>` / `ASK <slot> <host>:<port>`
fn parse_redirect(text: &str) -> Option<Node> {
    let mut fields = text.split_whitespace();
    let _kind = fields.next()?;
    let _slot = fields.next()?;
    let addr = fields.next()?;
    let (host, port) = addr.rsplit_once(':')?;
    Some(Node {
        host: host.to_string(),
        port: port.parse().ok()?,
        replica: false,
    })
}

/// Slot of a command group. Every keyed part must agree; a keyless group is
/// routed to a uniformly random slot.
pub fn check_command_slot(cmd: &Command) -> ResultT<u16> {
    let mut slot = None;
    for part in cmd.parts() {
        if part.key.is_empty() {
            continue;
        }
        let s = key_hash_slot(&part.key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot.unwrap_or_else(|| rand::thread_rng().gen_range(0..SLOT_COUNT)))
}

#[derive(Default, Clone)]
struct ClusterAuth {
    pass: String,
    timeout_ms: u64,
}

/// Slot table plus one connection per master node. Connections hold a weak
/// reference back here so redirection can re-dispatch without a cycle.
pub struct ClusterConns {
    weak: Weak<ClusterConns>,
    shards: Mutex<Shards>,
    conns: Mutex<HashMap<Node, Arc<Conn>>>,
    auth: Mutex<ClusterAuth>,
}

impl ClusterConns {
    pub fn new() -> Arc<ClusterConns> {
        Arc::new_cyclic(|weak| ClusterConns {
            weak: weak.clone(),
            shards: Mutex::new(Shards::new()),
            conns: Mutex::new(HashMap::new()),
            auth: Mutex::new(ClusterAuth::default()),
        })
    }

    /// Dial the seed node and map the whole slot space to it; the first
    /// topology refresh replaces the placeholder.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pass: &str,
        timeout_ms: u64,
    ) -> ResultT<()> {
        *self.auth.lock().unwrap() = ClusterAuth {
            pass: pass.to_string(),
            timeout_ms,
        };
        let node = Node {
            host: host.to_string(),
            port,
            replica: false,
        };
        let conn = Arc::new(Conn::for_cluster(self.weak.clone()));
        self.conns
            .lock()
            .unwrap()
            .insert(node.clone(), Arc::clone(&conn));
        self.shards.lock().unwrap().insert(
            SLOT_COUNT - 1,
            Shard {
                slot: Slot {
                    min: 0,
                    max: SLOT_COUNT - 1,
                },
                master: node,
                replicas: Vec::new(),
            },
        );
        conn.connect(host, port, pass, 0, timeout_ms).await
    }

    pub async fn close(&self) {
        let conns: Vec<Arc<Conn>> = {
            let mut map = self.conns.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        self.shards.lock().unwrap().clear();
        for conn in conns {
            conn.close().await;
        }
    }

    fn get_conn(&self, slot: u16) -> Option<Arc<Conn>> {
        let node = {
            let shards = self.shards.lock().unwrap();
            shard_for(&shards, slot)?.master.clone()
        };
        self.conns.lock().unwrap().get(&node).cloned()
    }

    pub(crate) fn node_conn(&self, node: &Node) -> Option<Arc<Conn>> {
        self.conns.lock().unwrap().get(node).cloned()
    }

    fn any_conn(&self) -> Option<Arc<Conn>> {
        let conns = self.conns.lock().unwrap();
        conns
            .values()
            .find(|conn| conn.is_connected())
            .cloned()
            .or_else(|| conns.values().next().cloned())
    }

    pub async fn query(&self, slot: u16, cmd: Command) -> ResultT<Reply> {
        match self.get_conn(slot) {
            Some(conn) => conn.query(cmd).await,
            None => Err(Error::NoConnection(slot)),
        }
    }

    pub fn run(&self, slot: u16, cmd: Command) {
        match self.get_conn(slot) {
            Some(conn) => conn.run(cmd),
            None => error!("redis cluster no valid connection to slot {}", slot),
        }
    }

    /// Swap in a new slot table: close connections to nodes that left,
    /// dial nodes that joined, and wait for every dial.
    pub async fn update_shards(&self, shards: Shards) -> ResultT<()> {
        let news: BTreeSet<Node> = shards.values().map(|s| s.master.clone()).collect();
        let (removed, added) = {
            let conns = self.conns.lock().unwrap();
            let olds: BTreeSet<Node> = conns.keys().cloned().collect();
            let removed: Vec<Node> = olds.difference(&news).cloned().collect();
            let added: Vec<Node> = news.difference(&olds).cloned().collect();
            (removed, added)
        };
        *self.shards.lock().unwrap() = shards;

        for node in removed {
            let conn = self.conns.lock().unwrap().remove(&node);
            if let Some(conn) = conn {
                info!("closing connection to removed cluster node [{}]", node);
                conn.close().await;
            }
        }

        let auth = self.auth.lock().unwrap().clone();
        let mut dials = Vec::with_capacity(added.len());
        for node in added {
            let conn = Arc::new(Conn::for_cluster(self.weak.clone()));
            self.conns
                .lock()
                .unwrap()
                .insert(node.clone(), Arc::clone(&conn));
            info!("dialing added cluster node [{}]", node);
            let pass = auth.pass.clone();
            let timeout_ms = auth.timeout_ms;
            dials.push(tokio::spawn(async move {
                conn.connect(&node.host, node.port, &pass, 0, timeout_ms)
                    .await
                    .map_err(|err| {
                        Error::Topology(format!("connect to cluster node {} error:{}", node, err))
                    })
            }));
        }
        for dial in dials {
            match dial.await {
                Ok(result) => result?,
                Err(err) => {
                    return Err(Error::Topology(format!("cluster dial task failed:{}", err)))
                }
            }
        }
        Ok(())
    }

    /// `CLUSTER SLOTS` against a live node, then swap the topology in.
    pub async fn refresh(&self) -> ResultT<()> {
        let conn = self
            .any_conn()
            .ok_or_else(|| Error::Topology("no live cluster connection".into()))?;
        let rpl = conn.query(Command::single().cluster_slots()).await?;
        if rpl.is_error() {
            return Err(Error::Topology(format!("CLUSTER SLOTS failed: {}", rpl)));
        }
        let shards = parse_slots(rpl)?;
        self.update_shards(shards).await
    }

    /// Re-dispatch a completed entry that carries MOVED/ASK replies. The
    /// target connection must already exist; otherwise the redirect reply
    /// itself goes back to the caller. A MOVED reply additionally schedules
    /// a topology refresh.
    pub(crate) fn redirect(&self, mut entry: PendingEntry) {
        let node = match entry.first_redirect().and_then(parse_redirect) {
            Some(node) => node,
            None => {
                warn!("unparseable redirection reply");
                entry.complete();
                return;
            }
        };
        match self.node_conn(&node) {
            None => {
                warn!("no connection to redirect target [{}]", node);
                entry.complete();
            }
            Some(conn) => {
                let moved = entry.has_moved();
                entry.redirects += 1;
                let bytes = entry.resend_bytes();
                debug!(
                    "redirect #{} to [{}], {} bytes",
                    entry.redirects,
                    node,
                    bytes.len()
                );
                conn.requeue(entry, bytes);
                if moved {
                    if let Some(router) = self.weak.upgrade() {
                        tokio::spawn(async move {
                            if let Err(err) = router.refresh().await {
                                error!("cluster topology refresh failed: {}", err);
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Cluster-mode facade: computes the slot of each submission and routes it
/// through the per-node connection table.
pub struct ClusterClient {
    conns: Arc<ClusterConns>,
}

impl Default for ClusterClient {
    fn default() -> Self {
        ClusterClient::new()
    }
}

impl ClusterClient {
    pub fn new() -> ClusterClient {
        ClusterClient {
            conns: ClusterConns::new(),
        }
    }

    /// Dial the seed node, then bootstrap the topology from it.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pass: &str,
        timeout_ms: u64,
    ) -> ResultT<()> {
        self.conns.connect(host, port, pass, timeout_ms).await?;
        self.update().await
    }

    pub async fn connect_conf(&self, conf: &RedisConf, timeout_ms: u64) -> ResultT<()> {
        self.connect(&conf.addr, conf.port, &conf.auth, timeout_ms).await
    }

    /// Refresh the slot table.
    pub async fn update(&self) -> ResultT<()> {
        self.conns.refresh().await
    }

    pub async fn query(&self, cmd: Command) -> ResultT<Reply> {
        let cmd = cmd.build();
        let slot = check_command_slot(&cmd)?;
        self.conns.query(slot, cmd).await
    }

    pub fn run(&self, cmd: Command) {
        let cmd = cmd.build();
        match check_command_slot(&cmd) {
            Ok(slot) => self.conns.run(slot, cmd),
            Err(err) => error!("redis cluster run dropped: {}", err),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conns
            .conns
            .lock()
            .unwrap()
            .values()
            .any(|conn| conn.is_connected())
    }

    pub async fn close(&self) {
        self.conns.close().await
    }
}
