use bytes::BytesMut;

use super::protocol::CRLF;

/// One serialized command inside a pipeline. `key` is what the cluster
/// router hashes (empty for keyless verbs); `ignore` drops the reply from
/// the assembled result and demotes error replies to log lines.
#[derive(Debug, Clone)]
pub struct CommandPart {
    pub(crate) bytes: Vec<u8>,
    pub(crate) key: Vec<u8>,
    pub(crate) ignore: bool,
}

pub(crate) fn asking_part() -> CommandPart {
    CommandPart {
        bytes: b"*1\r\n$6\r\nASKING\r\n".to_vec(),
        key: Vec::new(),
        ignore: true,
    }
}

/// Argument conversion for [`Command::arg`].
pub trait ToArg {
    fn to_arg(&self) -> Vec<u8>;
}

impl ToArg for &str {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Vec<u8> {
        self.clone()
    }
}

macro_rules! to_arg_via_string {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        })*
    };
}

to_arg_via_string!(i32, i64, u16, u32, u64, usize);

/// Open a single command.
pub fn cmd(verb: &str) -> Command {
    Command::single().cmd(verb)
}

/// Open a pipeline; every `cmd` call appends another command and the whole
/// group is submitted, and answered, as one unit.
pub fn pipeline() -> Command {
    Command {
        parts: Vec::new(),
        current: Vec::new(),
        current_key: Vec::new(),
        current_ignore: false,
        pipe: true,
    }
}

/// Fluent builder accumulating one or more RESP-encoded commands.
pub struct Command {
    parts: Vec<CommandPart>,
    current: Vec<Vec<u8>>,
    current_key: Vec<u8>,
    current_ignore: bool,
    pipe: bool,
}

impl Command {
    pub fn single() -> Command {
        Command {
            parts: Vec::new(),
            current: Vec::new(),
            current_key: Vec::new(),
            current_ignore: false,
            pipe: false,
        }
    }

    /// Open a new command. Outside pipeline mode a second call is a
    /// programmer error and panics.
    pub fn cmd(mut self, verb: &str) -> Command {
        assert!(
            self.pipe || (self.parts.is_empty() && self.current.is_empty()),
            "multiple commands require pipeline mode"
        );
        self.finish_current();
        self.current.push(verb.as_bytes().to_vec());
        self
    }

    /// Append an argument.
    pub fn arg<A: ToArg>(mut self, arg: A) -> Command {
        self.current.push(arg.to_arg());
        self
    }

    /// Append every element as an argument.
    pub fn args<A: ToArg>(mut self, args: &[A]) -> Command {
        for arg in args {
            self.current.push(arg.to_arg());
        }
        self
    }

    /// Append an argument and record it as the slot-computing key of the
    /// current command.
    pub fn key<A: ToArg>(mut self, key: A) -> Command {
        self.current_key = key.to_arg();
        self.current.push(self.current_key.clone());
        self
    }

    /// Record the slot-computing key without appending an argument. Used by
    /// multi-key verbs where the first key stands for the group.
    pub fn set_key<A: ToArg>(mut self, key: A) -> Command {
        self.current_key = key.to_arg();
        self
    }

    /// Suppress the current command's reply; error replies are logged
    /// instead of surfaced.
    pub fn ignore(mut self) -> Command {
        self.current_ignore = true;
        self
    }

    /// Finalize the command under construction.
    pub fn build(mut self) -> Command {
        self.finish_current();
        self
    }

    fn finish_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let mut bytes = Vec::new();
        bytes.push(b'*');
        bytes.extend_from_slice(self.current.len().to_string().as_bytes());
        bytes.extend_from_slice(&CRLF);
        for arg in self.current.drain(0..) {
            bytes.push(b'$');
            bytes.extend_from_slice(arg.len().to_string().as_bytes());
            bytes.extend_from_slice(&CRLF);
            bytes.extend_from_slice(&arg);
            bytes.extend_from_slice(&CRLF);
        }
        self.parts.push(CommandPart {
            bytes,
            key: std::mem::take(&mut self.current_key),
            ignore: std::mem::take(&mut self.current_ignore),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.current.is_empty()
    }

    pub fn is_pipeline(&self) -> bool {
        self.pipe
    }

    /// Concatenated wire form of every built part.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in &self.parts {
            buf.extend_from_slice(&part.bytes);
        }
        buf
    }

    pub fn serialize_to(&self, buf: &mut BytesMut) {
        for part in &self.parts {
            buf.extend_from_slice(&part.bytes);
        }
    }

    pub(crate) fn parts(&self) -> &[CommandPart] {
        &self.parts
    }

    pub(crate) fn into_parts(mut self) -> Vec<CommandPart> {
        self.finish_current();
        self.parts
    }
}

/// Typed verbs. The full Redis catalogue is intentionally not reproduced;
/// this is the handshake, the subscriber surface, topology discovery, and a
/// few common verbs.
impl Command {
    pub fn auth(self, password: &str) -> Command {
        self.cmd("AUTH").arg(password)
    }

    pub fn select(self, index: i64) -> Command {
        self.cmd("SELECT").arg(index)
    }

    pub fn ping(self) -> Command {
        self.cmd("PING")
    }

    pub fn echo(self, msg: &str) -> Command {
        self.cmd("ECHO").arg(msg)
    }

    pub fn get(self, key: &str) -> Command {
        self.cmd("GET").key(key)
    }

    pub fn set(self, key: &str, value: impl ToArg) -> Command {
        self.cmd("SET").key(key).arg(value)
    }

    pub fn del(self, keys: &[&str]) -> Command {
        assert!(!keys.is_empty(), "redis DEL needs at least one key");
        self.cmd("DEL").set_key(keys[0]).args(keys)
    }

    pub fn exists(self, keys: &[&str]) -> Command {
        assert!(!keys.is_empty(), "redis EXISTS needs at least one key");
        self.cmd("EXISTS").set_key(keys[0]).args(keys)
    }

    pub fn incr(self, key: &str) -> Command {
        self.cmd("INCR").key(key)
    }

    pub fn expire(self, key: &str, seconds: i64) -> Command {
        self.cmd("EXPIRE").key(key).arg(seconds)
    }

    pub fn subscribe(self, channels: &[&str]) -> Command {
        self.cmd("SUBSCRIBE").args(channels)
    }

    pub fn unsubscribe(self, channels: &[&str]) -> Command {
        self.cmd("UNSUBSCRIBE").args(channels)
    }

    pub fn psubscribe(self, patterns: &[&str]) -> Command {
        self.cmd("PSUBSCRIBE").args(patterns)
    }

    pub fn punsubscribe(self, patterns: &[&str]) -> Command {
        self.cmd("PUNSUBSCRIBE").args(patterns)
    }

    pub fn cluster_slots(self) -> Command {
        self.cmd("CLUSTER").arg("SLOTS")
    }
}
