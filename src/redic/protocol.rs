use std::fmt;

use async_recursion::async_recursion;
use tokio::io::AsyncWriteExt;

use super::types::ResultT;

pub(crate) const CRLF: [u8; 2] = [b'\r', b'\n'];
const NULL_MSG: &[u8] = b"$-1\r\n";

/// One server response. Errors carrying a `MOVED ` or `ASK ` prefix are
/// classified into their own variants so the cluster router can react
/// without re-inspecting the text; the full text (prefix included) is kept.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Reply {
    Null,
    Integer(i64),
    SimpleString(Vec<u8>),
    BulkString(Vec<u8>),
    Error(String),
    MovedError(String),
    AskError(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Reply::Integer(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Reply::Array(_))
    }

    /// True for all three error variants.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Reply::Error(_) | Reply::MovedError(_) | Reply::AskError(_)
        )
    }

    pub fn is_moved_error(&self) -> bool {
        matches!(self, Reply::MovedError(_))
    }

    pub fn is_ask_error(&self) -> bool {
        matches!(self, Reply::AskError(_))
    }

    pub fn is_redirect(&self) -> bool {
        self.is_moved_error() || self.is_ask_error()
    }

    /// True for everything that carries text, errors included.
    pub fn is_string(&self) -> bool {
        matches!(self, Reply::SimpleString(_) | Reply::BulkString(_)) || self.is_error()
    }

    pub fn ok(&self) -> bool {
        !self.is_error()
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::SimpleString(b) | Reply::BulkString(b) => Some(b),
            Reply::Error(s) | Reply::MovedError(s) | Reply::AskError(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::SimpleString(b) | Reply::BulkString(b) => std::str::from_utf8(b).ok(),
            Reply::Error(s) | Reply::MovedError(s) | Reply::AskError(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Reply::SimpleString(b) | Reply::BulkString(b) => Some(b),
            Reply::Error(s) | Reply::MovedError(s) | Reply::AskError(s) => Some(s.into_bytes()),
            _ => None,
        }
    }

    pub async fn write_end<W>(b: &mut W) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        b.write_all(&CRLF).await?;
        Ok(())
    }

    /// Encode in wire form. The inverse of the parser; mainly useful for
    /// fixtures that script server behaviour and for round-trip checks.
    #[async_recursion]
    pub async fn write_async<W>(self, writer: &mut W, flush: bool) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        match self {
            Reply::SimpleString(s) => {
                writer.write_u8(b'+').await?;
                writer.write_all(&s).await?;
                Reply::write_end(writer).await?;
            }
            Reply::Error(err) | Reply::MovedError(err) | Reply::AskError(err) => {
                writer.write_u8(b'-').await?;
                writer.write_all(err.as_bytes()).await?;
                Reply::write_end(writer).await?;
            }
            Reply::Integer(int) => {
                writer.write_u8(b':').await?;
                writer.write_all(int.to_string().as_bytes()).await?;
                Reply::write_end(writer).await?;
            }
            Reply::BulkString(s) => {
                writer.write_u8(b'$').await?;
                writer.write_all(s.len().to_string().as_bytes()).await?;
                Reply::write_end(writer).await?;
                writer.write_all(&s).await?;
                Reply::write_end(writer).await?;
            }
            Reply::Array(mut vec) => {
                writer.write_u8(b'*').await?;
                writer.write_all(vec.len().to_string().as_bytes()).await?;
                Reply::write_end(writer).await?;
                for el in vec.drain(0..) {
                    el.write_async(writer, false).await?;
                }
            }
            Reply::Null => writer.write_all(NULL_MSG).await?,
        };
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reply::Null => f.write_str("(nil)"),
            Reply::Integer(i) => write!(f, "{}", i),
            Reply::SimpleString(b) | Reply::BulkString(b) => {
                write!(f, "{}", String::from_utf8_lossy(b))
            }
            Reply::Error(s) | Reply::MovedError(s) | Reply::AskError(s) => f.write_str(s),
            Reply::Array(items) => {
                f.write_str("[")?;
                for item in items {
                    write!(f, "{},", item)?;
                }
                f.write_str("]")
            }
        }
    }
}
