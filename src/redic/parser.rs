use bytes::{Buf, BytesMut};
use nom::{
    branch::alt,
    bytes::streaming::{take, take_until},
    character::streaming::{char, crlf, digit1},
    combinator::{map, opt},
    multi::count,
    sequence::{preceded, terminated, tuple},
    IResult,
};

use super::protocol::Reply;
use super::types::{Error, ResultT};

fn read_positive_decimal(bytes: &[u8]) -> IResult<&[u8], u64> {
    let (rem, int_bytes) = digit1(bytes)?;
    match std::str::from_utf8(int_bytes).ok().and_then(|s| s.parse().ok()) {
        Some(int) => Ok((rem, int)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            bytes,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn read_decimal(bytes: &[u8]) -> IResult<&[u8], i64> {
    let (rem, (minus, int)) = tuple((opt(char('-')), read_positive_decimal))(bytes)?;
    Ok((
        rem,
        if minus.is_some() {
            -(int as i64)
        } else {
            int as i64
        },
    ))
}

// a negative length carries no payload
fn read_bulk(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('$'), terminated(read_decimal, crlf))(bytes)?;
    if size < 0 {
        return Ok((rem, Reply::Null));
    }
    terminated(
        map(take(size as usize), |b: &[u8]| Reply::BulkString(b.into())),
        crlf,
    )(rem)
}

fn read_simple(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('+'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| Reply::SimpleString(s.into()))(bytes)
}

fn read_error(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('-'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| classify_error(s))(bytes)
}

// MOVED/ASK redirections are flagged here so downstream code never has to
// look at the text again; the full text is kept for the router to parse.
fn classify_error(bytes: &[u8]) -> Reply {
    let text = String::from_utf8_lossy(bytes).into_owned();
    if text.starts_with("MOVED ") {
        Reply::MovedError(text)
    } else if text.starts_with("ASK ") {
        Reply::AskError(text)
    } else {
        Reply::Error(text)
    }
}

fn read_integer(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char(':'), terminated(read_decimal, crlf));
    map(parser, Reply::Integer)(bytes)
}

fn read_array(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('*'), terminated(read_decimal, crlf))(bytes)?;
    if size < 0 {
        return Ok((rem, Reply::Null));
    }
    map(count(read, size as usize), Reply::Array)(rem)
}

/// Parse one complete reply. `Err(Incomplete)` means more bytes are needed;
/// any other error is wire corruption and fatal to the connection.
pub fn read(bytes: &[u8]) -> IResult<&[u8], Reply> {
    alt((
        read_integer,
        read_simple,
        read_bulk,
        read_error,
        read_array,
    ))(bytes)
}

/// Restartable decoder: accumulates socket reads and hands out complete
/// replies, keeping partial data buffered for the next feed.
pub struct ReplyDecoder {
    buf: BytesMut,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        ReplyDecoder::new()
    }
}

impl ReplyDecoder {
    pub fn new() -> ReplyDecoder {
        ReplyDecoder {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read target for `read_buf`.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard buffered bytes, e.g. after a protocol error or reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn next_reply(&mut self) -> ResultT<Option<Reply>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let size = self.buf.len();
        let (rem_size, reply) = match read(&self.buf) {
            Ok((rem, reply)) => (rem.len(), reply),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(err) => return Err(Error::Protocol(format!("fatal parsing error {}", err))),
        };
        self.buf.advance(size - rem_size);
        Ok(Some(reply))
    }
}
