//! The framed request/reply protocol.
//!
//! A request is two frames: a 4-byte big-endian header tag, then an opaque
//! body. A response is two frames: a 1-byte status (0 = ok, 1 = error) and a
//! body holding either the encoded response or an encoded error code.
//!
//! | Tag | Name           | Request body              | Response body |
//! |-----|----------------|---------------------------|---------------|
//! | 0   | LIST_CONFLICTS | empty                     | conflict list |
//! | 1   | CHANGE         | entity, source, fid       | empty         |
//! | 2   | RESOLVE        | diff id, op id list       | empty         |
//! | 255 | reserved       | invalid                   | invalid       |

pub mod codec;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::conflict::ConflictRecord;
use crate::diff::{Diff, DiffOp};
use crate::document::Document;
use crate::ident::{ChangeNotification, DiffId, DiffOpId, EntityName, SourceName};

use codec::{read_frame, write_frame, BodyReader, BodyWriter};

pub const TAG_LIST_CONFLICTS: u32 = 0;
pub const TAG_CHANGE: u32 = 1;
pub const TAG_RESOLVE: u32 = 2;
pub const TAG_INVALID: u32 = 255;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Error codes carried in an error reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("timeout")]
    Timeout,
    #[error("bad framing")]
    BadFraming,
    #[error("decode failure")]
    Decode,
    #[error("unknown error")]
    Unknown,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::BadFraming => 1,
            ErrorCode::Decode => 2,
            ErrorCode::Unknown => 255,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::BadFraming,
            2 => ErrorCode::Decode,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Protocol-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad framing: {0}")]
    BadFraming(String),

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("unknown request tag {0}")]
    UnknownTag(u32),

    #[error("request timed out")]
    Timeout,

    #[error("peer replied with error: {0}")]
    ErrorReply(ErrorCode),

    #[error("connection closed mid-message")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The wire code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Timeout => ErrorCode::Timeout,
            ProtocolError::BadFraming(_) | ProtocolError::ConnectionClosed => {
                ErrorCode::BadFraming
            }
            ProtocolError::Decode(_) | ProtocolError::UnknownTag(_) => ErrorCode::Decode,
            _ => ErrorCode::Unknown,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ListConflicts,
    Change(ChangeNotification),
    Resolve {
        diff_id: DiffId,
        op_ids: Vec<DiffOpId>,
    },
}

impl Request {
    pub fn tag(&self) -> u32 {
        match self {
            Request::ListConflicts => TAG_LIST_CONFLICTS,
            Request::Change(_) => TAG_CHANGE,
            Request::Resolve { .. } => TAG_RESOLVE,
        }
    }
}

/// One entry of a LIST_CONFLICTS reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub initial: Document,
    pub diff: Diff<()>,
    pub diff_id: DiffId,
    pub ops: Vec<(DiffOpId, DiffOp)>,
}

impl From<ConflictRecord> for ConflictEntry {
    fn from(record: ConflictRecord) -> Self {
        Self {
            initial: record.initial,
            diff: record.diff,
            diff_id: record.diff_id,
            ops: record.ops,
        }
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Conflicts(Vec<ConflictEntry>),
}

/// Encode a request as (tag frame payload, body frame payload).
pub fn encode_request(req: &Request) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
    let tag = req.tag().to_be_bytes().to_vec();
    let mut body = BodyWriter::new();
    match req {
        Request::ListConflicts => {}
        Request::Change(notification) => {
            body.put_str(notification.entity.as_str());
            body.put_str(notification.source.as_str());
            body.put_str(&notification.fid);
        }
        Request::Resolve { diff_id, op_ids } => {
            body.put_u64(diff_id.0 as u64);
            body.put_u32(op_ids.len() as u32);
            for op_id in op_ids {
                body.put_u64(op_id.0 as u64);
            }
        }
    }
    Ok((tag, body.finish()))
}

/// Decode a request from its tag frame and body frame.
pub fn decode_request(tag_frame: &[u8], body: &[u8]) -> Result<Request, ProtocolError> {
    if tag_frame.len() != 4 {
        return Err(ProtocolError::BadFraming(format!(
            "header frame is {} bytes, expected 4",
            tag_frame.len()
        )));
    }
    let tag = u32::from_be_bytes(tag_frame.try_into().expect("4-byte slice"));
    let mut r = BodyReader::new(body);
    let req = match tag {
        TAG_LIST_CONFLICTS => Request::ListConflicts,
        TAG_CHANGE => {
            let entity: EntityName = r
                .get_str()?
                .parse()
                .map_err(|e| ProtocolError::Decode(format!("entity: {e}")))?;
            let source: SourceName = r
                .get_str()?
                .parse()
                .map_err(|e| ProtocolError::Decode(format!("source: {e}")))?;
            let fid = r.get_str()?.to_string();
            Request::Change(ChangeNotification::new(entity, source, fid))
        }
        TAG_RESOLVE => {
            let diff_id = DiffId(r.get_u64()? as i64);
            let count = r.get_u32()? as usize;
            let mut op_ids = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                op_ids.push(DiffOpId(r.get_u64()? as i64));
            }
            Request::Resolve { diff_id, op_ids }
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };
    r.expect_end()?;
    Ok(req)
}

/// Encode a successful response as (status frame, body frame).
pub fn encode_response(resp: &Response) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
    let mut body = BodyWriter::new();
    match resp {
        Response::Ack => {}
        Response::Conflicts(entries) => {
            body.put_u32(entries.len() as u32);
            for entry in entries {
                body.put_json(&entry.initial)?;
                body.put_json(&entry.diff)?;
                body.put_u64(entry.diff_id.0 as u64);
                body.put_u32(entry.ops.len() as u32);
                for (op_id, op) in &entry.ops {
                    body.put_u64(op_id.0 as u64);
                    body.put_json(op)?;
                }
            }
        }
    }
    Ok((vec![STATUS_OK], body.finish()))
}

/// Encode an error reply.
pub fn encode_error(code: ErrorCode) -> (Vec<u8>, Vec<u8>) {
    (vec![STATUS_ERROR], vec![code.as_u8()])
}

/// Decode a response to a request with the given tag.
pub fn decode_response(
    request_tag: u32,
    status_frame: &[u8],
    body: &[u8],
) -> Result<Response, ProtocolError> {
    if status_frame.len() != 1 {
        return Err(ProtocolError::BadFraming(format!(
            "status frame is {} bytes, expected 1",
            status_frame.len()
        )));
    }
    match status_frame[0] {
        STATUS_OK => {}
        STATUS_ERROR => {
            let mut r = BodyReader::new(body);
            let code = ErrorCode::from_u8(r.get_u8()?);
            r.expect_end()?;
            return Err(ProtocolError::ErrorReply(code));
        }
        other => {
            return Err(ProtocolError::BadFraming(format!(
                "unknown response status {other}"
            )))
        }
    }

    let mut r = BodyReader::new(body);
    let resp = match request_tag {
        TAG_LIST_CONFLICTS => {
            let count = r.get_u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let initial: Document = r.get_json()?;
                let diff: Diff<()> = r.get_json()?;
                let diff_id = DiffId(r.get_u64()? as i64);
                let op_count = r.get_u32()? as usize;
                let mut ops = Vec::with_capacity(op_count.min(1024));
                for _ in 0..op_count {
                    let op_id = DiffOpId(r.get_u64()? as i64);
                    let op: DiffOp = r.get_json()?;
                    ops.push((op_id, op));
                }
                entries.push(ConflictEntry {
                    initial,
                    diff,
                    diff_id,
                    ops,
                });
            }
            Response::Conflicts(entries)
        }
        TAG_CHANGE | TAG_RESOLVE => Response::Ack,
        other => return Err(ProtocolError::UnknownTag(other)),
    };
    r.expect_end()?;
    Ok(resp)
}

/// Send a request over a stream and wait for the reply.
///
/// Used by the client binary and by tests; the daemon side reads frames
/// directly in its request loop.
pub async fn call<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    req: &Request,
) -> Result<Response, ProtocolError> {
    let (tag, body) = encode_request(req)?;
    write_frame(stream, &tag).await?;
    write_frame(stream, &body).await?;

    let status = read_frame(stream)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)?;
    let reply_body = read_frame(stream)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)?;
    decode_response(req.tag(), &status, &reply_body)
}
