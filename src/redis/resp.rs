//! Command replies.
//!
//! Replies are produced as values; framing them on the wire is the network
//! layer's job.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    #[inline]
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    #[inline]
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    #[inline]
    pub fn queued() -> Self {
        RespValue::SimpleString("QUEUED".to_string())
    }

    #[inline]
    pub fn nil() -> Self {
        RespValue::BulkString(None)
    }

    /// Null multi-bulk, the reply of an EXEC aborted by WATCH.
    #[inline]
    pub fn null_array() -> Self {
        RespValue::Array(None)
    }

    #[inline]
    pub fn empty_array() -> Self {
        RespValue::Array(Some(Vec::new()))
    }

    pub fn simple(s: &str) -> Self {
        RespValue::SimpleString(s.to_string())
    }

    pub fn err(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn bulk(data: &[u8]) -> Self {
        RespValue::BulkString(Some(data.to_vec()))
    }

    pub fn bulk_str(s: &str) -> Self {
        RespValue::BulkString(Some(s.as_bytes().to_vec()))
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    pub fn bulk_array<'a>(items: impl IntoIterator<Item = &'a Bytes>) -> Self {
        RespValue::Array(Some(items.into_iter().map(|b| RespValue::bulk(b)).collect()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}
