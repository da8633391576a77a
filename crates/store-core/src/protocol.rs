//! Wire protocol shared by the server and its clients
//!
//! Every connection carries length-delimited frames (4-byte big-endian length
//! prefix) whose payload is a `bincode`-encoded message. The first frame a
//! client sends is [`ClientMessage::Hello`], which fixes the role of the
//! connection: either synchronous requests or watch traffic.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Error, Result, WireError};
use crate::types::{ConnectionId, Value};

/// Bumped whenever a message layout changes
pub const PROTOCOL_VERSION: u32 = 1;

/// What a connection is used for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Request/response traffic
    Requests,

    /// Watch registrations and change notifications
    Watches,
}

/// Store operation sent on a request connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    Set {
        key: String,
        value: Value,
    },
    CompareSet {
        key: String,
        expected: Value,
        desired: Value,
    },
    Get {
        key: String,
        timeout_ms: u64,
    },
    Add {
        key: String,
        delta: i64,
    },
    Delete {
        key: String,
    },
    Check {
        keys: Vec<String>,
    },
    NumKeys,
    Wait {
        keys: Vec<String>,
        timeout_ms: u64,
    },
    WaitForWorkers {
        expected: u64,
        timeout_ms: u64,
    },
}

impl Request {
    /// Operation name used in logs and timeout errors
    pub fn name(&self) -> &'static str {
        match self {
            Request::Set { .. } => "set",
            Request::CompareSet { .. } => "compare_set",
            Request::Get { .. } => "get",
            Request::Add { .. } => "add",
            Request::Delete { .. } => "delete_key",
            Request::Check { .. } => "check",
            Request::NumKeys => "num_keys",
            Request::Wait { .. } => "wait",
            Request::WaitForWorkers { .. } => "wait_for_workers",
        }
    }

    /// Server-enforced timeout for requests that may park; `None` otherwise.
    ///
    /// `Some(Duration::ZERO)` means the request may park forever.
    pub fn server_timeout(&self) -> Option<Duration> {
        match self {
            Request::Get { timeout_ms, .. }
            | Request::Wait { timeout_ms, .. }
            | Request::WaitForWorkers { timeout_ms, .. } => {
                Some(Duration::from_millis(*timeout_ms))
            }
            _ => None,
        }
    }
}

/// Result of a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    Done,
    Value(Value),
    Integer(i64),
    Bool(bool),
    Error(WireError),
}

/// Request tagged with the sequence number its reply will carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub request: Request,
}

/// Reply tagged with the sequence number of its request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub reply: Reply,
}

/// Change to a watched key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello { role: ConnectionRole, version: u32 },
    Request(RequestFrame),
    Watch { seq: u64, key: String },
}

/// Server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    HelloAck { connection_id: ConnectionId },
    Rejected { reason: String },
    Response(ResponseFrame),
    WatchAck { seq: u64 },
    Notification(WatchEvent),
}

/// Length-delimited bincode codec, encoding `Out` and decoding `In`
pub struct FrameCodec<Out, In> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Codec used by clients
pub type ClientCodec = FrameCodec<ClientMessage, ServerMessage>;

/// Codec used by the server
pub type ServerCodec = FrameCodec<ServerMessage, ClientMessage>;

impl<Out, In> FrameCodec<Out, In> {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for FrameCodec<Out, In> {
    type Error = Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let payload = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl<Out, In: DeserializeOwned> Decoder for FrameCodec<Out, In> {
    type Item = In;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        match self.inner.decode(src)? {
            Some(frame) => bincode::deserialize(&frame)
                .map(Some)
                .map_err(|e| Error::protocol(format!("malformed frame: {e}"))),
            None => Ok(None),
        }
    }
}
