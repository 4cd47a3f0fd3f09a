//! Worker line protocol
//!
//! The host talks to each worker process over its stdin/stdout using one
//! JSON array per line.
//!
//! Outbound (host → worker):
//!
//! ```text
//! [call-id, method, [args...], {kwargs...}]
//! ```
//!
//! Inbound (worker → host):
//!
//! ```text
//! [call-id, "result", value]
//! [call-id, "error", message]
//! [call-id, "movecb", value]
//! [call-id, "tempcb", value]
//! [null, "broadcast", target, name, args...]
//! [null, "disconnect"]
//! ```

use serde_json::{Map, Value};

use crate::error::ParseError;

/// Identifier correlating a call with its reply
pub type CallId = u64;

/// An outbound call record
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Call identifier
    pub id: CallId,
    /// Method name
    pub method: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

impl Request {
    /// Create a new request
    pub fn new(id: CallId, method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id,
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Encode as a single newline-terminated line
    pub fn encode(&self) -> Vec<u8> {
        let record = (self.id, &self.method, &self.args, &self.kwargs);
        // A tuple of plain JSON values cannot fail to serialize
        let mut line = serde_json::to_vec(&record).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

/// An inbound record from a worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Successful reply to a call
    Result { id: CallId, value: Value },
    /// Failed reply; `id` is `None` for errors not tied to a call
    Error { id: Option<CallId>, message: Value },
    /// Motion-completion callback
    MoveCb { id: CallId, value: Value },
    /// Temperature-completion callback
    TempCb { id: CallId, value: Value },
    /// Event to fan out to observers; `target` is a connection id or `None`
    /// for everyone
    Broadcast {
        target: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    /// The worker released its serial port
    Disconnect,
}

impl WorkerMessage {
    /// Decode one line (without its newline)
    pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(line)
            .map_err(|e| ParseError::MalformedRecord(e.to_string()))?;
        let Value::Array(mut fields) = value else {
            return Err(ParseError::MalformedRecord("record is not an array".into()));
        };
        if fields.len() < 2 {
            return Err(ParseError::MalformedRecord(format!(
                "record has {} fields",
                fields.len()
            )));
        }

        let rest = fields.split_off(2);
        let tag = match &fields[1] {
            Value::String(s) => s.clone(),
            other => return Err(ParseError::UnknownTag(other.to_string())),
        };
        let id = match &fields[0] {
            Value::Null => None,
            Value::Number(n) => Some(n.as_u64().ok_or_else(|| {
                ParseError::MalformedRecord(format!("invalid call id {n}"))
            })?),
            other => {
                return Err(ParseError::MalformedRecord(format!(
                    "invalid call id {other}"
                )))
            }
        };
        let mut rest = rest.into_iter();

        match tag.as_str() {
            "result" | "return" => Ok(Self::Result {
                id: id.ok_or(ParseError::MissingField {
                    tag: "result",
                    field: "id",
                })?,
                value: rest.next().unwrap_or(Value::Null),
            }),
            "error" => Ok(Self::Error {
                id,
                message: rest.next().unwrap_or(Value::Null),
            }),
            "movecb" => Ok(Self::MoveCb {
                id: id.ok_or(ParseError::MissingField {
                    tag: "movecb",
                    field: "id",
                })?,
                value: rest.next().unwrap_or(Value::Null),
            }),
            "tempcb" => Ok(Self::TempCb {
                id: id.ok_or(ParseError::MissingField {
                    tag: "tempcb",
                    field: "id",
                })?,
                value: rest.next().unwrap_or(Value::Null),
            }),
            "broadcast" => {
                let target = match rest.next() {
                    Some(Value::Null) => None,
                    Some(Value::Number(n)) if n.is_u64() => n.as_u64(),
                    Some(other) => {
                        return Err(ParseError::MalformedRecord(format!(
                            "invalid broadcast target {other}"
                        )))
                    }
                    None => {
                        return Err(ParseError::MissingField {
                            tag: "broadcast",
                            field: "target",
                        })
                    }
                };
                let name = match rest.next() {
                    Some(Value::String(s)) => s,
                    _ => {
                        return Err(ParseError::MissingField {
                            tag: "broadcast",
                            field: "name",
                        })
                    }
                };
                Ok(Self::Broadcast {
                    target,
                    name,
                    args: rest.collect(),
                })
            }
            "disconnect" => Ok(Self::Disconnect),
            _ => Err(ParseError::UnknownTag(tag)),
        }
    }

    /// Encode as a newline-terminated line (used by simulated workers)
    pub fn encode(&self) -> Vec<u8> {
        let record: Vec<Value> = match self {
            Self::Result { id, value } => vec![(*id).into(), "result".into(), value.clone()],
            Self::Error { id, message } => vec![
                id.map_or(Value::Null, Value::from),
                "error".into(),
                message.clone(),
            ],
            Self::MoveCb { id, value } => vec![(*id).into(), "movecb".into(), value.clone()],
            Self::TempCb { id, value } => vec![(*id).into(), "tempcb".into(), value.clone()],
            Self::Broadcast { target, name, args } => {
                let mut record = vec![
                    Value::Null,
                    "broadcast".into(),
                    target.map_or(Value::Null, Value::from),
                    name.clone().into(),
                ];
                record.extend(args.iter().cloned());
                record
            }
            Self::Disconnect => vec![Value::Null, "disconnect".into()],
        };
        let mut line = Value::Array(record).to_string().into_bytes();
        line.push(b'\n');
        line
    }
}

/// Splits a byte stream into newline-terminated lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    /// Bytes of an unfinished line still buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
