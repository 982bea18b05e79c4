//! Wire protocol message types.
//!
//! Commands are positional JSON arrays such as `["GetP", 1, 0, "name"]`, and
//! every command is answered by `["success", value]` or
//! `["error", {"error": kind, "message": text}]`.
//!
//! Stream transports wrap both in a [`WireMessage`] envelope carrying a
//! correlation id, prefixed with a 4-byte big-endian length header.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};
use tether_types::{Handle, RpcError, SpawnId, TetherError};

/// A command one peer sends to the other.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a root object of a registered type.
    New { mimetype: String, args: Json },
    /// Destroy a spawn and everything in it.
    Destroy { spawn_id: SpawnId },
    /// List property names.
    Enum { handle: Handle },
    /// Forget an object after a short delay.
    RelObj { handle: Handle },
    DelP { handle: Handle, name: String },
    GetP { handle: Handle, name: String },
    SetP {
        handle: Handle,
        name: String,
        value: Json,
    },
    /// Call a property, or the object itself when `name` is empty.
    Invoke {
        handle: Handle,
        name: String,
        args: Vec<Json>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::New { .. } => "New",
            Command::Destroy { .. } => "Destroy",
            Command::Enum { .. } => "Enum",
            Command::RelObj { .. } => "RelObj",
            Command::DelP { .. } => "DelP",
            Command::GetP { .. } => "GetP",
            Command::SetP { .. } => "SetP",
            Command::Invoke { .. } => "Invoke",
        }
    }

    /// The object this command targets, if any.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Command::New { .. } | Command::Destroy { .. } => None,
            Command::Enum { handle }
            | Command::RelObj { handle }
            | Command::DelP { handle, .. }
            | Command::GetP { handle, .. }
            | Command::SetP { handle, .. }
            | Command::Invoke { handle, .. } => Some(*handle),
        }
    }

    pub fn to_json(&self) -> Json {
        let name = self.name();
        match self {
            Command::New { mimetype, args } => json!([name, mimetype, args]),
            Command::Destroy { spawn_id } => json!([name, spawn_id]),
            Command::Enum { handle } | Command::RelObj { handle } => {
                json!([name, handle.spawn_id, handle.object_id])
            }
            Command::DelP { handle, name: prop } | Command::GetP { handle, name: prop } => {
                json!([name, handle.spawn_id, handle.object_id, prop])
            }
            Command::SetP {
                handle,
                name: prop,
                value,
            } => json!([name, handle.spawn_id, handle.object_id, prop, value]),
            Command::Invoke {
                handle,
                name: prop,
                args,
            } => json!([name, handle.spawn_id, handle.object_id, prop, args]),
        }
    }

    /// Validate the shape of a raw command.
    ///
    /// Any deviation (unknown name, wrong arity, non-integer id, non-string
    /// property name, non-array argument list) is a `malformed message`.
    pub fn parse(raw: &Json) -> Result<Self, RpcError> {
        let parts = raw.as_array().ok_or_else(RpcError::malformed)?;
        let (kind, rest) = parts.split_first().ok_or_else(RpcError::malformed)?;
        let kind = kind.as_str().ok_or_else(RpcError::malformed)?;

        let id = |idx: usize| rest.get(idx).and_then(Json::as_u64);
        let text = |idx: usize| rest.get(idx).and_then(Json::as_str).map(str::to_string);
        let handle = || Some(Handle::new(id(0)?, id(1)?));
        let arity = |n: usize| rest.len() == n;

        let command = match kind {
            "New" if arity(2) => text(0)
                .filter(|m| !m.is_empty())
                .map(|mimetype| Command::New {
                    mimetype,
                    args: rest[1].clone(),
                }),
            "Destroy" if arity(1) => id(0).map(|spawn_id| Command::Destroy { spawn_id }),
            "Enum" if arity(2) => handle().map(|handle| Command::Enum { handle }),
            "RelObj" if arity(2) => handle().map(|handle| Command::RelObj { handle }),
            "DelP" if arity(3) => handle()
                .zip(text(2))
                .map(|(handle, name)| Command::DelP { handle, name }),
            "GetP" if arity(3) => handle()
                .zip(text(2))
                .map(|(handle, name)| Command::GetP { handle, name }),
            "SetP" if arity(4) => handle().zip(text(2)).map(|(handle, name)| Command::SetP {
                handle,
                name,
                value: rest[3].clone(),
            }),
            "Invoke" if arity(4) => handle()
                .zip(text(2))
                .zip(rest[3].as_array().cloned())
                .map(|((handle, name), args)| Command::Invoke { handle, name, args }),
            _ => None,
        };
        command.ok_or_else(RpcError::malformed)
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        Command::parse(&raw).map_err(D::Error::custom)
    }
}

/// The answer to one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Json),
    Error(RpcError),
}

impl Response {
    pub fn to_json(&self) -> Json {
        match self {
            Response::Success(value) => json!(["success", value]),
            Response::Error(err) => json!(["error", err]),
        }
    }

    pub fn parse(raw: &Json) -> Result<Self, TetherError> {
        let invalid = || TetherError::InvalidResponse(raw.to_string());
        match raw.as_array().map(Vec::as_slice) {
            Some([status, value]) if status == "success" => Ok(Response::Success(value.clone())),
            Some([status, err]) if status == "error" => serde_json::from_value(err.clone())
                .map(Response::Error)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    pub fn into_result(self) -> Result<Json, TetherError> {
        match self {
            Response::Success(value) => Ok(value),
            Response::Error(err) => Err(TetherError::Rpc(err)),
        }
    }
}

impl From<Result<Json, RpcError>> for Response {
    fn from(result: Result<Json, RpcError>) -> Self {
        match result {
            Ok(value) => Response::Success(value),
            Err(err) => Response::Error(err),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        Response::parse(&raw).map_err(D::Error::custom)
    }
}

/// A framed message on a stream transport (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlation ID; a response carries the ID of its request.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of framed messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// A command. Kept raw so shape validation happens at dispatch.
    #[serde(rename = "request")]
    Request { command: Json },
    /// The answer to a request.
    #[serde(rename = "response")]
    Response { result: Response },
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::ErrorKind;

    #[test]
    fn test_command_positional_layout() {
        let cmd = Command::Invoke {
            handle: Handle::new(1, 0),
            name: "fn".to_string(),
            args: vec![json!(6), json!(7)],
        };
        assert_eq!(cmd.to_json(), json!(["Invoke", 1, 0, "fn", [6, 7]]));
        assert_eq!(Command::parse(&cmd.to_json()).unwrap(), cmd);
    }

    #[test]
    fn test_parse_every_command() {
        let cases = [
            json!(["New", "app/x", {}]),
            json!(["Destroy", 1]),
            json!(["Enum", 1, 0]),
            json!(["RelObj", 0, 4]),
            json!(["DelP", 1, 2, "a"]),
            json!(["GetP", 1, 2, "a"]),
            json!(["SetP", 1, 2, "a", {"$type": "ref", "data": [0, 1]}]),
            json!(["Invoke", 1, 2, "", []]),
        ];
        for raw in cases {
            let cmd = Command::parse(&raw).unwrap_or_else(|e| panic!("{raw}: {e}"));
            assert_eq!(cmd.to_json(), raw);
        }
    }

    #[test]
    fn test_malformed_commands() {
        let cases = [
            json!("Enum"),
            json!([]),
            json!(["Bogus", 1, 0]),
            json!(["New", "", {}]),
            json!(["New", 5, {}]),
            json!(["New", "app/x"]),
            json!(["Destroy", "1"]),
            json!(["Enum", 1]),
            json!(["Enum", -1, 0]),
            json!(["Enum", 1.5, 0]),
            json!(["GetP", 1, 0, 7]),
            json!(["SetP", 1, 0, "a"]),
            json!(["Invoke", 1, 0, "fn", "notarray"]),
            json!(["Invoke", 1, 0, "fn", [], "extra"]),
        ];
        for raw in cases {
            let err = Command::parse(&raw).unwrap_err();
            assert_eq!(err.kind, ErrorKind::MalformedMessage, "{raw}");
        }
    }

    #[test]
    fn test_response_envelopes() {
        let ok = Response::Success(json!(42));
        assert_eq!(ok.to_json(), json!(["success", 42]));
        let err = Response::Error(RpcError::invalid_object());
        assert_eq!(
            err.to_json(),
            json!(["error", {"error": "invalid object", "message": "The object does not exist"}])
        );
        assert_eq!(Response::parse(&err.to_json()).unwrap(), err);
        assert!(Response::parse(&json!(["maybe", 1])).is_err());
        assert!(matches!(
            err.into_result(),
            Err(TetherError::Rpc(RpcError { kind: ErrorKind::InvalidObject, .. }))
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = WireMessage {
            id: "msg-1".to_string(),
            kind: WireMessageKind::Request {
                command: Command::Enum {
                    handle: Handle::new(1, 0),
                }
                .to_json(),
            },
        };
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, "msg-1");
        match decoded.kind {
            WireMessageKind::Request { command } => assert_eq!(command, json!(["Enum", 1, 0])),
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_response_frame() {
        let msg = WireMessage {
            id: "r-1".to_string(),
            kind: WireMessageKind::Response {
                result: Response::Success(json!(["a", "fn"])),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"response\""));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            WireMessageKind::Response { result } => {
                assert_eq!(result, Response::Success(json!(["a", "fn"])))
            }
            other => panic!("Expected Response, got {other:?}"),
        }
    }
}
