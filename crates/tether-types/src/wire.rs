//! Tagged wire values.
//!
//! Primitives travel as plain JSON. Everything else is wrapped in an object
//! of the form `{"$type": <tag>, "data": <payload>}`.

use crate::handle::Handle;
use serde_json::{json, Value as Json};

/// Key carrying the tag of a wrapped value.
pub const TYPE_KEY: &str = "$type";

/// Key carrying the payload of a wrapped value.
pub const DATA_KEY: &str = "data";

/// The tags a wrapped wire value can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireTag {
    /// Payload is passed by value, recursively.
    Json,
    /// Payload is a base64 byte buffer.
    Binary,
    /// Handle into the sender's store; the receiver wraps it in a proxy.
    Ref,
    /// Handle into the receiver's own store; the receiver looks it up.
    LocalRef,
    /// Container sent by value whose direct children were classified.
    OneLevel,
    /// An application failure value.
    Error,
}

impl WireTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireTag::Json => "json",
            WireTag::Binary => "binary",
            WireTag::Ref => "ref",
            WireTag::LocalRef => "local-ref",
            WireTag::OneLevel => "one-level",
            WireTag::Error => "error",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "json" => Some(WireTag::Json),
            "binary" => Some(WireTag::Binary),
            "ref" => Some(WireTag::Ref),
            "local-ref" => Some(WireTag::LocalRef),
            "one-level" => Some(WireTag::OneLevel),
            "error" => Some(WireTag::Error),
            _ => None,
        }
    }
}

/// Wrap a payload with a tag.
pub fn tagged(tag: WireTag, data: Json) -> Json {
    json!({ TYPE_KEY: tag.as_str(), DATA_KEY: data })
}

/// Wrap a handle as a `ref` or `local-ref` value.
pub fn handle_ref(tag: WireTag, handle: Handle) -> Json {
    tagged(tag, json!([handle.spawn_id, handle.object_id]))
}

/// Split a wrapped value into its tag and payload.
///
/// Returns `None` for primitives, untagged containers and unknown tags, all
/// of which the receiver treats as plain data.
pub fn untag(value: &Json) -> Option<(WireTag, &Json)> {
    let obj = value.as_object()?;
    let tag = WireTag::parse(obj.get(TYPE_KEY)?.as_str()?)?;
    Some((tag, obj.get(DATA_KEY).unwrap_or(&Json::Null)))
}

/// True for JSON values that cross the wire unchanged.
pub fn is_primitive(value: &Json) -> bool {
    !matches!(value, Json::Array(_) | Json::Object(_))
}
