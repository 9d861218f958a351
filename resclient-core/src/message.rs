use std::{collections::HashMap, fmt};

use serde::{de, Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{ResError, Rid};

/// An outbound request frame.
///
/// `params` is omitted from the wire entirely when absent.
#[derive(Serialize, Debug)]
pub struct Request<'a, T> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<T>,
}

impl<'a, T> Request<'a, T> {
    /// Creates a new request frame.
    pub fn new(id: u64, method: &'a str, params: Option<T>) -> Self {
        Self { id, method, params }
    }
}

/// An inbound frame: a response to a request, or a pushed event.
#[derive(Debug)]
pub enum ServerMessage {
    /// Successful response. `result` is absent for void results.
    Result {
        /// Request id being answered.
        id: u64,
        /// Raw result payload.
        result: Option<Box<RawValue>>,
    },
    /// Error response.
    Error {
        /// Request id being answered.
        id: u64,
        /// The error object.
        error: ResError,
    },
    /// Pushed event, `event` being `"<rid>.<name>"`.
    Event {
        /// The unsplit event subject.
        event: String,
        /// Raw event payload.
        data: Option<Box<RawValue>>,
    },
}

// A frame is a response iff it carries `id`, an event iff it carries
// `event`; anything else is rejected. Hand-written because serde's
// untagged enums cannot borrow RawValue (serde-rs/serde#1183).
impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MessageVisitor;
        impl<'de> de::Visitor<'de> for MessageVisitor {
            type Value = ServerMessage;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a valid RES-Client protocol frame")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut id: Option<u64> = None;
                let mut result: Option<Box<RawValue>> = None;
                let mut error: Option<ResError> = None;
                let mut event: Option<String> = None;
                let mut data: Option<Box<RawValue>> = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        "id" => {
                            if id.is_some() {
                                return Err(de::Error::duplicate_field("id"))
                            }
                            id = Some(map.next_value()?);
                        }
                        "result" => {
                            if result.is_some() {
                                return Err(de::Error::duplicate_field("result"))
                            }
                            result = Some(map.next_value()?);
                        }
                        "error" => {
                            if error.is_some() {
                                return Err(de::Error::duplicate_field("error"))
                            }
                            error = Some(map.next_value()?);
                        }
                        "event" => {
                            if event.is_some() {
                                return Err(de::Error::duplicate_field("event"))
                            }
                            event = Some(map.next_value()?);
                        }
                        "data" => {
                            if data.is_some() {
                                return Err(de::Error::duplicate_field("data"))
                            }
                            data = Some(map.next_value()?);
                        }
                        key => {
                            return Err(de::Error::unknown_field(
                                key,
                                &["id", "result", "error", "event", "data"],
                            ))
                        }
                    }
                }

                match (id, error, event) {
                    (Some(id), Some(error), None) => Ok(ServerMessage::Error { id, error }),
                    (Some(id), None, None) => Ok(ServerMessage::Result { id, result }),
                    (None, None, Some(event)) => Ok(ServerMessage::Event { event, data }),
                    _ => Err(de::Error::custom(
                        "frame must be either a response (id) or an event (event)",
                    )),
                }
            }
        }

        deserializer.deserialize_map(MessageVisitor)
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Result { id, .. } => write!(f, "Result frame. ID: {id}"),
            ServerMessage::Error { id, error } => write!(f, "Error frame. ID: {id}: {error}"),
            ServerMessage::Event { event, .. } => write!(f, "Event frame: {event}"),
        }
    }
}

/// Resource data bundle carried by `subscribe`/`new`/`get` responses, and
/// by `change`/`add` events that bring new resources along.
#[derive(Debug, Default, Deserialize)]
pub struct ResourceSet {
    /// Model snapshots by RID.
    #[serde(default)]
    pub models: HashMap<Rid, HashMap<String, serde_json::Value>>,
    /// Collection snapshots by RID.
    #[serde(default)]
    pub collections: HashMap<Rid, Vec<serde_json::Value>>,
    /// Error objects by RID, for resources the server could not provide.
    #[serde(default)]
    pub errors: HashMap<Rid, ResError>,
}

impl ResourceSet {
    /// True if the bundle carries no resources at all.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.collections.is_empty() && self.errors.is_empty()
    }
}

/// Classification of a raw JSON value in a model field, collection slot,
/// or change-event value slot.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    /// A plain primitive value.
    Primitive(serde_json::Value),
    /// A resource reference `{"rid": <RID>}`.
    Ref(Rid),
    /// The delete sentinel `{"action": "delete"}`, only valid in change
    /// events.
    Delete,
    /// An object or array shape the protocol does not allow in a value
    /// slot.
    Unsupported(serde_json::Value),
}

impl DataValue {
    /// Classifies a raw value slot.
    pub fn classify(value: serde_json::Value) -> Self {
        match &value {
            serde_json::Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(serde_json::Value::String(rid)) = obj.get("rid") {
                        return DataValue::Ref(Rid::new(rid.clone()));
                    }
                    if let Some(serde_json::Value::String(action)) = obj.get("action") {
                        if action == "delete" {
                            return DataValue::Delete;
                        }
                    }
                }
                DataValue::Unsupported(value)
            }
            serde_json::Value::Array(_) => DataValue::Unsupported(value),
            _ => DataValue::Primitive(value),
        }
    }
}
