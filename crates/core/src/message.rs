//! NIP-01 wire messages, both directions.
//!
//! The aggregator speaks the relay protocol on both sides: it parses
//! [`ClientMessage`] from its own clients and emits [`RelayMessage`] back to
//! them, while its upstream sessions emit [`ClientMessage`] and parse
//! [`RelayMessage`]. Both enums therefore implement `Serialize` and
//! `Deserialize` over the JSON array framing:
//!
//! **Client → relay:** `EVENT`, `REQ`, `COUNT` (NIP-45), `CLOSE`, `AUTH`
//!
//! **Relay → client:** `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`, `COUNT`,
//! `AUTH`

use crate::event::Event;
use crate::filter::Filter;
use serde::de::Error as DeError;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors that can occur when parsing wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Client-to-relay message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event { event: Event },
    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["COUNT", <subscription_id>, <filter>...]` (NIP-45)
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
    /// `["AUTH", <event>]` (NIP-42)
    Auth { event: Event },
}

impl ClientMessage {
    /// Parse a client message from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }
}

impl Serialize for ClientMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ClientMessage::Event { event } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(event)?;
                seq.end()
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("REQ")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("COUNT")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            ClientMessage::Close { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            ClientMessage::Auth { event } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(event)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
        if arr.is_empty() {
            return Err(D::Error::custom("empty message"));
        }
        let cmd = arr[0]
            .as_str()
            .ok_or_else(|| D::Error::custom("first element must be a string"))?;

        match cmd {
            "EVENT" => {
                if arr.len() < 2 {
                    return Err(D::Error::custom("EVENT requires an event"));
                }
                let event: Event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| D::Error::custom(format!("invalid event: {e}")))?;
                Ok(ClientMessage::Event { event })
            }
            "REQ" | "COUNT" => {
                if arr.len() < 3 {
                    return Err(D::Error::custom(format!(
                        "{cmd} requires a subscription id and at least one filter"
                    )));
                }
                let subscription_id = arr[1]
                    .as_str()
                    .ok_or_else(|| D::Error::custom("subscription id must be a string"))?
                    .to_string();
                let mut filters = Vec::new();
                for filter_val in &arr[2..] {
                    let filter: Filter = serde_json::from_value(filter_val.clone())
                        .map_err(|e| D::Error::custom(format!("invalid filter: {e}")))?;
                    filters.push(filter);
                }
                if cmd == "REQ" {
                    Ok(ClientMessage::Req {
                        subscription_id,
                        filters,
                    })
                } else {
                    Ok(ClientMessage::Count {
                        subscription_id,
                        filters,
                    })
                }
            }
            "CLOSE" => {
                if arr.len() < 2 {
                    return Err(D::Error::custom("CLOSE requires a subscription id"));
                }
                let subscription_id = arr[1]
                    .as_str()
                    .ok_or_else(|| D::Error::custom("subscription id must be a string"))?
                    .to_string();
                Ok(ClientMessage::Close { subscription_id })
            }
            "AUTH" => {
                if arr.len() < 2 {
                    return Err(D::Error::custom("AUTH requires an event"));
                }
                let event: Event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| D::Error::custom(format!("invalid auth event: {e}")))?;
                Ok(ClientMessage::Auth { event })
            }
            _ => Err(D::Error::custom(format!("unknown command: {cmd}"))),
        }
    }
}

/// Relay-to-client message.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },
    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice { message: String },
    /// `["COUNT", <subscription_id>, {"count": <n>}]` (NIP-45)
    Count { subscription_id: String, count: u64 },
    /// `["AUTH", <challenge>]` (NIP-42)
    Auth { challenge: String },
}

impl RelayMessage {
    /// Parse a relay message from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }
}

impl Serialize for RelayMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event)?;
                seq.end()
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Eose { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Notice { message } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("COUNT")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(&serde_json::json!({ "count": count }))?;
                seq.end()
            }
            RelayMessage::Auth { challenge } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(challenge)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RelayMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
        if arr.is_empty() {
            return Err(D::Error::custom("empty message"));
        }
        let cmd = arr[0]
            .as_str()
            .ok_or_else(|| D::Error::custom("first element must be a string"))?;

        let str_at = |i: usize| -> Result<String, D::Error> {
            arr.get(i)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| D::Error::custom(format!("{cmd} missing string at {i}")))
        };

        match cmd {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(D::Error::custom("EVENT requires subscription id and event"));
                }
                let event: Event = serde_json::from_value(arr[2].clone())
                    .map_err(|e| D::Error::custom(format!("invalid event: {e}")))?;
                Ok(RelayMessage::Event {
                    subscription_id: str_at(1)?,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(D::Error::custom("OK requires id, flag, and message"));
                }
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| D::Error::custom("OK flag must be a boolean"))?;
                Ok(RelayMessage::Ok {
                    event_id: str_at(1)?,
                    accepted,
                    message: str_at(3)?,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: str_at(1)?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: str_at(1)?,
            }),
            "COUNT" => {
                let count = arr
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| D::Error::custom("COUNT requires a count object"))?;
                Ok(RelayMessage::Count {
                    subscription_id: str_at(1)?,
                    count,
                })
            }
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(1)?,
            }),
            _ => Err(D::Error::custom(format!("unknown message: {cmd}"))),
        }
    }
}
