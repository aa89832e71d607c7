//! The wire envelope and its nine message kinds.
//!
//! Every message is a JSON object of the form
//! `{"meta": {"uuid", "type", "timestamp"}, "payload": {...}}` where the
//! payload shape is determined by the kind in `meta.type`. Clients send
//! CALL, PUB, SUB and UNSB; the server answers with OK, ERR, RES, EVNT
//! and EXP.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// A JSON `null` for defaulted `args` fields.
fn null_args() -> Box<RawValue> {
    RawValue::from_string("null".into()).expect("null is valid JSON")
}

/// The kind tag of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    /// Request/response call routed to a callee.
    Call,
    /// Publish on a channel.
    Pub,
    /// Subscribe to a channel or pattern.
    Sub,
    /// Unsubscribe from a channel or pattern.
    Unsb,
    /// A call whose deadline elapsed before a result was produced.
    Exp,
    /// Positive acknowledgement of a client message.
    Ok,
    /// Negative acknowledgement of a client message.
    Err,
    /// Result of a CALL.
    Res,
    /// Pub/sub event.
    Evnt,
}

impl Kind {
    /// The kinds a client may send.
    pub const CLIENT_KINDS: [Kind; 4] = [Kind::Call, Kind::Pub, Kind::Sub, Kind::Unsb];

    /// Whether this kind flows client → server.
    pub const fn is_from_client(self) -> bool {
        matches!(self, Kind::Call | Kind::Pub | Kind::Sub | Kind::Unsb)
    }

    /// Canonical wire spelling of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::Call => "CALL",
            Kind::Pub => "PUB",
            Kind::Sub => "SUB",
            Kind::Unsb => "UNSB",
            Kind::Exp => "EXP",
            Kind::Ok => "OK",
            Kind::Err => "ERR",
            Kind::Res => "RES",
            Kind::Evnt => "EVNT",
        }
    }

    /// Parse a single header token, case-insensitively.
    pub fn parse_token(s: &str) -> Option<Kind> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" => Some(Kind::Call),
            "PUB" => Some(Kind::Pub),
            "SUB" => Some(Kind::Sub),
            "UNSB" => Some(Kind::Unsb),
            "EXP" => Some(Kind::Exp),
            "OK" => Some(Kind::Ok),
            "ERR" => Some(Kind::Err),
            "RES" => Some(Kind::Res),
            "EVNT" => Some(Kind::Evnt),
            _ => None,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a `Juggler-Allowed-Messages` header value into the set of client
/// kinds the client declared. Unknown tokens and server-side kinds are
/// ignored; an empty result means the header carried nothing enforceable
/// and all client kinds remain allowed.
pub fn parse_allowed_messages(value: &str) -> Option<Vec<Kind>> {
    let kinds: Vec<Kind> = value
        .split(',')
        .filter_map(Kind::parse_token)
        .filter(|k| k.is_from_client())
        .collect();
    if kinds.is_empty() {
        None
    } else {
        Some(kinds)
    }
}

/// Envelope metadata common to every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Stable message identifier.
    pub uuid: Uuid,
    /// The kind tag selecting the payload shape.
    #[serde(rename = "type")]
    pub kind: Kind,
    /// Creation timestamp, UTC.
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    fn new(kind: Kind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Payload of a CALL message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    /// Routing key of the callee-provided procedure.
    pub uri: String,
    /// Opaque arguments forwarded to the callee.
    #[serde(default = "null_args")]
    pub args: Box<RawValue>,
    /// Caller deadline in milliseconds; 0 selects the server default.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: u64,
}

/// Payload of a PUB message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubParams {
    /// Channel to publish on.
    pub channel: String,
    /// Opaque event payload.
    #[serde(default = "null_args")]
    pub args: Box<RawValue>,
}

/// Payload of a SUB or UNSB message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubParams {
    /// Channel name, or a glob when `pattern` is set.
    pub channel: String,
    /// Whether `channel` is a glob pattern.
    #[serde(default)]
    pub pattern: bool,
}

/// Payload of an OK message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkPayload {
    /// Identifier of the acknowledged client message.
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    /// Kind of the acknowledged client message.
    #[serde(rename = "forType")]
    pub for_kind: Kind,
}

/// Payload of an ERR message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrPayload {
    /// Identifier of the message this error responds to.
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    /// Kind of the message this error responds to, when known.
    #[serde(rename = "forType", skip_serializing_if = "Option::is_none", default)]
    pub for_kind: Option<Kind>,
    /// Stable error code, see [`crate::error::code`].
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

/// Payload of a RES message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResParams {
    /// Identifier of the CALL this result answers.
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    /// URI the call was routed to.
    pub uri: String,
    /// The callee's result, or an `{"error": ...}` object.
    pub args: Box<RawValue>,
}

/// Payload of an EXP message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpParams {
    /// Identifier of the expired CALL.
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    /// URI the call was routed to.
    pub uri: String,
}

/// Payload of an EVNT message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvntParams {
    /// Channel the event was published on.
    pub channel: String,
    /// The matching pattern, for pattern subscriptions.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pattern: Option<String>,
    /// Opaque event payload.
    #[serde(default = "null_args")]
    pub args: Box<RawValue>,
}

/// Kind-specific payload of a message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// CALL payload.
    Call(CallParams),
    /// PUB payload.
    Pub(PubParams),
    /// SUB or UNSB payload.
    Sub(SubParams),
    /// OK payload.
    Ok(OkPayload),
    /// ERR payload.
    Err(ErrPayload),
    /// RES payload.
    Res(ResParams),
    /// EXP payload.
    Exp(ExpParams),
    /// EVNT payload.
    Evnt(EvntParams),
}

/// A complete wire message.
#[derive(Debug, Clone, Serialize)]
pub struct Msg {
    /// Envelope metadata.
    pub meta: Meta,
    /// Kind-specific payload.
    pub payload: Payload,
}

impl Msg {
    /// Build a CALL message.
    pub fn new_call(uri: impl Into<String>, args: Box<RawValue>, timeout_ms: u64) -> Msg {
        Msg {
            meta: Meta::new(Kind::Call),
            payload: Payload::Call(CallParams {
                uri: uri.into(),
                args,
                timeout_ms,
            }),
        }
    }

    /// Build a PUB message.
    pub fn new_pub(channel: impl Into<String>, args: Box<RawValue>) -> Msg {
        Msg {
            meta: Meta::new(Kind::Pub),
            payload: Payload::Pub(PubParams {
                channel: channel.into(),
                args,
            }),
        }
    }

    /// Build a SUB message.
    pub fn new_sub(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg {
            meta: Meta::new(Kind::Sub),
            payload: Payload::Sub(SubParams {
                channel: channel.into(),
                pattern,
            }),
        }
    }

    /// Build an UNSB message.
    pub fn new_unsb(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg {
            meta: Meta::new(Kind::Unsb),
            payload: Payload::Sub(SubParams {
                channel: channel.into(),
                pattern,
            }),
        }
    }

    /// Build an OK acknowledging `of`.
    pub fn new_ok(of: &Meta) -> Msg {
        Msg {
            meta: Meta::new(Kind::Ok),
            payload: Payload::Ok(OkPayload {
                for_uuid: of.uuid,
                for_kind: of.kind,
            }),
        }
    }

    /// Build an ERR responding to the message identified by `for_uuid`.
    pub fn new_err(
        for_uuid: Uuid,
        for_kind: Option<Kind>,
        code: u16,
        message: impl Into<String>,
    ) -> Msg {
        Msg {
            meta: Meta::new(Kind::Err),
            payload: Payload::Err(ErrPayload {
                for_uuid,
                for_kind,
                code,
                message: message.into(),
            }),
        }
    }

    /// Build a RES carrying a call result.
    pub fn new_res(for_uuid: Uuid, uri: impl Into<String>, args: Box<RawValue>) -> Msg {
        Msg {
            meta: Meta::new(Kind::Res),
            payload: Payload::Res(ResParams {
                for_uuid,
                uri: uri.into(),
                args,
            }),
        }
    }

    /// Build an EXP for a call whose deadline elapsed.
    pub fn new_exp(for_uuid: Uuid, uri: impl Into<String>) -> Msg {
        Msg {
            meta: Meta::new(Kind::Exp),
            payload: Payload::Exp(ExpParams {
                for_uuid,
                uri: uri.into(),
            }),
        }
    }

    /// Build an EVNT from a broker event.
    pub fn new_evnt(
        channel: impl Into<String>,
        pattern: Option<String>,
        args: Box<RawValue>,
    ) -> Msg {
        Msg {
            meta: Meta::new(Kind::Evnt),
            payload: Payload::Evnt(EvntParams {
                channel: channel.into(),
                pattern,
                args,
            }),
        }
    }

    /// The identifier of the message this one responds to, for the
    /// response kinds that carry one.
    pub fn for_uuid(&self) -> Option<Uuid> {
        match &self.payload {
            Payload::Ok(p) => Some(p.for_uuid),
            Payload::Err(p) => Some(p.for_uuid),
            Payload::Res(p) => Some(p.for_uuid),
            Payload::Exp(p) => Some(p.for_uuid),
            _ => None,
        }
    }

    /// Decode a message from its wire bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Msg, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode the message to its wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Best-effort extraction of the envelope uuid from bytes that failed
/// full decoding, so the ERR can still name the offending message.
pub(crate) fn peek_uuid(bytes: &[u8]) -> Option<Uuid> {
    #[derive(Deserialize)]
    struct PeekMeta {
        uuid: Uuid,
    }
    #[derive(Deserialize)]
    struct Peek {
        meta: PeekMeta,
    }
    serde_json::from_slice::<Peek>(bytes).ok().map(|p| p.meta.uuid)
}

impl<'de> Deserialize<'de> for Msg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            meta: Meta,
            payload: Box<RawValue>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let raw = wire.payload.get();
        let payload = match wire.meta.kind {
            Kind::Call => Payload::Call(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Pub => Payload::Pub(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Sub | Kind::Unsb => {
                Payload::Sub(serde_json::from_str(raw).map_err(de::Error::custom)?)
            }
            Kind::Ok => Payload::Ok(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Err => Payload::Err(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Res => Payload::Res(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Exp => Payload::Exp(serde_json::from_str(raw).map_err(de::Error::custom)?),
            Kind::Evnt => Payload::Evnt(serde_json::from_str(raw).map_err(de::Error::custom)?),
        };
        Ok(Msg {
            meta: wire.meta,
            payload,
        })
    }
}
