//! Client-to-server envelopes.
//!
//! Wire format: a JSON object with exactly one of ten keys.
//!
//! ```text
//! {"hi":{"id":"1","ver":"0.16","ua":"…"}}
//! {"sub":{"id":"2","topic":"grp1","get":{"what":"desc sub data"}}}
//! {"pub":{"topic":"grp1","content":{"text":"hi"}}}
//! {"del":{"topic":"grp1","what":"msg","delseq":[{"low":1,"hi":5}]}}
//! ```
//!
//! Decoding goes through [`RawClientMessage`], which counts the populated
//! keys and validates the chosen variant; anything else is malformed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::query::{is_false, is_zero_u64, DelRange, GetQuery, SetDesc, SetQuery};
use crate::scope::DeleteScope;
use crate::server::now;

/// Prefix of `acc.user` asking for a new account.
pub const NEW_USER_PREFIX: &str = "new";

/// Top-level keys naming a client message variant.
const VARIANT_KEYS: [&str; 10] = [
    "hi", "acc", "login", "sub", "leave", "pub", "get", "set", "del", "note",
];

mod secret {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// `{hi}`: handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hi {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
    /// Protocol version, e.g. `"0.16"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ver: String,
    /// Unique device id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev: String,
    /// ISO 639-1 language code.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,
}

/// `{acc}`: create or update an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// `newXYZ` to create, a user id to update, empty for the current user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(default, with = "secret", skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<u8>,
    /// Authenticate the session as this account.
    #[serde(default, skip_serializing_if = "is_false")]
    pub login: bool,
    /// Discovery tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Initial description, new accounts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
}

impl Acc {
    /// Whether this request creates a new account.
    pub fn creates_user(&self) -> bool {
        self.user.starts_with(NEW_USER_PREFIX)
    }
}

/// `{login}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(default, with = "secret", skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<u8>,
}

/// `{sub}`: attach to a topic, optionally updating and querying it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<SetQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<GetQuery>,
}

/// `{leave}`: detach, optionally unsubscribing for good.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsub: bool,
}

/// `{pub}`: publish to the subscribers of a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    /// Do not deliver the resulting `{data}` back to the sender.
    #[serde(default, skip_serializing_if = "is_false")]
    pub noecho: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub head: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

/// `{get}`: query topic state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(flatten)]
    pub query: GetQuery,
}

/// `{set}`: update topic description or a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Set {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(flatten)]
    pub query: SetQuery,
}

/// `{del}`: delete messages, the topic, or a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Del {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    /// `msg` (default), `topic` or `sub`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub what: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delseq: Vec<DelRange>,
    /// Subscriber to remove when `what` is `sub`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Delete for everyone rather than for the requester only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hard: bool,
}

impl Del {
    /// Strict scope; unrecognized `what` is an error.
    pub fn scope(&self) -> Result<DeleteScope, ProtocolError> {
        DeleteScope::parse_strict(&self.what)
    }
}

/// Kind of a `{note}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteWhat {
    Recv,
    Read,
    /// Key press: typing notification.
    Kp,
}

/// `{note}`: fire-and-forget notification. Never acknowledged, no id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub topic: String,
    pub what: NoteWhat,
    /// Message id being reported.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
}

/// One client intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "RawClientMessage")]
pub enum ClientMessage {
    Hi(Hi),
    Acc(Acc),
    Login(Login),
    Sub(Sub),
    Leave(Leave),
    Pub(Pub),
    Get(Get),
    Set(Set),
    Del(Del),
    Note(Note),
}

/// Wire-level shape: every variant optional, at most one expected.
/// Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct RawClientMessage {
    #[serde(default)]
    hi: Option<Hi>,
    #[serde(default)]
    acc: Option<Acc>,
    #[serde(default)]
    login: Option<Login>,
    #[serde(default)]
    sub: Option<Sub>,
    #[serde(default)]
    leave: Option<Leave>,
    #[serde(default, rename = "pub")]
    publish: Option<Pub>,
    #[serde(default)]
    get: Option<Get>,
    #[serde(default)]
    set: Option<Set>,
    #[serde(default)]
    del: Option<Del>,
    #[serde(default)]
    note: Option<Note>,
}

impl TryFrom<RawClientMessage> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawClientMessage) -> Result<Self, Self::Error> {
        let mut found: Vec<ClientMessage> = [
            raw.hi.map(ClientMessage::Hi),
            raw.acc.map(ClientMessage::Acc),
            raw.login.map(ClientMessage::Login),
            raw.sub.map(ClientMessage::Sub),
            raw.leave.map(ClientMessage::Leave),
            raw.publish.map(ClientMessage::Pub),
            raw.get.map(ClientMessage::Get),
            raw.set.map(ClientMessage::Set),
            raw.del.map(ClientMessage::Del),
            raw.note.map(ClientMessage::Note),
        ]
        .into_iter()
        .flatten()
        .collect();

        match found.len() {
            0 => Err(ProtocolError::Malformed("no message variant present".into())),
            1 => {
                let msg = found.remove(0);
                msg.validate()?;
                Ok(msg)
            }
            n => Err(ProtocolError::Malformed(format!(
                "{n} message variants present, expected one"
            ))),
        }
    }
}

fn require_topic(kind: &str, topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::Malformed(format!("{kind}: missing topic")));
    }
    Ok(())
}

impl ClientMessage {
    /// Variant key as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hi(_) => "hi",
            ClientMessage::Acc(_) => "acc",
            ClientMessage::Login(_) => "login",
            ClientMessage::Sub(_) => "sub",
            ClientMessage::Leave(_) => "leave",
            ClientMessage::Pub(_) => "pub",
            ClientMessage::Get(_) => "get",
            ClientMessage::Set(_) => "set",
            ClientMessage::Del(_) => "del",
            ClientMessage::Note(_) => "note",
        }
    }

    /// Correlation id; always empty for `{note}`.
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::Hi(m) => &m.id,
            ClientMessage::Acc(m) => &m.id,
            ClientMessage::Login(m) => &m.id,
            ClientMessage::Sub(m) => &m.id,
            ClientMessage::Leave(m) => &m.id,
            ClientMessage::Pub(m) => &m.id,
            ClientMessage::Get(m) => &m.id,
            ClientMessage::Set(m) => &m.id,
            ClientMessage::Del(m) => &m.id,
            ClientMessage::Note(_) => "",
        }
    }

    /// Topic for topic-scoped variants.
    pub fn topic(&self) -> Option<&str> {
        match self {
            ClientMessage::Hi(_) | ClientMessage::Acc(_) | ClientMessage::Login(_) => None,
            ClientMessage::Sub(m) => Some(&m.topic),
            ClientMessage::Leave(m) => Some(&m.topic),
            ClientMessage::Pub(m) => Some(&m.topic),
            ClientMessage::Get(m) => Some(&m.topic),
            ClientMessage::Set(m) => Some(&m.topic),
            ClientMessage::Del(m) => Some(&m.topic),
            ClientMessage::Note(m) => Some(&m.topic),
        }
    }

    /// Required-field checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(topic) = self.topic() {
            require_topic(self.kind(), topic)?;
        }
        match self {
            ClientMessage::Get(get) => {
                if get.query.scope().is_empty() {
                    return Err(ProtocolError::Malformed(format!(
                        "get: nothing requested in '{}'",
                        get.query.what
                    )));
                }
            }
            ClientMessage::Del(del) => {
                let scope = del.scope()?;
                if scope == DeleteScope::MSG {
                    if del.delseq.is_empty() {
                        return Err(ProtocolError::Malformed("del: no ranges".into()));
                    }
                    if let Some(bad) = del.delseq.iter().find(|r| !r.is_valid()) {
                        return Err(ProtocolError::Malformed(format!("del: invalid range {bad:?}")));
                    }
                }
                if scope == DeleteScope::SUB && del.user.is_empty() {
                    return Err(ProtocolError::Malformed("del: missing user".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A decoded client message plus out-of-band receipt data.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub message: ClientMessage,
    /// User the session is authenticated as; empty before login.
    pub from: String,
    /// When the server received the message.
    pub timestamp: DateTime<Utc>,
}

impl ClientEnvelope {
    /// Wrap an already decoded message.
    pub fn new(message: ClientMessage, from: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            message,
            from: from.to_string(),
            timestamp,
        }
    }

    /// Decode and stamp with the current time.
    pub fn decode(bytes: &[u8], from: &str) -> Result<Self, ProtocolError> {
        Self::decode_at(bytes, from, now())
    }

    /// Decode with an explicit receipt time.
    pub fn decode_at(bytes: &[u8], from: &str, timestamp: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let message: ClientMessage = serde_json::from_slice(bytes)?;
        Ok(Self::new(message, from, timestamp))
    }

    /// Id echoed in every reply to this message.
    pub fn correlation_id(&self) -> &str {
        self.message.id()
    }

    /// Only the message is serialized.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self.message).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Best-effort correlation id of a message that failed to decode, so
    /// the malformed reply can still be matched by the client.
    pub fn salvage_id(bytes: &[u8]) -> String {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(bytes) else {
            return String::new();
        };
        VARIANT_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|body| body.get("id").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    }
}
