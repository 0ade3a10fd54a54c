//! Server-to-client envelopes.
//!
//! Wire format: a JSON object with exactly one of `ctrl`, `data`, `meta`,
//! `pres` or `info`. Routing data travels next to the message in
//! [`ServerEnvelope`] and never reaches the wire.
//!
//! ```text
//! {"ctrl":{"id":"2","code":200,"text":"ok","topic":"grp1","ts":"…"}}
//! {"data":{"topic":"grp1","from":"usr1","seq":42,"content":"hi","ts":"…"}}
//! {"pres":{"topic":"me","src":"usr2","what":"on"}}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessMode;
use crate::client::{ClientEnvelope, Note, NoteWhat, Pub};
use crate::error::ProtocolError;
use crate::outcome::Outcome;
use crate::query::{is_zero_u64, DelRange, TopicDesc, TopicSub};
use crate::routing::{PresenceFilter, Route};
use crate::scope::MetaScope;

/// Current time at the wire's millisecond precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// `{ctrl}`: outcome of a request, see [`Outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ctrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Empty for connection-scoped outcomes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Ctrl {
    /// Outcome matching this code and text, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        Outcome::from_wire(self.code, &self.text)
    }

    /// Attach free-form parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// `{data}`: a published message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub topic: String,
    /// Empty when generated by the system.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    pub ts: DateTime<Utc>,
    /// Soft-delete time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub head: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

impl Data {
    /// Delivery of a `{pub}` under the sequence id assigned by the topic.
    pub fn from_pub(req: &Pub, from: &str, seq: u64, ts: DateTime<Utc>) -> Self {
        Self {
            topic: req.topic.clone(),
            from: from.to_string(),
            ts,
            deleted: None,
            seq,
            head: req.head.clone(),
            content: req.content.clone(),
        }
    }
}

/// `{meta}`: topic description, subscriptions, deleted ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDesc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<TopicSub>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub del: Vec<DelRange>,
}

/// Assembles a `{meta}` reply; blocks outside the requested scope are dropped.
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    scope: MetaScope,
    meta: Meta,
}

impl MetaBuilder {
    /// Empty `{meta}` limited to `scope`.
    pub fn new(id: &str, topic: &str, scope: MetaScope, ts: DateTime<Utc>) -> Self {
        Self {
            scope,
            meta: Meta {
                id: id.to_string(),
                topic: topic.to_string(),
                ts: Some(ts),
                desc: None,
                sub: Vec::new(),
                del: Vec::new(),
            },
        }
    }

    /// Set the description block when `desc` is in scope.
    pub fn desc(mut self, desc: TopicDesc) -> Self {
        if self.scope.contains(MetaScope::DESC) {
            self.meta.desc = Some(desc);
        }
        self
    }

    /// Set the subscriptions block when `sub` is in scope.
    pub fn subs(mut self, subs: Vec<TopicSub>) -> Self {
        if self.scope.contains(MetaScope::SUB) {
            self.meta.sub = subs;
        }
        self
    }

    /// Set the deleted ranges when `del` is in scope.
    pub fn dels(mut self, ranges: Vec<DelRange>) -> Self {
        if self.scope.contains(MetaScope::DEL) {
            self.meta.del = ranges;
        }
        self
    }

    /// Nothing to report for the requested scope.
    pub fn is_empty(&self) -> bool {
        self.meta.desc.is_none() && self.meta.sub.is_empty() && self.meta.del.is_empty()
    }

    /// Finish the `{meta}`.
    pub fn build(self) -> ServerMessage {
        ServerMessage::Meta(self.meta)
    }
}

/// What a `{pres}` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresWhat {
    /// Came online / attached.
    On,
    /// Went offline / detached.
    Off,
    /// User agent changed.
    Ua,
    /// Description updated.
    Upd,
    /// Topic deleted or subscription removed.
    Gone,
    /// Access mode changed.
    Acs,
    /// New message.
    Msg,
    Read,
    Recv,
    /// Messages deleted.
    Del,
    /// Subscription terminated by the server.
    Term,
    Tags,
}

/// `{pres}`: presence or topic-state change notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pres {
    pub topic: String,
    pub src: String,
    pub what: PresWhat,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delseq: Vec<DelRange>,
    /// User whose access changed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tgt: String,
    /// User who changed it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessMode>,
}

impl Pres {
    /// Presence notice with no optional fields.
    pub fn new(topic: &str, src: &str, what: PresWhat) -> Self {
        Self {
            topic: topic.to_string(),
            src: src.to_string(),
            what,
            ua: String::new(),
            seq: 0,
            delseq: Vec::new(),
            tgt: String::new(),
            act: String::new(),
            acs: None,
        }
    }

    /// Access change of `target` performed by `actor`.
    pub fn access_change(topic: &str, src: &str, actor: &str, target: &str, acs: AccessMode) -> Self {
        Self {
            act: actor.to_string(),
            tgt: target.to_string(),
            acs: Some(acs),
            ..Self::new(topic, src, PresWhat::Acs)
        }
    }
}

/// Kind of an `{info}` notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoWhat {
    /// Message received.
    Rcpt,
    Read,
    /// Typing.
    Kp,
}

impl From<NoteWhat> for InfoWhat {
    fn from(what: NoteWhat) -> Self {
        match what {
            NoteWhat::Recv => InfoWhat::Rcpt,
            NoteWhat::Read => InfoWhat::Read,
            NoteWhat::Kp => InfoWhat::Kp,
        }
    }
}

/// `{info}`: a client `{note}` echoed to the other subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub topic: String,
    pub from: String,
    pub what: InfoWhat,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
}

impl Info {
    /// Relay a client `{note}` from user `from`.
    pub fn from_note(note: &Note, from: &str) -> Self {
        Self {
            topic: note.topic.clone(),
            from: from.to_string(),
            what: note.what.into(),
            seq: note.seq,
        }
    }
}

/// One server message. Exactly one variant by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Ctrl(Ctrl),
    Data(Data),
    Meta(Meta),
    Pres(Pres),
    Info(Info),
}

impl ServerMessage {
    /// Topic the message is about; empty for connection-scoped `{ctrl}`.
    pub fn topic(&self) -> &str {
        match self {
            ServerMessage::Ctrl(m) => &m.topic,
            ServerMessage::Data(m) => &m.topic,
            ServerMessage::Meta(m) => &m.topic,
            ServerMessage::Pres(m) => &m.topic,
            ServerMessage::Info(m) => &m.topic,
        }
    }

    /// Variant key as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ctrl(_) => "ctrl",
            ServerMessage::Data(_) => "data",
            ServerMessage::Meta(_) => "meta",
            ServerMessage::Pres(_) => "pres",
            ServerMessage::Info(_) => "info",
        }
    }

    /// Attach `params` to a `{ctrl}`. Other variants are returned as is.
    pub fn with_params(self, params: Value) -> Self {
        match self {
            ServerMessage::Ctrl(ctrl) => ServerMessage::Ctrl(ctrl.with_params(params)),
            other => other,
        }
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Client-side decode. The tagged enum rejects zero or several keys.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A server message plus its routing companion.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEnvelope {
    pub message: ServerMessage,
    pub route: Route,
}

impl ServerEnvelope {
    /// Addressed to the subscribers of the message's topic.
    pub fn broadcast(message: ServerMessage, ts: DateTime<Utc>) -> Self {
        let route = Route::new(message.topic(), ts);
        Self { message, route }
    }

    /// Addressed to one session only (replies, acknowledgements).
    pub fn reply(message: ServerMessage, sid: &str, ts: DateTime<Utc>) -> Self {
        let mut route = Route::new(message.topic(), ts);
        route.sess_from = Some(sid.to_string());
        Self { message, route }
    }

    /// `{pres}` with its delivery filters.
    pub fn presence(pres: Pres, filter: PresenceFilter, ts: DateTime<Utc>) -> Self {
        let mut route = Route::new(pres.topic.clone(), ts);
        route.presence = Some(filter);
        Self {
            message: ServerMessage::Pres(pres),
            route,
        }
    }

    /// `{data}` for a `{pub}` received on session `sid`. Uses the receipt
    /// time of `origin` so the acknowledgement can carry the same stamp.
    pub fn publication(req: &Pub, origin: &ClientEnvelope, sid: &str, seq: u64) -> Self {
        let ts = origin.timestamp;
        let mut route = Route::new(req.topic.clone(), ts);
        route.sess_from = Some(sid.to_string());
        route.id = req.id.clone();
        if req.noecho {
            route.skip_sid = Some(sid.to_string());
        }
        Self {
            message: ServerMessage::Data(Data::from_pub(req, &origin.from, seq, ts)),
            route,
        }
    }

    /// Exclude one session from the fan-out.
    pub fn skip_session(mut self, sid: &str) -> Self {
        self.route.skip_sid = Some(sid.to_string());
        self
    }

    /// Acknowledgement for the originating session, stamped with the
    /// envelope's own timestamp.
    pub fn ack(&self, outcome: Outcome) -> ServerMessage {
        let ctrl = outcome.ctrl(&self.route.id, &self.route.rcpt_to, self.route.timestamp);
        match &self.message {
            ServerMessage::Data(data) => ctrl.with_params(serde_json::json!({ "seq": data.seq })),
            _ => ctrl,
        }
    }

    /// Timestamp shared by every envelope of the request.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.route.timestamp
    }

    /// Only the message is serialized; the route stays behind.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.message.encode()
    }
}
