//! Routing metadata carried next to a server message, never serialized.
//!
//! ```text
//! ServerEnvelope
//!   ├── message: ServerMessage   ──► wire (JSON)
//!   └── route:   Route           ──► fan-out only
//!                  └── presence: Option<PresenceFilter>   ({pres} only)
//! ```
//!
//! A fan-out component evaluates [`Route::admits`] for every candidate
//! session of the recipient topic. All filters that are set must pass;
//! an unset filter does not restrict anything.

use chrono::{DateTime, Utc};

use crate::access::AccessBits;

/// What the fan-out component may know about a candidate session.
pub trait SessionView {
    fn sid(&self) -> &str;
    fn user_id(&self) -> &str;
    /// Cumulative access mode of the session's user on `topic`.
    fn mode_on(&self, topic: &str) -> AccessBits;
    fn is_attached(&self, topic: &str) -> bool;
}

/// Delivery restrictions of a `{pres}` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFilter {
    /// Recipients must answer with exactly one presence of their own.
    /// Never set on the answer, which is what breaks the loop.
    pub want_reply: bool,
    /// Deliver only to sessions whose mode on the topic shares a bit.
    pub filter: AccessBits,
    /// Skip sessions already attached to this topic (used when notifying
    /// the `me` topic about a change on a topic they see directly).
    pub skip_topic: Option<String>,
    /// Deliver to this user's sessions only.
    pub single_user: Option<String>,
}

impl PresenceFilter {
    /// Filter that admits every session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every recipient to answer with its own presence.
    pub fn want_reply(mut self) -> Self {
        self.want_reply = true;
        self
    }

    /// Admit only sessions whose mode shares a bit with `filter`.
    pub fn with_filter(mut self, filter: AccessBits) -> Self {
        self.filter = filter;
        self
    }

    /// Skip sessions attached to `topic`.
    pub fn skip_topic(mut self, topic: impl Into<String>) -> Self {
        self.skip_topic = Some(topic.into());
        self
    }

    /// Admit sessions of `user` only.
    pub fn single_user(mut self, user: impl Into<String>) -> Self {
        self.single_user = Some(user.into());
        self
    }

    /// AND of all set filters for `session` on `topic`.
    pub fn admits(&self, session: &impl SessionView, topic: &str) -> bool {
        if !self.filter.is_empty() && !session.mode_on(topic).intersects(self.filter) {
            return false;
        }
        if let Some(skip) = &self.skip_topic {
            if session.is_attached(skip) {
                return false;
            }
        }
        if let Some(user) = &self.single_user {
            if session.user_id() != user {
                return false;
            }
        }
        true
    }
}

/// Routing companion of every server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Topic whose subscribers receive the message.
    pub rcpt_to: String,
    /// Session that issued the request; receives the acknowledgement.
    /// Only valid for the current dispatch cycle.
    pub sess_from: Option<String>,
    /// Correlation id of the request, for the acknowledgement.
    pub id: String,
    /// Shared by every envelope produced from one request.
    pub timestamp: DateTime<Utc>,
    /// Session excluded from fan-out (`noecho`, self-presence).
    pub skip_sid: Option<String>,
    pub presence: Option<PresenceFilter>,
}

impl Route {
    /// Route to the subscribers of `rcpt_to` with no filters.
    pub fn new(rcpt_to: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            rcpt_to: rcpt_to.into(),
            sess_from: None,
            id: String::new(),
            timestamp,
            skip_sid: None,
            presence: None,
        }
    }

    /// Whether `session` receives the message.
    pub fn admits(&self, session: &impl SessionView) -> bool {
        if self.skip_sid.as_deref() == Some(session.sid()) {
            return false;
        }
        match &self.presence {
            Some(filter) => filter.admits(session, &self.rcpt_to),
            None => true,
        }
    }
}
