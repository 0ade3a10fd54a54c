//! Per-connection request dispatcher on top of [`TopicHub`].
//!
//! ```text
//! bytes ──► ClientEnvelope::decode ──► verb handler ──┬─► hub.reply     (ctrl / meta)
//!               │                                     └─► hub.dispatch  (data / pres / info)
//!               └── malformed ──► ctrl 400 with the salvaged id
//! ```
//!
//! Every envelope produced for one request carries the receipt timestamp
//! of that request. Account, login, set and delete requests are answered
//! with `not implemented`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::access::AccessBits;
use crate::client::{ClientEnvelope, ClientMessage, Get, Hi, Leave, Note, Pub, Sub};
use crate::config::ProtocolConfig;
use crate::error::HubError;
use crate::hub::{Outbound, TopicHub};
use crate::outcome::{self, Outcome};
use crate::routing::PresenceFilter;
use crate::server::{now, Info, MetaBuilder, Pres, PresWhat, ServerEnvelope, ServerMessage};

/// Mode granted on `{sub}`: join, read, write, presence, share.
pub const SUBSCRIBER_MODE: AccessBits = AccessBits::JOIN
    .union(AccessBits::READ)
    .union(AccessBits::WRITE)
    .union(AccessBits::PRES)
    .union(AccessBits::SHARE);

/// One connected client.
pub struct Session {
    sid: String,
    user: String,
    hub: Arc<TopicHub>,
    protocol: ProtocolConfig,
}

impl Session {
    /// Register with the hub. The receiver yields everything addressed to
    /// this session.
    pub async fn open(hub: Arc<TopicHub>, protocol: ProtocolConfig, user: &str) -> (Self, Outbound) {
        let (sid, rx) = hub.connect(user).await;
        let session = Self {
            sid,
            user: user.to_string(),
            hub,
            protocol,
        };
        (session, rx)
    }

    /// Hub session id.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// User this session acts for.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Decode one inbound message and act on it.
    pub async fn handle(&self, bytes: &[u8]) -> Result<(), HubError> {
        let envelope = match ClientEnvelope::decode(bytes, &self.user) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("Session {}: {err}", self.sid);
                let id = ClientEnvelope::salvage_id(bytes);
                let ts = now();
                return self.respond(err.outcome().ctrl(&id, "", ts), ts).await;
            }
        };
        log::debug!("Session {} <- {}", self.sid, envelope.message.kind());

        let ts = envelope.timestamp;
        match &envelope.message {
            ClientMessage::Hi(hi) => self.on_hi(hi, ts).await,
            ClientMessage::Sub(sub) => self.on_sub(sub, ts).await,
            ClientMessage::Leave(leave) => self.on_leave(leave, ts).await,
            ClientMessage::Pub(req) => self.on_pub(req, &envelope).await,
            ClientMessage::Note(note) => self.on_note(note, ts).await,
            ClientMessage::Get(get) => self.on_get(get, ts).await,
            ClientMessage::Acc(_)
            | ClientMessage::Login(_)
            | ClientMessage::Set(_)
            | ClientMessage::Del(_) => {
                let topic = envelope.message.topic().unwrap_or_default();
                let reply = outcome::not_implemented(envelope.correlation_id(), topic, ts);
                self.respond(reply, ts).await
            }
        }
    }

    /// Detach from everything, tell the other subscribers, unregister.
    pub async fn close(self) {
        let ts = now();
        for topic in self.hub.disconnect(&self.sid).await {
            self.announce(&topic, PresWhat::Off, false, ts).await;
        }
    }

    async fn respond(&self, message: ServerMessage, ts: DateTime<Utc>) -> Result<(), HubError> {
        self.hub
            .reply(&ServerEnvelope::reply(message, &self.sid, ts))
            .await
            .map(|_| ())
    }

    /// `{pres}` about this user to the other subscribers of `topic`. With
    /// `want_reply` each of them answers with its own presence.
    async fn announce(&self, topic: &str, what: PresWhat, want_reply: bool, ts: DateTime<Utc>) {
        let pres = Pres::new(topic, &self.user, what);
        let mut filter = PresenceFilter::new().with_filter(AccessBits::PRES);
        if want_reply {
            filter = filter.want_reply();
        }
        let envelope = ServerEnvelope::presence(pres, filter, ts).skip_session(&self.sid);
        self.hub.dispatch(&envelope).await;
    }

    async fn on_hi(&self, hi: &Hi, ts: DateTime<Utc>) -> Result<(), HubError> {
        let reply = match self.protocol.check_version(&hi.ver) {
            Ok(()) => outcome::created(&hi.id, "", ts).with_params(json!({
                "ver": self.protocol.version,
                "sid": self.sid,
            })),
            Err(err) => {
                log::info!("Session {} rejected: {err}", self.sid);
                err.outcome().ctrl(&hi.id, "", ts)
            }
        };
        self.respond(reply, ts).await
    }

    async fn on_sub(&self, sub: &Sub, ts: DateTime<Utc>) -> Result<(), HubError> {
        let attached = match self.hub.attach(&self.sid, &sub.topic, SUBSCRIBER_MODE).await {
            Ok(attached) => attached,
            Err(err) => return self.respond(err.outcome().ctrl(&sub.id, &sub.topic, ts), ts).await,
        };
        if !attached {
            return self
                .respond(outcome::already_subscribed(&sub.id, &sub.topic, ts), ts)
                .await;
        }

        // Attached regardless of whether the ack got through.
        let acked = self.respond(outcome::ok(&sub.id, &sub.topic, ts), ts).await;
        self.announce(&sub.topic, PresWhat::On, true, ts).await;
        acked?;

        if let Some(get) = &sub.get {
            let scope = get.scope();
            if !scope.is_empty() {
                let meta = MetaBuilder::new(&sub.id, &sub.topic, scope, ts).build();
                self.respond(meta, ts).await?;
            }
        }
        Ok(())
    }

    async fn on_leave(&self, leave: &Leave, ts: DateTime<Utc>) -> Result<(), HubError> {
        if !self.hub.detach(&self.sid, &leave.topic).await {
            return self
                .respond(outcome::not_joined(&leave.id, &leave.topic, ts), ts)
                .await;
        }
        let acked = self.respond(outcome::ok(&leave.id, &leave.topic, ts), ts).await;
        self.announce(&leave.topic, PresWhat::Off, false, ts).await;
        acked
    }

    async fn on_pub(&self, req: &Pub, origin: &ClientEnvelope) -> Result<(), HubError> {
        let ts = origin.timestamp;
        if !self.hub.is_attached(&self.sid, &req.topic).await {
            return self
                .respond(outcome::attach_first(&req.id, &req.topic, ts), ts)
                .await;
        }
        let seq = self.hub.next_seq(&req.topic).await;
        let envelope = ServerEnvelope::publication(req, origin, &self.sid, seq);
        let delivered = self.hub.dispatch(&envelope).await;
        log::debug!("Session {} published {} seq {seq} to {delivered} sessions", self.sid, req.topic);
        self.respond(envelope.ack(Outcome::Accepted), ts).await
    }

    /// Unattached notes are ignored; notes are never acknowledged.
    async fn on_note(&self, note: &Note, ts: DateTime<Utc>) -> Result<(), HubError> {
        if !self.hub.is_attached(&self.sid, &note.topic).await {
            log::debug!("Session {} note on unattached {}", self.sid, note.topic);
            return Ok(());
        }
        let info = ServerMessage::Info(Info::from_note(note, &self.user));
        let envelope = ServerEnvelope::broadcast(info, ts).skip_session(&self.sid);
        self.hub.dispatch(&envelope).await;
        Ok(())
    }

    async fn on_get(&self, get: &Get, ts: DateTime<Utc>) -> Result<(), HubError> {
        if !self.hub.is_attached(&self.sid, &get.topic).await {
            return self
                .respond(outcome::attach_first(&get.id, &get.topic, ts), ts)
                .await;
        }
        let meta = MetaBuilder::new(&get.id, &get.topic, get.query.scope(), ts).build();
        self.respond(meta, ts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;

    async fn open(hub: &Arc<TopicHub>, user: &str) -> (Session, Outbound) {
        Session::open(hub.clone(), ProtocolConfig::default(), user).await
    }

    fn next(rx: &mut Outbound) -> Arc<ServerMessage> {
        rx.try_recv().expect("expected a message")
    }

    fn ctrl_code(msg: &ServerMessage) -> u16 {
        match msg {
            ServerMessage::Ctrl(ctrl) => ctrl.code,
            other => panic!("expected ctrl, got {}", other.kind()),
        }
    }

    #[test]
    fn test_subscriber_mode() {
        assert_eq!(SUBSCRIBER_MODE.to_string(), "JRWPS");
    }

    #[tokio::test]
    async fn test_hi_version() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;

        session.handle(br#"{"hi":{"id":"1","ver":"0.16"}}"#).await.unwrap();
        let reply = next(&mut rx);
        let ServerMessage::Ctrl(ctrl) = reply.as_ref() else {
            panic!("expected ctrl");
        };
        assert_eq!(ctrl.code, 201);
        assert_eq!(ctrl.params.as_ref().unwrap()["sid"], session.sid());

        session.handle(br#"{"hi":{"id":"2","ver":"0.1"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 505);
    }

    #[tokio::test]
    async fn test_malformed_echoes_id() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;
        session.handle(br#"{"sub":{"id":"7"}}"#).await.unwrap();
        let reply = next(&mut rx);
        let ServerMessage::Ctrl(ctrl) = reply.as_ref() else {
            panic!("expected ctrl");
        };
        assert_eq!(ctrl.code, 400);
        assert_eq!(ctrl.id, "7");
    }

    #[tokio::test]
    async fn test_sub_twice_and_leave_unjoined() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;
        session.handle(br#"{"sub":{"id":"1","topic":"grp1"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 200);
        session.handle(br#"{"sub":{"id":"2","topic":"grp1"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 304);
        session.handle(br#"{"leave":{"id":"3","topic":"grp2"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 304);
    }

    #[tokio::test]
    async fn test_sub_topic_full() {
        let hub = Arc::new(TopicHub::new(HubConfig {
            max_subscribers_per_topic: 1,
            ..HubConfig::default()
        }));
        let (a, _ra) = open(&hub, "usr1").await;
        let (b, mut rb) = open(&hub, "usr2").await;
        a.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        b.handle(br#"{"sub":{"id":"9","topic":"grp1"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rb)), 422);
    }

    #[tokio::test]
    async fn test_sub_with_get_sends_meta() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;
        session
            .handle(br#"{"sub":{"id":"1","topic":"grp1","get":{"what":"desc"}}}"#)
            .await
            .unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 200);
        assert_eq!(next(&mut rx).kind(), "meta");
    }

    #[tokio::test]
    async fn test_pub_requires_attach() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;
        session.handle(br#"{"pub":{"id":"1","topic":"grp1","content":"x"}}"#).await.unwrap();
        assert_eq!(ctrl_code(&next(&mut rx)), 409);
    }

    #[tokio::test]
    async fn test_unimplemented_verbs() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (session, mut rx) = open(&hub, "usr1").await;
        for json in [
            r#"{"login":{"id":"1","scheme":"basic"}}"#,
            r#"{"acc":{"id":"2","user":"new"}}"#,
            r#"{"set":{"id":"3","topic":"grp1","desc":{"public":"x"}}}"#,
            r#"{"del":{"id":"4","topic":"grp1","what":"topic"}}"#,
        ] {
            session.handle(json.as_bytes()).await.unwrap();
            assert_eq!(ctrl_code(&next(&mut rx)), 501, "{json}");
        }
    }

    #[tokio::test]
    async fn test_close_announces_off() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (a, _ra) = open(&hub, "usr1").await;
        let (b, mut rb) = open(&hub, "usr2").await;
        b.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        a.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        while rb.try_recv().is_ok() {}

        a.close().await;
        let msg = next(&mut rb);
        let ServerMessage::Pres(pres) = msg.as_ref() else {
            panic!("expected pres");
        };
        assert_eq!(pres.what, PresWhat::Off);
        assert_eq!(pres.src, "usr1");
        assert_eq!(hub.members("grp1").await, vec![b.sid().to_string()]);
    }

    #[tokio::test]
    async fn test_leave_announced_when_reply_fails() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (alice, mut alice_rx) = open(&hub, "usr1").await;
        let (bob, bob_rx) = open(&hub, "usr2").await;
        alice.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        bob.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        while alice_rx.try_recv().is_ok() {}
        drop(bob_rx);

        let result = bob.handle(br#"{"leave":{"id":"1","topic":"grp1"}}"#).await;
        assert!(matches!(result, Err(HubError::ChannelClosed(_))));
        assert!(!hub.is_attached(bob.sid(), "grp1").await);

        let msg = next(&mut alice_rx);
        let ServerMessage::Pres(pres) = msg.as_ref() else {
            panic!("expected pres");
        };
        assert_eq!((pres.src.as_str(), pres.what), ("usr2", PresWhat::Off));
    }

    #[tokio::test]
    async fn test_sub_announced_when_reply_fails() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (alice, mut alice_rx) = open(&hub, "usr1").await;
        let (bob, bob_rx) = open(&hub, "usr2").await;
        alice.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        while alice_rx.try_recv().is_ok() {}
        drop(bob_rx);

        let result = bob.handle(br#"{"sub":{"id":"1","topic":"grp1"}}"#).await;
        assert!(matches!(result, Err(HubError::ChannelClosed(_))));

        let msg = next(&mut alice_rx);
        let ServerMessage::Pres(pres) = msg.as_ref() else {
            panic!("expected pres");
        };
        assert_eq!((pres.src.as_str(), pres.what), ("usr2", PresWhat::On));
    }

    #[tokio::test]
    async fn test_sub_learns_existing_subscribers() {
        let hub = Arc::new(TopicHub::with_defaults());
        let (alice, _alice_rx) = open(&hub, "usr1").await;
        let (bob, mut bob_rx) = open(&hub, "usr2").await;
        alice.handle(br#"{"sub":{"topic":"grp1"}}"#).await.unwrap();
        bob.handle(br#"{"sub":{"id":"1","topic":"grp1"}}"#).await.unwrap();

        assert_eq!(ctrl_code(&next(&mut bob_rx)), 200);
        let msg = next(&mut bob_rx);
        let ServerMessage::Pres(pres) = msg.as_ref() else {
            panic!("expected pres");
        };
        assert_eq!((pres.src.as_str(), pres.what), ("usr1", PresWhat::On));
        assert!(bob_rx.try_recv().is_err());
    }
}
