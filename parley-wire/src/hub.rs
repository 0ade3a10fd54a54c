//! Topic membership and filtered fan-out over bounded per-session channels.
//!
//! ```text
//!                       ┌──────────── TopicHub ────────────┐
//! ServerEnvelope ──────►│ topics:   grp1 → {sid → mode}    │
//!   (message + route)   │ sessions: sid  → (user, tx)      │
//!                       └──┬──────────────┬────────────┬───┘
//!                 route.admits(candidate) for every member
//!                          ▼              ▼            ▼
//!                      session A      session B    session C
//!                    (mpsc, bounded)
//! ```
//!
//! Delivery never awaits: a session whose outbound channel is full misses
//! the message, which is counted in [`HubStats::messages_dropped`]. Every
//! recipient shares one `Arc<ServerMessage>`.
//!
//! Lock order is always `topics` before `sessions`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::access::AccessBits;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::routing::{PresenceFilter, Route, SessionView};
use crate::server::{Pres, PresWhat, ServerEnvelope, ServerMessage};

/// Receiving half of a session's outbound channel.
pub type Outbound = mpsc::Receiver<Arc<ServerMessage>>;

type Membership = HashMap<String, HashMap<String, AccessBits>>;

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
    pub active_topics: usize,
}

/// Lock-free counters updated on the delivery path.
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct SessionEntry {
    user: String,
    tx: mpsc::Sender<Arc<ServerMessage>>,
}

/// A member of the recipient topic, as seen by the routing filters.
struct Candidate<'a> {
    sid: &'a str,
    user: &'a str,
    topics: &'a Membership,
}

impl SessionView for Candidate<'_> {
    fn sid(&self) -> &str {
        self.sid
    }

    fn user_id(&self) -> &str {
        self.user
    }

    fn mode_on(&self, topic: &str) -> AccessBits {
        self.topics
            .get(topic)
            .and_then(|members| members.get(self.sid))
            .copied()
            .unwrap_or_default()
    }

    fn is_attached(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.contains_key(self.sid))
    }
}

/// Sessions, topic membership and per-topic message ids.
pub struct TopicHub {
    config: HubConfig,
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    /// topic → session id → cumulative access mode
    topics: Arc<RwLock<Membership>>,
    /// topic → last assigned message id. Kept after the topic empties so
    /// ids are never reused while the hub lives.
    seqs: Arc<RwLock<HashMap<String, u64>>>,
    stats: Arc<AtomicHubStats>,
}

impl TopicHub {
    /// Create an empty hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
            seqs: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicHubStats::new()),
        }
    }

    /// Hub with [`HubConfig::default`] limits.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Limits this hub was created with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a session for `user`. Returns its id and outbound receiver.
    pub async fn connect(&self, user: &str) -> (String, Outbound) {
        let sid = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        self.sessions.write().await.insert(
            sid.clone(),
            SessionEntry {
                user: user.to_string(),
                tx,
            },
        );
        log::info!("Session {sid} connected as '{user}'");
        (sid, rx)
    }

    /// Remove a session and all its attachments. Returns the topics it was
    /// attached to.
    pub async fn disconnect(&self, sid: &str) -> Vec<String> {
        let mut left = Vec::new();
        {
            let mut topics = self.topics.write().await;
            topics.retain(|topic, members| {
                if members.remove(sid).is_some() {
                    left.push(topic.clone());
                }
                !members.is_empty()
            });
        }
        if self.sessions.write().await.remove(sid).is_some() {
            log::info!("Session {sid} disconnected ({} topics left)", left.len());
        }
        left.sort();
        left
    }

    /// User a connected session is authenticated as.
    pub async fn user_of(&self, sid: &str) -> Option<String> {
        self.sessions.read().await.get(sid).map(|s| s.user.clone())
    }

    /// Attach `sid` to `topic` with access `mode`. `Ok(false)` if it was
    /// already attached; the mode is updated either way.
    pub async fn attach(&self, sid: &str, topic: &str, mode: AccessBits) -> Result<bool, HubError> {
        let mut topics = self.topics.write().await;
        if !self.sessions.read().await.contains_key(sid) {
            return Err(HubError::UnknownSession(sid.to_string()));
        }
        let members = topics.entry(topic.to_string()).or_default();
        if let Some(current) = members.get_mut(sid) {
            *current = mode;
            return Ok(false);
        }
        let limit = self.config.max_subscribers_per_topic;
        if limit > 0 && members.len() >= limit {
            log::warn!("Topic {topic} full ({limit} subscribers), rejecting {sid}");
            return Err(HubError::TopicFull(topic.to_string()));
        }
        members.insert(sid.to_string(), mode);
        log::debug!("Session {sid} attached to {topic} with mode {mode}");
        Ok(true)
    }

    /// Returns whether `sid` was attached.
    pub async fn detach(&self, sid: &str, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(sid).is_some();
        if members.is_empty() {
            topics.remove(topic);
        }
        if removed {
            log::debug!("Session {sid} detached from {topic}");
        }
        removed
    }

    /// Whether `sid` is currently attached to `topic`.
    pub async fn is_attached(&self, sid: &str, topic: &str) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .is_some_and(|members| members.contains_key(sid))
    }

    /// Session ids attached to `topic`, sorted.
    pub async fn members(&self, topic: &str) -> Vec<String> {
        let mut sids: Vec<String> = self
            .topics
            .read()
            .await
            .get(topic)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        sids.sort();
        sids
    }

    /// Assign the next message id on `topic`, starting at 1. The counter
    /// survives the topic losing all its subscribers.
    pub async fn next_seq(&self, topic: &str) -> u64 {
        let mut seqs = self.seqs.write().await;
        let seq = seqs.entry(topic.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Deliver to every member of `route.rcpt_to` the route admits.
    /// Returns the number of sessions the message was queued for.
    ///
    /// A `{pres}` whose filter asks for a reply is answered once per
    /// reached user with a `pres on` from that user, addressed to the
    /// source user only. Answers never ask for a reply themselves.
    pub async fn dispatch(&self, envelope: &ServerEnvelope) -> usize {
        let route = &envelope.route;
        let topics = self.topics.read().await;
        let sessions = self.sessions.read().await;
        let (delivered, reached) =
            self.fan_out(&topics, &sessions, route, Arc::new(envelope.message.clone()));

        if let (ServerMessage::Pres(pres), Some(filter)) = (&envelope.message, &route.presence) {
            if filter.want_reply {
                for user in reached.iter().filter(|user| **user != pres.src) {
                    let answer = ServerEnvelope::presence(
                        Pres::new(&route.rcpt_to, user, PresWhat::On),
                        PresenceFilter::new().single_user(pres.src.as_str()),
                        route.timestamp,
                    );
                    self.fan_out(&topics, &sessions, &answer.route, Arc::new(answer.message.clone()));
                }
            }
        }
        delivered
    }

    /// Queue `message` for every member of `route.rcpt_to` the route admits.
    /// Returns the delivered count and the users it reached.
    fn fan_out(
        &self,
        topics: &Membership,
        sessions: &HashMap<String, SessionEntry>,
        route: &Route,
        message: Arc<ServerMessage>,
    ) -> (usize, BTreeSet<String>) {
        let mut reached = BTreeSet::new();
        let Some(members) = topics.get(&route.rcpt_to) else {
            log::debug!("No subscribers on {} for {}", route.rcpt_to, message.kind());
            return (0, reached);
        };

        let mut delivered = 0;
        for sid in members.keys() {
            let Some(entry) = sessions.get(sid) else {
                continue;
            };
            let candidate = Candidate {
                sid,
                user: &entry.user,
                topics,
            };
            if !route.admits(&candidate) {
                continue;
            }
            if self.deliver(sid, entry, message.clone()) {
                delivered += 1;
                reached.insert(entry.user.clone());
            }
        }
        log::trace!(
            "Dispatched {} on {} to {delivered} of {} sessions",
            message.kind(),
            route.rcpt_to,
            members.len()
        );
        (delivered, reached)
    }

    /// Send to the originating session of the route only. `Ok(false)` when
    /// the session's channel was full and the message dropped.
    pub async fn reply(&self, envelope: &ServerEnvelope) -> Result<bool, HubError> {
        let sid = envelope.route.sess_from.as_deref().unwrap_or_default();
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(sid)
            .ok_or_else(|| HubError::UnknownSession(sid.to_string()))?;
        if entry.tx.is_closed() {
            return Err(HubError::ChannelClosed(sid.to_string()));
        }
        Ok(self.deliver(sid, entry, Arc::new(envelope.message.clone())))
    }

    fn deliver(&self, sid: &str, entry: &SessionEntry, message: Arc<ServerMessage>) -> bool {
        match entry.tx.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Session {sid} outbound channel full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Session {sid} outbound channel closed");
                false
            }
        }
    }

    /// Counters plus current session and topic counts.
    pub async fn stats(&self) -> HubStats {
        let active_topics = self.topics.read().await.len();
        let active_sessions = self.sessions.read().await.len();
        HubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions,
            active_topics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome;
    use crate::server::now;

    fn rw() -> AccessBits {
        AccessBits::JOIN | AccessBits::READ | AccessBits::WRITE
    }

    fn pres_envelope(topic: &str, filter: PresenceFilter) -> ServerEnvelope {
        ServerEnvelope::presence(Pres::new(topic, "usr9", PresWhat::On), filter, now())
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let hub = TopicHub::with_defaults();
        let (sid, _rx) = hub.connect("usr1").await;
        assert_eq!(hub.user_of(&sid).await.as_deref(), Some("usr1"));
        hub.attach(&sid, "grp1", rw()).await.unwrap();
        hub.attach(&sid, "grp2", rw()).await.unwrap();

        let left = hub.disconnect(&sid).await;
        assert_eq!(left, vec!["grp1".to_string(), "grp2".to_string()]);
        let stats = hub.stats().await;
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.active_topics, 0);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let hub = TopicHub::with_defaults();
        let err = hub.attach("nope", "grp1", rw()).await.unwrap_err();
        assert_eq!(err, HubError::UnknownSession("nope".into()));
    }

    #[tokio::test]
    async fn test_attach_twice_and_detach() {
        let hub = TopicHub::with_defaults();
        let (sid, _rx) = hub.connect("usr1").await;
        assert!(hub.attach(&sid, "grp1", rw()).await.unwrap());
        assert!(!hub.attach(&sid, "grp1", rw()).await.unwrap());
        assert!(hub.is_attached(&sid, "grp1").await);
        assert!(hub.detach(&sid, "grp1").await);
        assert!(!hub.detach(&sid, "grp1").await);
        assert!(hub.members("grp1").await.is_empty());
    }

    #[tokio::test]
    async fn test_topic_full() {
        let hub = TopicHub::new(HubConfig {
            max_subscribers_per_topic: 1,
            ..HubConfig::default()
        });
        let (a, _ra) = hub.connect("usr1").await;
        let (b, _rb) = hub.connect("usr2").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();
        let err = hub.attach(&b, "grp1", rw()).await.unwrap_err();
        assert_eq!(err, HubError::TopicFull("grp1".into()));
        assert_eq!(hub.members("grp1").await, vec![a]);
    }

    #[tokio::test]
    async fn test_next_seq_per_topic() {
        let hub = TopicHub::with_defaults();
        assert_eq!(hub.next_seq("grp1").await, 1);
        assert_eq!(hub.next_seq("grp1").await, 2);
        assert_eq!(hub.next_seq("grp2").await, 1);
    }

    #[tokio::test]
    async fn test_next_seq_survives_empty_topic() {
        let hub = TopicHub::with_defaults();
        let (sid, _rx) = hub.connect("usr1").await;
        hub.attach(&sid, "grp1", rw()).await.unwrap();
        assert_eq!(hub.next_seq("grp1").await, 1);
        hub.detach(&sid, "grp1").await;
        assert_eq!(hub.stats().await.active_topics, 0);

        hub.attach(&sid, "grp1", rw()).await.unwrap();
        assert_eq!(hub.next_seq("grp1").await, 2);
    }

    #[tokio::test]
    async fn test_dispatch_to_members_only() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr1").await;
        let (_b, mut rb) = hub.connect("usr2").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();

        let env = ServerEnvelope::broadcast(outcome::ok("", "grp1", now()), now());
        assert_eq!(hub.dispatch(&env).await, 1);
        assert_eq!(ra.try_recv().unwrap().kind(), "ctrl");
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_skip_sid() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr1").await;
        let (b, mut rb) = hub.connect("usr2").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();
        hub.attach(&b, "grp1", rw()).await.unwrap();

        let env = ServerEnvelope::broadcast(outcome::ok("", "grp1", now()), now()).skip_session(&a);
        assert_eq!(hub.dispatch(&env).await, 1);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_presence_filters_anded() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr1").await;
        let (b, mut rb) = hub.connect("usr2").await;
        let (c, mut rc) = hub.connect("usr2").await;
        hub.attach(&a, "me", rw() | AccessBits::PRES).await.unwrap();
        hub.attach(&b, "me", rw() | AccessBits::PRES).await.unwrap();
        hub.attach(&c, "me", rw()).await.unwrap();

        let filter = PresenceFilter::new()
            .with_filter(AccessBits::PRES)
            .single_user("usr2");
        assert_eq!(hub.dispatch(&pres_envelope("me", filter)).await, 1);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
        assert!(rc.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_skip_topic() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr1").await;
        let (b, mut rb) = hub.connect("usr1").await;
        hub.attach(&a, "me", rw()).await.unwrap();
        hub.attach(&b, "me", rw()).await.unwrap();
        hub.attach(&a, "grp1", rw()).await.unwrap();

        let filter = PresenceFilter::new().skip_topic("grp1");
        assert_eq!(hub.dispatch(&pres_envelope("me", filter)).await, 1);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let hub = TopicHub::new(HubConfig {
            outbound_capacity: 2,
            ..HubConfig::default()
        });
        let (a, mut ra) = hub.connect("usr1").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();

        let env = ServerEnvelope::broadcast(outcome::ok("", "grp1", now()), now());
        for _ in 0..5 {
            hub.dispatch(&env).await;
        }
        let stats = hub.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);

        let mut received = 0;
        while ra.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn test_reply_targets_originating_session() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr1").await;
        let (b, mut rb) = hub.connect("usr2").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();
        hub.attach(&b, "grp1", rw()).await.unwrap();

        let env = ServerEnvelope::reply(outcome::ok("1", "grp1", now()), &b, now());
        assert!(hub.reply(&env).await.unwrap());
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reply_errors() {
        let hub = TopicHub::with_defaults();
        let env = ServerEnvelope::reply(outcome::ok("1", "", now()), "ghost", now());
        assert!(matches!(hub.reply(&env).await, Err(HubError::UnknownSession(_))));

        let (a, ra) = hub.connect("usr1").await;
        drop(ra);
        let env = ServerEnvelope::reply(outcome::ok("1", "", now()), &a, now());
        assert_eq!(hub.reply(&env).await, Err(HubError::ChannelClosed(a.clone())));
    }

    #[tokio::test]
    async fn test_want_reply_answered_once_per_user() {
        let hub = TopicHub::with_defaults();
        let pres = rw() | AccessBits::PRES;
        let (a, mut ra) = hub.connect("usr9").await;
        let (b, mut rb) = hub.connect("usr2").await;
        let (c, mut rc) = hub.connect("usr3").await;
        let (c2, mut rc2) = hub.connect("usr3").await;
        for sid in [&a, &b, &c, &c2] {
            hub.attach(sid, "grp1", pres).await.unwrap();
        }

        let filter = PresenceFilter::new().want_reply().with_filter(AccessBits::PRES);
        let env = pres_envelope("grp1", filter).skip_session(&a);
        assert_eq!(hub.dispatch(&env).await, 3);

        let mut answers: Vec<String> = std::iter::from_fn(|| ra.try_recv().ok())
            .map(|msg| match msg.as_ref() {
                ServerMessage::Pres(p) => {
                    assert_eq!(p.what, PresWhat::On);
                    p.src.clone()
                }
                other => panic!("expected pres, got {}", other.kind()),
            })
            .collect();
        answers.sort();
        assert_eq!(answers, vec!["usr2".to_string(), "usr3".to_string()]);

        for rx in [&mut rb, &mut rc, &mut rc2] {
            assert!(rx.try_recv().is_ok());
            assert!(rx.try_recv().is_err(), "answers must not loop back");
        }
    }

    #[tokio::test]
    async fn test_no_answer_without_want_reply() {
        let hub = TopicHub::with_defaults();
        let (a, mut ra) = hub.connect("usr9").await;
        let (b, _rb) = hub.connect("usr2").await;
        hub.attach(&a, "grp1", rw()).await.unwrap();
        hub.attach(&b, "grp1", rw()).await.unwrap();

        let env = pres_envelope("grp1", PresenceFilter::new()).skip_session(&a);
        assert_eq!(hub.dispatch(&env).await, 1);
        assert!(ra.try_recv().is_err());
    }
}
