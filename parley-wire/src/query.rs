//! Query sub-objects embedded in client requests and meta responses.
//!
//! These are the building blocks of `{sub}`, `{get}`, `{set}`, `{del}` and
//! of the `desc` / `sub` / `del` blocks of a `{meta}` reply. Zero values and
//! absent options are never written to the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::{AccessMode, DefaultAccess};
use crate::scope::MetaScope;

pub(crate) fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

pub(crate) fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

pub(crate) fn is_false(v: &bool) -> bool {
    !*v
}

/// Browse range for `data` and `del` queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseOpts {
    /// Load ids greater than or equal to this.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub since: u64,
    /// Load ids lower than this.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub before: u64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub limit: u32,
}

impl BrowseOpts {
    /// Whether `seq` falls inside the requested window.
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.since && (self.before == 0 || seq < self.before)
    }
}

/// Options of `desc` and `sub` queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOpts {
    /// If-modified-since.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ims: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub limit: u32,
}

impl GetOpts {
    /// True when an object last updated at `updated` must be reported.
    pub fn wants(&self, updated: DateTime<Utc>) -> bool {
        self.ims.map_or(true, |ims| updated > ims)
    }
}

/// Body of `{get}` and of `sub.get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetQuery {
    /// Space-separated scope list, see [`MetaScope::parse`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub what: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<GetOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<GetOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BrowseOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<BrowseOpts>,
}

impl GetQuery {
    /// Scope requested by `what`.
    pub fn scope(&self) -> MetaScope {
        MetaScope::parse(&self.what)
    }
}

/// `set.sub`: update own subscription or invite another user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSub {
    /// Affected user. Empty means the current user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Access mode change: `want` for self, `given` for others.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

/// `set.desc`, `sub.set.desc` and `acc.desc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    /// Per-subscription private data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Body of `{set}` and of `sub.set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<SetSub>,
}

impl SetQuery {
    /// Scope implied by the blocks present.
    pub fn scope(&self) -> MetaScope {
        let mut scope = MetaScope::empty();
        if self.desc.is_some() {
            scope |= MetaScope::DESC;
        }
        if self.sub.is_some() {
            scope |= MetaScope::SUB;
        }
        scope
    }
}

/// Private payload of a `fnd` topic: discovery tags such as
/// `"email:alice@example.com"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single deleted id or a `[low, hi)` range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelRange {
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub low: u64,
    /// Exclusive upper bound; zero means "to the end".
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub hi: u64,
}

impl DelRange {
    /// A single deleted id.
    pub fn single(seq: u64) -> Self {
        Self {
            seq,
            ..Self::default()
        }
    }

    /// Ids from `low` up to, not including, `hi`.
    pub fn range(low: u64, hi: u64) -> Self {
        Self {
            low,
            hi,
            ..Self::default()
        }
    }

    /// Either a lone `seq`, or `low` with an empty or greater `hi`.
    pub fn is_valid(&self) -> bool {
        if self.seq > 0 {
            return self.low == 0 && self.hi == 0;
        }
        self.low > 0 && (self.hi == 0 || self.hi > self.low)
    }

    /// Whether `id` falls inside this range.
    pub fn contains(&self, id: u64) -> bool {
        if self.seq > 0 {
            return id == self.seq;
        }
        id >= self.low && (self.hi == 0 || id < self.hi)
    }
}

/// When a user was last online, and from which client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeen {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
}

/// Topic description sent in `meta.desc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    /// Client-assigned name a new group topic had before the server renamed it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tmpname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessMode>,
    /// Highest message id assigned.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub read: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub recv: u64,
    /// Id of the latest delete operation.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub del: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Subscription description sent in `meta.sub`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSub {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub online: bool,
    /// Always present. Admins get the full triple, others only `mode`.
    #[serde(default)]
    pub acs: AccessMode,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub read: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub recv: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,

    /// Subscriber's user id (replies about a regular topic).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    // Replies about the user's own subscriptions only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub clear: u64,

    /// Peer's last appearance, p2p topics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<LastSeen>,
}
