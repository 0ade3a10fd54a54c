//! Scope parsers for `{get}`, `{set}` and `{del}` requests.
//!
//! `get.what` / `set.what` carry a space-separated list of topic-state
//! categories; `del.what` names exactly one delete target.
//!
//! ```text
//! "desc sub data"  ──► MetaScope::DESC | MetaScope::SUB | MetaScope::DATA
//! "topic"          ──► DeleteScope::TOPIC
//! ```

use bitflags::bitflags;

use crate::error::ProtocolError;

/// Maximum number of pieces considered in a meta scope string.
/// Anything past the seventh separator lands in the last piece unsplit.
pub const MAX_META_TOKENS: usize = 8;

bitflags! {
    /// Topic-state categories targeted by a `{get}` or `{set}` request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaScope: u8 {
        /// Topic description.
        const DESC = 1 << 0;
        /// Subscriptions.
        const SUB = 1 << 1;
        /// Data messages.
        const DATA = 1 << 2;
        /// Deleted message ranges.
        const DEL = 1 << 3;
    }
}

bitflags! {
    /// Target of a `{del}` request. Exactly one bit is set for valid input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeleteScope: u8 {
        const MSG = 1 << 0;
        const TOPIC = 1 << 1;
        const SUB = 1 << 2;
    }
}

impl MetaScope {
    /// Parse a space-separated scope list. Unknown tokens are ignored.
    pub fn parse(text: &str) -> Self {
        text.splitn(MAX_META_TOKENS, char::is_whitespace)
            .fold(MetaScope::empty(), |bits, token| {
                bits | match token {
                    "desc" => MetaScope::DESC,
                    "sub" => MetaScope::SUB,
                    "data" => MetaScope::DATA,
                    "del" => MetaScope::DEL,
                    _ => MetaScope::empty(),
                }
            })
    }

    /// Render back into the canonical wire form, e.g. `"desc sub"`.
    pub fn to_wire(self) -> String {
        let mut parts = Vec::with_capacity(4);
        if self.contains(MetaScope::DESC) {
            parts.push("desc");
        }
        if self.contains(MetaScope::SUB) {
            parts.push("sub");
        }
        if self.contains(MetaScope::DATA) {
            parts.push("data");
        }
        if self.contains(MetaScope::DEL) {
            parts.push("del");
        }
        parts.join(" ")
    }
}

impl DeleteScope {
    /// Permissive parse: `""` and `"msg"` select messages, unknown input
    /// yields the empty set.
    pub fn parse(text: &str) -> Self {
        match text {
            "" | "msg" => DeleteScope::MSG,
            "topic" => DeleteScope::TOPIC,
            "sub" => DeleteScope::SUB,
            _ => DeleteScope::empty(),
        }
    }

    /// Like [`DeleteScope::parse`] but rejects unrecognized input.
    pub fn parse_strict(text: &str) -> Result<Self, ProtocolError> {
        let scope = Self::parse(text);
        if scope.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "unknown delete target '{text}'"
            )));
        }
        Ok(scope)
    }
}

/// Parse `{get}.what` / `{set}.what`.
pub fn parse_meta_scope(text: &str) -> MetaScope {
    MetaScope::parse(text)
}

/// Parse `{del}.what`.
pub fn parse_delete_scope(text: &str) -> DeleteScope {
    DeleteScope::parse(text)
}
