//! Closed table of request outcomes and the `{ctrl}` builders over it.
//!
//! Callers pick an outcome by name; code and text come from the table, so
//! the two can never drift apart on the wire.
//!
//! | Class    | Codes | Effect                                        |
//! |----------|-------|-----------------------------------------------|
//! | Success  | 2xx   | request applied                               |
//! | Teardown | 205   | topic attachment or session ends; sent last   |
//! | Info     | 304   | nothing changed                               |
//! | Client   | 4xx   | request rejected, session continues           |
//! | Server   | 5xx   | infrastructure failure, above 500 retryable   |

use chrono::{DateTime, Utc};

use crate::server::{Ctrl, ServerMessage};

/// Coarse grouping of outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Success,
    Teardown,
    Info,
    ClientError,
    ServerError,
}

/// Every result a request can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ok,
    Created,
    Accepted,
    Evicted,
    ServerShutdown,
    AlreadySubscribed,
    NotJoined,
    NoAction,
    NotModified,
    Malformed,
    AuthRequired,
    AuthFailed,
    UnknownAuthScheme,
    PermissionDenied,
    TopicNotFound,
    UserNotFound,
    AlreadyAuthenticated,
    DuplicateCredential,
    AttachFirst,
    AlreadyExists,
    CommandOutOfSequence,
    Gone,
    PolicyViolation,
    Locked,
    InternalError,
    NotImplemented,
    ClusterNodeUnreachable,
    VersionNotSupported,
}

impl Outcome {
    pub const ALL: [Outcome; 28] = [
        Outcome::Ok,
        Outcome::Created,
        Outcome::Accepted,
        Outcome::Evicted,
        Outcome::ServerShutdown,
        Outcome::AlreadySubscribed,
        Outcome::NotJoined,
        Outcome::NoAction,
        Outcome::NotModified,
        Outcome::Malformed,
        Outcome::AuthRequired,
        Outcome::AuthFailed,
        Outcome::UnknownAuthScheme,
        Outcome::PermissionDenied,
        Outcome::TopicNotFound,
        Outcome::UserNotFound,
        Outcome::AlreadyAuthenticated,
        Outcome::DuplicateCredential,
        Outcome::AttachFirst,
        Outcome::AlreadyExists,
        Outcome::CommandOutOfSequence,
        Outcome::Gone,
        Outcome::PolicyViolation,
        Outcome::Locked,
        Outcome::InternalError,
        Outcome::NotImplemented,
        Outcome::ClusterNodeUnreachable,
        Outcome::VersionNotSupported,
    ];

    /// Numeric code and wire text.
    pub const fn entry(self) -> (u16, &'static str) {
        match self {
            Outcome::Ok => (200, "ok"),
            Outcome::Created => (201, "created"),
            Outcome::Accepted => (202, "accepted"),
            Outcome::Evicted => (205, "evicted"),
            Outcome::ServerShutdown => (205, "server shutdown"),
            Outcome::AlreadySubscribed => (304, "already subscribed"),
            Outcome::NotJoined => (304, "not joined"),
            Outcome::NoAction => (304, "no action"),
            Outcome::NotModified => (304, "not modified"),
            Outcome::Malformed => (400, "malformed"),
            Outcome::AuthRequired => (401, "authentication required"),
            Outcome::AuthFailed => (401, "authentication failed"),
            Outcome::UnknownAuthScheme => (401, "unknown authentication scheme"),
            Outcome::PermissionDenied => (403, "permission denied"),
            Outcome::TopicNotFound => (404, "topic not found"),
            Outcome::UserNotFound => (404, "user not found or offline"),
            Outcome::AlreadyAuthenticated => (409, "already authenticated"),
            Outcome::DuplicateCredential => (409, "duplicate credential"),
            Outcome::AttachFirst => (409, "must attach first"),
            Outcome::AlreadyExists => (409, "already exists"),
            Outcome::CommandOutOfSequence => (409, "command out of sequence"),
            Outcome::Gone => (410, "gone"),
            Outcome::PolicyViolation => (422, "policy violation"),
            Outcome::Locked => (423, "locked"),
            Outcome::InternalError => (500, "internal error"),
            Outcome::NotImplemented => (501, "not implemented"),
            Outcome::ClusterNodeUnreachable => (502, "unreachable"),
            Outcome::VersionNotSupported => (505, "version not supported"),
        }
    }

    pub const fn code(self) -> u16 {
        self.entry().0
    }

    pub const fn text(self) -> &'static str {
        self.entry().1
    }

    pub const fn class(self) -> OutcomeClass {
        match self.code() {
            205 => OutcomeClass::Teardown,
            200..=299 => OutcomeClass::Success,
            300..=399 => OutcomeClass::Info,
            400..=499 => OutcomeClass::ClientError,
            _ => OutcomeClass::ServerError,
        }
    }

    /// Infrastructure failures the caller may retry.
    pub const fn is_retryable(self) -> bool {
        self.code() > 500
    }

    /// Evicted / shutdown: nothing may follow on the affected context.
    pub const fn ends_context(self) -> bool {
        matches!(self.class(), OutcomeClass::Teardown)
    }

    /// Reverse lookup from a received `{ctrl}`.
    pub fn from_wire(code: u16, text: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|o| o.code() == code && o.text() == text)
    }

    /// Build the `{ctrl}` envelope for this outcome.
    pub fn ctrl(self, id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
        let (code, text) = self.entry();
        ServerMessage::Ctrl(Ctrl {
            id: id.to_string(),
            topic: topic.to_string(),
            code,
            text: text.to_string(),
            ts,
            params: None,
        })
    }
}

macro_rules! outcome_builders {
    ($($(#[$meta:meta])* $name:ident => $outcome:ident;)*) => {
        $(
            $(#[$meta])*
            pub fn $name(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
                Outcome::$outcome.ctrl(id, topic, ts)
            }
        )*
    };
}

outcome_builders! {
    /// 200
    ok => Ok;
    /// 201
    created => Created;
    /// 202
    accepted => Accepted;
    /// 205, topic attachment terminated.
    evicted => Evicted;
    /// 205, session terminated.
    server_shutdown => ServerShutdown;
    already_subscribed => AlreadySubscribed;
    not_joined => NotJoined;
    no_action => NoAction;
    not_modified => NotModified;
    /// 400
    malformed => Malformed;
    auth_required => AuthRequired;
    auth_failed => AuthFailed;
    unknown_auth_scheme => UnknownAuthScheme;
    /// 403
    permission_denied => PermissionDenied;
    topic_not_found => TopicNotFound;
    user_not_found => UserNotFound;
    already_authenticated => AlreadyAuthenticated;
    duplicate_credential => DuplicateCredential;
    /// 409, the session must `{sub}` before using the topic.
    attach_first => AttachFirst;
    already_exists => AlreadyExists;
    command_out_of_sequence => CommandOutOfSequence;
    /// 410
    gone => Gone;
    /// 422
    policy_violation => PolicyViolation;
    /// 423
    locked => Locked;
    /// 500
    internal_error => InternalError;
    /// 501
    not_implemented => NotImplemented;
    /// 502, a cluster peer could not be reached.
    cluster_node_unreachable => ClusterNodeUnreachable;
    /// 505
    version_not_supported => VersionNotSupported;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ts() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn expect_ctrl(msg: ServerMessage) -> Ctrl {
        match msg {
            ServerMessage::Ctrl(ctrl) => ctrl,
            other => panic!("expected ctrl, got {other:?}"),
        }
    }

    #[test]
    fn test_builders_match_table() {
        type Builder = fn(&str, &str, DateTime<Utc>) -> ServerMessage;
        let cases: [(Builder, u16, &str); 28] = [
            (ok, 200, "ok"),
            (created, 201, "created"),
            (accepted, 202, "accepted"),
            (evicted, 205, "evicted"),
            (server_shutdown, 205, "server shutdown"),
            (already_subscribed, 304, "already subscribed"),
            (not_joined, 304, "not joined"),
            (no_action, 304, "no action"),
            (not_modified, 304, "not modified"),
            (malformed, 400, "malformed"),
            (auth_required, 401, "authentication required"),
            (auth_failed, 401, "authentication failed"),
            (unknown_auth_scheme, 401, "unknown authentication scheme"),
            (permission_denied, 403, "permission denied"),
            (topic_not_found, 404, "topic not found"),
            (user_not_found, 404, "user not found or offline"),
            (already_authenticated, 409, "already authenticated"),
            (duplicate_credential, 409, "duplicate credential"),
            (attach_first, 409, "must attach first"),
            (already_exists, 409, "already exists"),
            (command_out_of_sequence, 409, "command out of sequence"),
            (gone, 410, "gone"),
            (policy_violation, 422, "policy violation"),
            (locked, 423, "locked"),
            (internal_error, 500, "internal error"),
            (not_implemented, 501, "not implemented"),
            (cluster_node_unreachable, 502, "unreachable"),
            (version_not_supported, 505, "version not supported"),
        ];
        assert_eq!(cases.len(), Outcome::ALL.len());

        for (build, code, text) in cases {
            let ctrl = expect_ctrl(build("42", "grp1", ts()));
            assert_eq!(ctrl.code, code);
            assert_eq!(ctrl.text, text);
            assert_eq!(ctrl.id, "42");
            assert_eq!(ctrl.topic, "grp1");
            assert_eq!(ctrl.ts, ts());
            assert!(ctrl.params.is_none());
        }
    }

    #[test]
    fn test_table_entries_unique() {
        let entries: HashSet<_> = Outcome::ALL.iter().map(|o| o.entry()).collect();
        assert_eq!(entries.len(), Outcome::ALL.len());
    }

    #[test]
    fn test_from_wire_roundtrip() {
        for outcome in Outcome::ALL {
            assert_eq!(Outcome::from_wire(outcome.code(), outcome.text()), Some(outcome));
        }
        assert_eq!(Outcome::from_wire(200, "fine"), None);
    }

    #[test]
    fn test_classes() {
        assert_eq!(Outcome::Ok.class(), OutcomeClass::Success);
        assert_eq!(Outcome::Evicted.class(), OutcomeClass::Teardown);
        assert_eq!(Outcome::ServerShutdown.class(), OutcomeClass::Teardown);
        assert_eq!(Outcome::NoAction.class(), OutcomeClass::Info);
        assert_eq!(Outcome::Locked.class(), OutcomeClass::ClientError);
        assert_eq!(Outcome::InternalError.class(), OutcomeClass::ServerError);
    }

    #[test]
    fn test_retryable_above_500() {
        let retryable: Vec<_> = Outcome::ALL.iter().filter(|o| o.is_retryable()).collect();
        assert_eq!(
            retryable,
            vec![
                &Outcome::NotImplemented,
                &Outcome::ClusterNodeUnreachable,
                &Outcome::VersionNotSupported
            ]
        );
        assert!(!Outcome::InternalError.is_retryable());
        assert!(!Outcome::Malformed.is_retryable());
    }

    #[test]
    fn test_teardown_ends_context() {
        assert!(Outcome::Evicted.ends_context());
        assert!(Outcome::ServerShutdown.ends_context());
        assert!(!Outcome::Ok.ends_context());
    }

    #[test]
    fn test_ctrl_wire_shape() {
        let msg = ok("5", "grp1", ts());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ctrl": {
                    "id": "5",
                    "topic": "grp1",
                    "code": 200,
                    "text": "ok",
                    "ts": "2024-01-01T00:00:00Z"
                }
            })
        );
    }

    #[test]
    fn test_connection_scope_omits_topic() {
        let msg = server_shutdown("", "", ts());
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["ctrl"].get("topic").is_none());
        assert!(json["ctrl"].get("id").is_none());
        assert_eq!(json["ctrl"]["code"], 205);
    }
}
