//! # parley-wire: Wire envelopes for topic-based pub/sub messaging
//!
//! Typed client and server envelopes, the outcome table, scope parsers and
//! the routing metadata that travels next to every server message.
//!
//! ## Architecture
//!
//! ```text
//!  client bytes                                          client bytes
//!       │                                                     ▲
//!       ▼                                                     │
//! ┌──────────────┐    ┌─────────────┐    ┌────────────────┐   │
//! │ClientEnvelope│───►│   Session   │───►│ ServerEnvelope │   │
//! │ (one of ten) │    │  (dispatch) │    │ message + Route│   │
//! └──────────────┘    └──────┬──────┘    └───────┬────────┘   │
//!                            │ Outcome            │           │
//!                            │ MetaScope          ▼           │
//!                            │             ┌─────────────┐    │
//!                            └────────────►│  TopicHub   │────┘
//!                                          │  (fan-out)  │
//!                                          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`]: `{hi}`, `{acc}`, `{login}`, `{sub}`, `{leave}`, `{pub}`,
//!   `{get}`, `{set}`, `{del}`, `{note}`
//! - [`server`]: `{ctrl}`, `{data}`, `{meta}`, `{pres}`, `{info}`
//! - [`outcome`]: closed code/text table and `{ctrl}` builders
//! - [`scope`]: `what` parsers for get/set and del
//! - [`query`]: query and description sub-objects
//! - [`access`]: access mode letters
//! - [`routing`]: non-serialized delivery filters
//! - [`hub`]: topic membership and filtered fan-out
//! - [`session`]: per-connection request dispatcher
//! - [`config`]: protocol and hub settings

pub mod access;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod outcome;
pub mod query;
pub mod routing;
pub mod scope;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use access::{AccessBits, AccessMode, DefaultAccess};
pub use client::{
    Acc, ClientEnvelope, ClientMessage, Del, Get, Hi, Leave, Login, Note, NoteWhat, Pub, Set, Sub,
};
pub use config::{HubConfig, ProtocolConfig};
pub use error::{HubError, ProtocolError};
pub use hub::{HubStats, Outbound, TopicHub};
pub use outcome::{Outcome, OutcomeClass};
pub use query::{
    BrowseOpts, DelRange, FindQuery, GetOpts, GetQuery, LastSeen, SetDesc, SetQuery, SetSub,
    TopicDesc, TopicSub,
};
pub use routing::{PresenceFilter, Route, SessionView};
pub use scope::{parse_delete_scope, parse_meta_scope, DeleteScope, MetaScope};
pub use server::{
    Ctrl, Data, Info, InfoWhat, Meta, MetaBuilder, Pres, PresWhat, ServerEnvelope, ServerMessage,
};
pub use session::Session;
