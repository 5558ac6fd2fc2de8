//! # Bandtrack Core Library
//!
//! Group-scoped authorization and item lifecycle for band rehearsal tracking:
//! - Identity store, group registry and membership ledger
//! - Access control resolved from the ledger on every call
//! - Repeatable vote ledger behind suggestion ranking
//! - Suggestion / rehearsal / performance lifecycle
//! - Group agenda of rehearsal events and performances
//! - Per-member annotation merge on rehearsals
//! - Database bootstrap, schema sync and migrations
//! - Root folder and TOML configuration
//!
//! Every operation takes the `SqlitePool` explicitly, plus an [`access::Actor`]
//! naming the acting user and their selected group.

pub mod access;
pub mod agenda;
pub mod annotations;
pub mod config;
pub mod db;
pub mod error;
pub mod groups;
pub mod identity;
pub mod lifecycle;
pub mod membership;
pub mod performances;
pub mod rehearsals;
pub mod settings;
pub mod suggestions;
pub mod text;
pub mod time;
pub mod votes;

pub use access::{Actor, GroupAccess, GroupId, Role, UserId};
pub use error::{Error, ErrorKind, Result};
