//! Catalog data model
//!
//! Rows as stored ([`Entity`], [`Connection`], [`Mention`]), the validated
//! drafts handed to the store ([`NewEntity`], [`NewConnection`],
//! [`NewMention`]) and the query/filter payloads.

pub mod connection;
pub mod entity;
pub mod mention;

pub use connection::{
    ActivityLevel, Connection, ConnectionFields, ConnectionFilter, ConnectionMetrics,
    ConnectionPatch, NewConnection, TopMention,
};
pub use entity::{
    Entity, EntityCursor, EntityFields, EntityQuery, EntityType, NameMatch, NewEntity,
};
pub use mention::{Mention, MentionFilter, MentionSource, NewMention};
