//! Typed accessors over the catalog store
//!
//! Both accessors borrow any [`crate::store::CatalogOps`] implementor, so the
//! same code runs against a store or inside a transaction handle.

pub mod base;
pub mod connection;
pub mod entity;

pub use base::Record;
pub use connection::ConnectionRepository;
pub use entity::EntityRepository;
