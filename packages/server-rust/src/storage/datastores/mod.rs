//! Storage backends.
//!
//! Each backend implements [`PubSubStore`](crate::storage::PubSubStore),
//! [`UidProvider`](crate::sequence::UidProvider), and
//! [`PropertiesProvider`](crate::properties::PropertiesProvider) over one
//! shared store. [`MemoryStore`] is always available; [`RedbStore`] and
//! [`PostgresStore`] sit behind the `redb` and `postgres` features.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redb")]
mod redb;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "redb")]
pub use self::redb::RedbStore;
