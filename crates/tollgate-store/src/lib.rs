//! Durable record store for tollgate.
//!
//! Runtime relay reads go through in-memory snapshots and the short-TTL
//! caches in [`cache`]; the [`Store`] trait is the durable source of truth
//! consulted for ledger writes, token resolution, and log appends.

pub mod cache;
pub mod entities;
pub mod mem;
pub mod orm;
pub mod rows;
pub mod store;

pub use cache::{QuotaCache, UserStatusCache};
pub use mem::MemStore;
pub use orm::OrmStore;
pub use rows::{ChannelRow, ConsumeLogEntry, Role, TokenRow, UserRow};
pub use store::{SharedStore, Store, StoreError, StoreResult};
