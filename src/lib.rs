//! EmberDB is an embedded, in-memory key/value database with optional
//! durability through an append-only command log. It offers single-writer
//! / many-reader transactions, per-key TTL expiry, and secondary indexes
//! over keys matching a wildcard pattern, ordered by custom comparators or
//! by rectangles in an R-tree for spatial intersection queries.
//!
//! ```
//! use emberdb::Database;
//!
//! let db = Database::open(":memory:")?;
//! db.update(|tx| {
//!     tx.set("name", "ember", None)?;
//!     Ok(())
//! })?;
//! let value = db.view(|tx| tx.get("name"))?;
//! assert_eq!(value, "ember");
//! db.close()?;
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod pattern;
pub mod spatial;
pub mod tx;

mod aof;
mod item;
mod ordered;
mod scheduler;
mod tasks;

pub use config::{Config, SyncPolicy};
pub use db::Database;
pub use error::{Error, Result};
pub use index::{
    index_binary, index_float, index_int, index_string, index_uint, LessFn, RectFn,
};
pub use item::SetOptions;
pub use pattern::wildcard_match;
pub use spatial::{index_rect, point_string, rect_string, Rect};
pub use tx::Tx;
