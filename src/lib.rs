//! Embeddable ordered key/value store with secondary and spatial indexes,
//! TTL expiration, and append-only persistence.
//!
//! ```rust
//! use atoll::{Db, SetOptions, index_binary};
//! use std::time::Duration;
//!
//! let db = Db::memory()?;
//! db.update(|tx| {
//!     tx.set("user:1", "carol", None)?;
//!     tx.set("session:1", "s", Some(SetOptions::with_ttl(Duration::from_secs(60))))?;
//!     Ok(())
//! })?;
//!
//! db.create_index("names", "user:*", vec![index_binary()])?;
//! db.view(|tx| {
//!     tx.ascend("names", |key, value| {
//!         println!("{:?} = {:?}", key, value);
//!         true
//!     })
//! })?;
//! # Ok::<(), atoll::AtollError>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod item;
pub mod pattern;
pub mod spatial;
pub mod tx;

mod ordered;
mod persistence;

pub use config::{
    Config, IndexOptions, OnExpired, OnExpiredSync, SetOptions, SyncMode, SyncPolicy, TimeSource,
};
pub use db::{Db, DbBuilder};
pub use error::{AtollError, Result};
pub use index::{
    RectFn, desc, index_binary, index_float, index_int, index_json, index_json_case_sensitive,
    index_rect, index_string, index_uint,
};
pub use item::Item;
pub use ordered::LessFn;
pub use spatial::Rect;
pub use tx::Tx;

pub type Atoll = Db;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{Atoll, Db, DbBuilder, Result};

    pub use crate::{AtollError, Config, IndexOptions, SetOptions, SyncPolicy, Tx};

    pub use crate::{
        desc, index_binary, index_float, index_int, index_json, index_rect, index_string,
        index_uint,
    };

    pub use crate::Rect;

    pub use std::time::Duration;
}
