//! Block Index: the persistent record of which byte ranges of which nodes
//! are present in the cache.
//!
//! Backed by `redb` rather than the SQLite store the cache overlay this was
//! ported from used; the schema is the same three tables (`nodes`, `paths`,
//! `blocks`), queried and mutated inside single write transactions so a
//! reader never observes a half-applied merge.

mod core;
mod error;
mod tables;
mod types;

pub use core::BlockIndex;
pub use error::{IndexError, IndexResult};
pub use types::{Block, NodeRecord, NodeUsage, PathRecord};
