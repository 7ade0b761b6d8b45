//! Record types stored in the Block Index

use serde::{Deserialize, Serialize};

/// A `nodes` row: cache identity keyed by the target inode number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
	pub last_use: i64,
}

/// A `paths` row: a mount-relative path bound to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathRecord {
	pub node_id: u64,
}

/// A `blocks` row: a half-open byte extent of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRecord {
	pub end: u64,
	pub last_block: bool,
}

/// A materialized block, carrying its offset alongside the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
	pub offset: u64,
	pub end: u64,
	pub last_block: bool,
}

impl Block {
	pub fn len(&self) -> u64 {
		self.end - self.offset
	}

	pub fn is_empty(&self) -> bool {
		self.end <= self.offset
	}
}

/// One group returned by `lru_victims_excluding`: a node's total cached
/// bytes and its last-use time, for eviction ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUsage {
	pub node_id: u64,
	pub size: u64,
	pub last_use: i64,
}
