//! The Block Index: a redb-backed, transactional relational store of
//! `nodes`, `paths`, and `blocks` rows.
//!
//! Disjointness, the three-disjunct overlap predicate, and LRU ordering
//! are all maintained here; every other component treats this as the sole
//! source of truth for cache metadata.

use crate::index::error::{IndexError, IndexResult};
use crate::index::tables::{
	block_key, initialize_tables, node_key, split_block_key, BLOCKS_TABLE, NODES_TABLE,
	PATHS_TABLE,
};
use crate::index::types::{Block, BlockRecord, NodeRecord, NodeUsage, PathRecord};
use redb::{Database, Durability, ReadableTable};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle onto the persistent metadata index (`<cache>/metadata.db`).
///
/// Cheaply `Clone`-able: wraps an `Arc<redb::Database>`, exactly like the
/// multiple storage modules that share one redb handle in the teacher's
/// database layer.
#[derive(Clone)]
pub struct BlockIndex {
	database: Arc<Database>,
}

impl BlockIndex {
	/// `open_or_create` — initializes the schema if absent. Idempotent.
	pub fn open_or_create(cache_dir: &Path) -> IndexResult<Self> {
		std::fs::create_dir_all(cache_dir).map_err(|e| {
			IndexError::InitializationFailed(format!("creating cache dir: {e}"))
		})?;
		let db_path = cache_dir.join("metadata.db");
		let database = Database::create(&db_path)?;
		initialize_tables(&database)?;
		debug!(path = ?db_path, "opened block index");
		Ok(Self {
			database: Arc::new(database),
		})
	}

	fn begin_write_txn(&self) -> IndexResult<redb::WriteTransaction> {
		let mut txn = self.database.begin_write()?;
		// Durability tuned for speed, not crash safety: the cache is
		// reconstructible, so on corruption the correct recovery is to
		// discard it and remount. This is the redb analogue of SQLite's
		// `PRAGMA synchronous=OFF; PRAGMA journal_mode=OFF`.
		txn.set_durability(Durability::Eventual);
		Ok(txn)
	}

	/// `bind_open(node_id, path, now)` — upserts node with `last_use = now`
	/// and upserts path -> node_id. Returns the other paths already bound
	/// to node_id.
	pub fn bind_open(&self, node_id: u64, path: &str, now: i64) -> IndexResult<Vec<String>> {
		let write_txn = self.begin_write_txn()?;
		let other_paths = {
			let mut nodes = write_txn.open_table(NODES_TABLE)?;
			nodes.insert(
				&node_key(node_id)[..],
				bincode::serialize(&NodeRecord { last_use: now })?.as_slice(),
			)?;

			let mut paths = write_txn.open_table(PATHS_TABLE)?;
			paths.insert(
				path.as_bytes(),
				bincode::serialize(&PathRecord { node_id })?.as_slice(),
			)?;

			let mut others = Vec::new();
			for entry in paths.iter()? {
				let (key, value) = entry?;
				let candidate = std::str::from_utf8(key.value()).unwrap_or_default();
				if candidate == path {
					continue;
				}
				let record: PathRecord = bincode::deserialize(value.value())?;
				if record.node_id == node_id {
					others.push(candidate.to_string());
				}
			}
			others
		};
		write_txn.commit()?;
		Ok(other_paths)
	}

	/// `lookup_node_by_path(path)` — returns the bound node_id, if any.
	pub fn lookup_node_by_path(&self, path: &str) -> IndexResult<Option<u64>> {
		let read_txn = self.database.begin_read()?;
		let paths = read_txn.open_table(PATHS_TABLE)?;
		match paths.get(path.as_bytes())? {
			Some(bytes) => {
				let record: PathRecord = bincode::deserialize(bytes.value())?;
				Ok(Some(record.node_id))
			}
			None => Ok(None),
		}
	}

	/// `overlapping_block(node_id, offset)` — the unique block, if any,
	/// whose range contains `offset` (`offset <= query < end`).
	pub fn overlapping_block(&self, node_id: u64, offset: u64) -> IndexResult<Option<Block>> {
		let read_txn = self.database.begin_read()?;
		let blocks = read_txn.open_table(BLOCKS_TABLE)?;
		for entry in blocks.iter()? {
			let (key, value) = entry?;
			let (owner, block_offset) = split_block_key(key.value());
			if owner != node_id {
				continue;
			}
			let record: BlockRecord = bincode::deserialize(value.value())?;
			if block_offset <= offset && offset < record.end {
				return Ok(Some(Block {
					offset: block_offset,
					end: record.end,
					last_block: record.last_block,
				}));
			}
		}
		Ok(None)
	}

	/// `merge_and_insert(node_id, new_offset, new_end, last_block)` —
	/// atomically merges every block touching or overlapping
	/// `[new_offset, new_end)` into one maximal extent.
	pub fn merge_and_insert(
		&self,
		node_id: u64,
		new_offset: u64,
		new_end: u64,
		last_block: bool,
	) -> IndexResult<()> {
		let write_txn = self.begin_write_txn()?;
		{
			let mut blocks = write_txn.open_table(BLOCKS_TABLE)?;

			let mut min_offset = new_offset;
			let mut max_end = new_end;
			let mut touched_keys = Vec::new();

			for entry in blocks.iter()? {
				let (key, value) = entry?;
				let (owner, offset) = split_block_key(key.value());
				if owner != node_id {
					continue;
				}
				let record: BlockRecord = bincode::deserialize(value.value())?;

				// The three-disjunct overlap/touch predicate from the spec:
				// offset == new_offset, or new_offset < offset <= new_end,
				// or offset < new_offset <= end.
				let touches = offset == new_offset
					|| (new_offset < offset && offset <= new_end)
					|| (offset < new_offset && new_offset <= record.end);

				if touches {
					min_offset = min_offset.min(offset);
					max_end = max_end.max(record.end);
					touched_keys.push(block_key(node_id, offset));
				}
			}

			for key in &touched_keys {
				blocks.remove(&key[..])?;
			}

			blocks.insert(
				&block_key(node_id, min_offset)[..],
				bincode::serialize(&BlockRecord {
					end: max_end,
					last_block,
				})?
				.as_slice(),
			)?;
		}
		write_txn.commit()?;
		trace!(node_id, new_offset, new_end, last_block, "merged block");
		Ok(())
	}

	/// `total_bytes()` — sum of `(end - offset)` over all blocks.
	pub fn total_bytes(&self) -> IndexResult<u64> {
		let read_txn = self.database.begin_read()?;
		let blocks = read_txn.open_table(BLOCKS_TABLE)?;
		let mut total = 0u64;
		for entry in blocks.iter()? {
			let (key, value) = entry?;
			let (_, offset) = split_block_key(key.value());
			let record: BlockRecord = bincode::deserialize(value.value())?;
			total += record.end.saturating_sub(offset);
		}
		Ok(total)
	}

	/// `lru_victims_excluding(node_id)` — `(node_id, size, last_use)`
	/// groups, ordered by `last_use` ascending, excluding `node_id`.
	pub fn lru_victims_excluding(&self, node_id: u64) -> IndexResult<Vec<NodeUsage>> {
		let read_txn = self.database.begin_read()?;
		let blocks = read_txn.open_table(BLOCKS_TABLE)?;
		let nodes = read_txn.open_table(NODES_TABLE)?;

		let mut sizes: HashMap<u64, u64> = HashMap::new();
		for entry in blocks.iter()? {
			let (key, value) = entry?;
			let (owner, offset) = split_block_key(key.value());
			let record: BlockRecord = bincode::deserialize(value.value())?;
			*sizes.entry(owner).or_insert(0) += record.end.saturating_sub(offset);
		}

		let mut victims = Vec::new();
		for entry in nodes.iter()? {
			let (key, value) = entry?;
			let candidate = u64::from_be_bytes(key.value().try_into().unwrap());
			if candidate == node_id {
				continue;
			}
			let record: NodeRecord = bincode::deserialize(value.value())?;
			victims.push(NodeUsage {
				node_id: candidate,
				size: sizes.get(&candidate).copied().unwrap_or(0),
				last_use: record.last_use,
			});
		}
		victims.sort_by_key(|v| v.last_use);
		Ok(victims)
	}

	/// `truncate_node(node_id, len)` — delete blocks with `offset >= len`;
	/// clamp `end` to `len` for any block with `end > len`.
	pub fn truncate_node(&self, node_id: u64, len: u64) -> IndexResult<()> {
		let write_txn = self.begin_write_txn()?;
		{
			let mut blocks = write_txn.open_table(BLOCKS_TABLE)?;
			let mut to_delete = Vec::new();
			let mut to_clamp = Vec::new();

			for entry in blocks.iter()? {
				let (key, value) = entry?;
				let (owner, offset) = split_block_key(key.value());
				if owner != node_id {
					continue;
				}
				let record: BlockRecord = bincode::deserialize(value.value())?;
				if offset >= len {
					to_delete.push(block_key(node_id, offset));
				} else if record.end > len {
					to_clamp.push((offset, record));
				}
			}

			for key in &to_delete {
				blocks.remove(&key[..])?;
			}
			for (offset, mut record) in to_clamp {
				record.end = len;
				blocks.insert(
					&block_key(node_id, offset)[..],
					bincode::serialize(&record)?.as_slice(),
				)?;
			}
		}
		write_txn.commit()?;
		Ok(())
	}

	/// `drop_node(node_id)` — remove the node, all its paths, all its blocks.
	pub fn drop_node(&self, node_id: u64) -> IndexResult<()> {
		let write_txn = self.begin_write_txn()?;
		{
			let mut blocks = write_txn.open_table(BLOCKS_TABLE)?;
			let keys: Vec<[u8; 16]> = blocks
				.iter()?
				.filter_map(|e| e.ok())
				.map(|(k, _)| -> [u8; 16] { k.value().try_into().unwrap() })
				.filter(|k| split_block_key(k).0 == node_id)
				.collect();
			for key in keys {
				blocks.remove(&key[..])?;
			}

			let mut paths = write_txn.open_table(PATHS_TABLE)?;
			let stale: Vec<Vec<u8>> = paths
				.iter()?
				.filter_map(|e| e.ok())
				.filter(|(_, v)| {
					bincode::deserialize::<PathRecord>(v.value())
						.map(|r| r.node_id == node_id)
						.unwrap_or(false)
				})
				.map(|(k, _)| k.value().to_vec())
				.collect();
			for key in stale {
				paths.remove(key.as_slice())?;
			}

			let mut nodes = write_txn.open_table(NODES_TABLE)?;
			nodes.remove(&node_key(node_id)[..])?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Returns every path currently bound to `node_id`. Used by eviction to
	/// find the shadow files to remove before dropping the node.
	pub fn paths_for_node(&self, node_id: u64) -> IndexResult<Vec<String>> {
		let read_txn = self.database.begin_read()?;
		let paths = read_txn.open_table(PATHS_TABLE)?;
		let mut matches = Vec::new();
		for entry in paths.iter()? {
			let (key, value) = entry?;
			let record: PathRecord = bincode::deserialize(value.value())?;
			if record.node_id == node_id {
				matches.push(std::str::from_utf8(key.value()).unwrap_or_default().to_string());
			}
		}
		Ok(matches)
	}

	/// `drop_path(path)` — remove that path row; returns true iff the
	/// node it named has no remaining paths.
	pub fn drop_path(&self, path: &str) -> IndexResult<bool> {
		let write_txn = self.begin_write_txn()?;
		let droppable = {
			let mut paths = write_txn.open_table(PATHS_TABLE)?;
			let node_id = match paths.get(path.as_bytes())? {
				Some(bytes) => {
					let record: PathRecord = bincode::deserialize(bytes.value())?;
					Some(record.node_id)
				}
				None => None,
			};
			paths.remove(path.as_bytes())?;

			match node_id {
				Some(node_id) => {
					let remaining = paths
						.iter()?
						.filter_map(|e| e.ok())
						.filter(|(_, v)| {
							bincode::deserialize::<PathRecord>(v.value())
								.map(|r| r.node_id == node_id)
								.unwrap_or(false)
						})
						.count();
					remaining == 0
				}
				None => false,
			}
		};
		write_txn.commit()?;
		Ok(droppable)
	}

	/// `rename_path(old, new)` — redirect the path row; preserve the node
	/// binding.
	pub fn rename_path(&self, old: &str, new: &str) -> IndexResult<()> {
		let write_txn = self.begin_write_txn()?;
		{
			let mut paths = write_txn.open_table(PATHS_TABLE)?;
			let record = match paths.get(old.as_bytes())? {
				Some(bytes) => bincode::deserialize::<PathRecord>(bytes.value())?,
				None => return Err(IndexError::PathNotFound(old.to_string())),
			};
			paths.remove(old.as_bytes())?;
			paths.insert(new.as_bytes(), bincode::serialize(&record)?.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn new_index() -> (BlockIndex, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let index = BlockIndex::open_or_create(dir.path()).unwrap();
		(index, dir)
	}

	#[test]
	fn bind_open_upserts_node_and_path() {
		let (index, _dir) = new_index();
		let others = index.bind_open(1, "/a", 100).unwrap();
		assert!(others.is_empty());
		assert_eq!(index.lookup_node_by_path("/a").unwrap(), Some(1));
	}

	#[test]
	fn bind_open_reports_sibling_paths() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 100).unwrap();
		let others = index.bind_open(1, "/b", 101).unwrap();
		assert_eq!(others, vec!["/a".to_string()]);
	}

	#[test]
	fn merge_and_insert_is_idempotent() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.merge_and_insert(1, 2, 6, false).unwrap();
		index.merge_and_insert(1, 2, 6, false).unwrap();
		assert_eq!(index.total_bytes().unwrap(), 4);
		let block = index.overlapping_block(1, 2).unwrap().unwrap();
		assert_eq!((block.offset, block.end), (2, 6));
	}

	#[test]
	fn merge_and_insert_merges_touching_ranges() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.merge_and_insert(1, 2, 6, false).unwrap();
		index.merge_and_insert(1, 6, 10, true).unwrap();
		let block = index.overlapping_block(1, 4).unwrap().unwrap();
		assert_eq!((block.offset, block.end, block.last_block), (2, 10, true));
	}

	#[test]
	fn merge_and_insert_leaves_disjoint_ranges_separate() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.merge_and_insert(1, 0, 2, false).unwrap();
		index.merge_and_insert(1, 10, 12, false).unwrap();
		assert!(index.overlapping_block(1, 5).unwrap().is_none());
		assert_eq!(index.total_bytes().unwrap(), 4);
	}

	#[test]
	fn lru_victims_excludes_caller_and_orders_ascending() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 10).unwrap();
		index.bind_open(2, "/b", 5).unwrap();
		index.bind_open(3, "/c", 20).unwrap();
		let victims = index.lru_victims_excluding(1).unwrap();
		let ids: Vec<u64> = victims.iter().map(|v| v.node_id).collect();
		assert_eq!(ids, vec![2, 3]);
	}

	#[test]
	fn truncate_deletes_and_clamps_blocks() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.merge_and_insert(1, 0, 4, false).unwrap();
		index.merge_and_insert(1, 6, 10, true).unwrap();
		index.truncate_node(1, 5).unwrap();
		assert!(index.overlapping_block(1, 6).unwrap().is_none());
		let block = index.overlapping_block(1, 0).unwrap().unwrap();
		assert_eq!((block.offset, block.end), (0, 4));
	}

	#[test]
	fn drop_node_removes_everything() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.merge_and_insert(1, 0, 4, false).unwrap();
		index.drop_node(1).unwrap();
		assert_eq!(index.lookup_node_by_path("/a").unwrap(), None);
		assert_eq!(index.total_bytes().unwrap(), 0);
	}

	#[test]
	fn drop_path_reports_droppable_only_when_last() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.bind_open(1, "/b", 0).unwrap();
		assert!(!index.drop_path("/a").unwrap());
		assert!(index.drop_path("/b").unwrap());
	}

	#[test]
	fn rename_path_preserves_node_binding() {
		let (index, _dir) = new_index();
		index.bind_open(1, "/a", 0).unwrap();
		index.rename_path("/a", "/b").unwrap();
		assert_eq!(index.lookup_node_by_path("/a").unwrap(), None);
		assert_eq!(index.lookup_node_by_path("/b").unwrap(), Some(1));
	}
}
