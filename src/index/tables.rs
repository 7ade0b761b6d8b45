//! Table definitions and composite-key encoding for the Block Index
//!
//! `BLOCKS_TABLE` keys pack `(node_id, offset)` big-endian so a decoded key
//! sorts the way its numeric fields would; lookups still scan the whole
//! table per node (O(N) in the block count, mirrored from the "naive scan"
//! style the filesystem-cache storage modules already use elsewhere in this
//! codebase), which is adequate at the file-granularity scale this cache
//! operates at.

use crate::index::error::IndexResult;
use redb::TableDefinition;

/// `nodes(id, last_use)` — key: node_id (8 bytes BE), value: bincode `NodeRecord`.
pub const NODES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("nodes");

/// `paths(id, node_id, path unique)` — key: path bytes, value: bincode `PathRecord`.
pub const PATHS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("paths");

/// `blocks(node_id, offset, end, last_block)` — key: node_id(8) ++ offset(8),
/// both BE, value: bincode `BlockRecord`.
pub const BLOCKS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");

pub fn node_key(node_id: u64) -> [u8; 8] {
	node_id.to_be_bytes()
}

pub fn block_key(node_id: u64, offset: u64) -> [u8; 16] {
	let mut key = [0u8; 16];
	key[..8].copy_from_slice(&node_id.to_be_bytes());
	key[8..].copy_from_slice(&offset.to_be_bytes());
	key
}

pub fn split_block_key(key: &[u8]) -> (u64, u64) {
	let node_id = u64::from_be_bytes(key[..8].try_into().unwrap());
	let offset = u64::from_be_bytes(key[8..].try_into().unwrap());
	(node_id, offset)
}

pub fn initialize_tables(database: &redb::Database) -> IndexResult<()> {
	let write_txn = database.begin_write()?;
	{
		let _ = write_txn.open_table(NODES_TABLE)?;
		let _ = write_txn.open_table(PATHS_TABLE)?;
		let _ = write_txn.open_table(BLOCKS_TABLE)?;
	}
	write_txn.commit()?;
	Ok(())
}
