//! File Data Cache: the per-open-handle object that mediates a single
//! (node_id, path) against the Block Store and Block Index, enforcing the
//! size budget and reporting hit/miss counters on close.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::index::{Block, BlockIndex, IndexResult};
use crate::store;

/// Control-flow signal distinguishing "ask the target and feed bytes back"
/// (`Miss`) from "stop caching, serve the target directly" (`Full`) from
/// an ordinary `Err`, which the caller should propagate.
///
/// Neither variant is a fault: the original this is ported from raises
/// `CacheMiss`/`CacheFull` as exceptions for the same purpose, but in Rust
/// that control flow is naturally a return value rather than an error type.
#[derive(Debug)]
pub enum CacheOutcome<T> {
	Hit(T),
	Miss,
	Full,
}

impl<T> CacheOutcome<T> {
	pub fn is_hit(&self) -> bool {
		matches!(self, CacheOutcome::Hit(_))
	}
}

/// Per-handle counters, reported on close.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
}

/// A File Data Cache bound to one open (node_id, mount-relative path).
pub struct FileDataCache {
	index: BlockIndex,
	cache_dir: PathBuf,
	budget: u64,
	path: String,
	node_id: u64,
	shadow: File,
	stats: CacheStats,
}

impl FileDataCache {
	/// Opens (or creates) the cache handle for `path`.
	///
	/// `node_id` should be supplied whenever the caller already knows the
	/// target inode (the common case via `facade::open`, which stats the
	/// target first). When omitted, the node is looked up by path; if no
	/// node is bound yet the cache cannot serve this file and the open
	/// itself misses.
	pub fn open(
		index: BlockIndex,
		cache_dir: &Path,
		budget: u64,
		path: &str,
		node_id: Option<u64>,
		truncate: bool,
		now: i64,
	) -> IndexResult<CacheOutcome<Self>> {
		let node_id = match node_id {
			Some(id) => id,
			None => match index.lookup_node_by_path(path)? {
				Some(id) => id,
				None => return Ok(CacheOutcome::Miss),
			},
		};

		let shadow = store::open_or_create(cache_dir, path, truncate)
			.map_err(|e| crate::index::IndexError::InitializationFailed(e.to_string()))?;

		let sibling_paths = index.bind_open(node_id, path, now)?;

		let shadow_path = store::shadow_path(cache_dir, path);
		if !shadow_path.exists() {
			for sibling in &sibling_paths {
				match store::hardlink_from_sibling(cache_dir, sibling, path) {
					Ok(true) => break,
					Ok(false) => continue,
					Err(e) if is_benign_race(&e) => {
						debug!(sibling = %sibling, error = %e, "hard link race, continuing");
						continue;
					}
					Err(e) => {
						return Err(crate::index::IndexError::InitializationFailed(e.to_string()))
					}
				}
			}
		}

		Ok(CacheOutcome::Hit(Self {
			index,
			cache_dir: cache_dir.to_path_buf(),
			budget,
			path: path.to_string(),
			node_id,
			shadow,
			stats: CacheStats::default(),
		}))
	}

	pub fn node_id(&self) -> u64 {
		self.node_id
	}

	pub fn stats(&self) -> CacheStats {
		self.stats
	}

	/// Serves `size` bytes at `offset` from the cache, if covered.
	pub fn read(&mut self, size: u64, offset: u64) -> IndexResult<CacheOutcome<Vec<u8>>> {
		let block = self.index.overlapping_block(self.node_id, offset)?;
		let covers = match block {
			Some(Block { end, last_block, .. }) => end >= offset + size || last_block,
			None => false,
		};
		if !covers {
			self.stats.misses += size;
			return Ok(CacheOutcome::Miss);
		}

		let mut buf = vec![0u8; size as usize];
		let n = store::pread(&self.shadow, &mut buf, offset)
			.map_err(|e| crate::index::IndexError::InitializationFailed(e.to_string()))?;
		buf.truncate(n);
		self.stats.hits += n as u64;
		Ok(CacheOutcome::Hit(buf))
	}

	/// Accounts `buf` into the cache at `offset`, evicting if necessary to
	/// stay within budget. `last_bytes` marks `offset + buf.len()` as
	/// authoritative EOF for this node.
	pub fn update(&mut self, buf: &[u8], offset: u64, last_bytes: bool) -> IndexResult<CacheOutcome<()>> {
		if let CacheOutcome::Full = self.make_room(buf.len() as u64)? {
			return Ok(CacheOutcome::Full);
		}
		store::pwrite(&self.shadow, buf, offset)
			.map_err(|e| crate::index::IndexError::InitializationFailed(e.to_string()))?;
		self.index
			.merge_and_insert(self.node_id, offset, offset + buf.len() as u64, last_bytes)?;
		Ok(CacheOutcome::Hit(()))
	}

	/// Evicts LRU victims (excluding this handle's own node) until `need`
	/// additional bytes fit under budget, or signals `Full` if the whole
	/// cache minus this node still can't make room.
	///
	/// Victims are chosen excluding only the *caller's* node, matching the
	/// original this is ported from: a single other hot node can still be
	/// evicted out from under a different in-flight handle on it, which is
	/// a known looseness of the coarse, file-granularity eviction policy
	/// rather than a bug to fix here.
	fn make_room(&self, need: u64) -> IndexResult<CacheOutcome<()>> {
		let total = self.index.total_bytes()?;
		if total + need <= self.budget {
			return Ok(CacheOutcome::Hit(()));
		}

		let victims = self.index.lru_victims_excluding(self.node_id)?;
		let mut freed = 0u64;
		let mut chosen = Vec::new();
		for victim in victims {
			if total.saturating_sub(freed) + need <= self.budget {
				break;
			}
			freed += victim.size;
			chosen.push(victim.node_id);
		}
		if total.saturating_sub(freed) + need > self.budget {
			return Ok(CacheOutcome::Full);
		}

		for victim_node in chosen {
			self.evict_node(victim_node)?;
		}
		Ok(CacheOutcome::Hit(()))
	}

	fn evict_node(&self, node_id: u64) -> IndexResult<()> {
		let paths = self.index.paths_for_node(node_id)?;
		for path in &paths {
			if let Err(e) = store::unlink(&self.cache_dir, path) {
				warn!(path = %path, error = %e, "failed to remove shadow file during eviction");
			}
		}
		self.index.drop_node(node_id)
	}

	/// Truncates the shadow file and the node's block records to `len`.
	pub fn truncate(&mut self, len: u64) -> IndexResult<()> {
		if let Err(e) = store::ftruncate(&self.shadow, len) {
			warn!(path = %self.path, error = %e, "ftruncate on shadow file failed");
			return Ok(());
		}
		self.index.truncate_node(self.node_id, len)
	}

	/// Removes the shadow file and this path's binding; drops the node
	/// entirely if no other path still names it.
	pub fn unlink(&self) -> IndexResult<()> {
		store::unlink(&self.cache_dir, &self.path)
			.map_err(|e| crate::index::IndexError::InitializationFailed(e.to_string()))?;
		let droppable = self.index.drop_path(&self.path)?;
		if droppable {
			self.index.drop_node(self.node_id)?;
		}
		Ok(())
	}

	/// Rebinds this handle's path row to `new_path` and moves the shadow
	/// file to match.
	pub fn rename(&mut self, new_path: &str) -> IndexResult<()> {
		self.index.rename_path(&self.path, new_path)?;
		if let Err(e) = store::rename(&self.cache_dir, &self.path, new_path) {
			warn!(old = %self.path, new = new_path, error = %e, "shadow file rename failed");
		}
		self.path = new_path.to_string();
		Ok(())
	}
}

fn is_benign_race(e: &std::io::Error) -> bool {
	matches!(
		e.raw_os_error(),
		Some(code) if code == libc::EEXIST || code == libc::ENOENT
	)
}

impl Drop for FileDataCache {
	fn drop(&mut self) {
		debug!(
			path = %self.path,
			node_id = self.node_id,
			hits = self.stats.hits,
			misses = self.stats.misses,
			"closing file data cache handle"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn fresh(budget: u64) -> (BlockIndex, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let index = BlockIndex::open_or_create(dir.path()).unwrap();
		(index, dir)
	}

	#[test]
	fn open_misses_when_no_node_id_and_no_binding() {
		let (index, dir) = fresh(1024);
		let outcome = FileDataCache::open(index, dir.path(), 1024, "/a", None, false, 0).unwrap();
		assert!(matches!(outcome, CacheOutcome::Miss));
	}

	#[test]
	fn update_then_read_hits() {
		let (index, dir) = fresh(1024);
		let outcome =
			FileDataCache::open(index, dir.path(), 1024, "/a", Some(1), false, 0).unwrap();
		let mut cache = match outcome {
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		cache.update(b"hello", 0, true).unwrap();
		let read = cache.read(5, 0).unwrap();
		match read {
			CacheOutcome::Hit(buf) => assert_eq!(buf, b"hello"),
			_ => panic!("expected hit"),
		}
		assert_eq!(cache.stats().hits, 5);
	}

	#[test]
	fn read_misses_on_uncovered_range() {
		let (index, dir) = fresh(1024);
		let outcome =
			FileDataCache::open(index, dir.path(), 1024, "/a", Some(1), false, 0).unwrap();
		let mut cache = match outcome {
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		let read = cache.read(5, 0).unwrap();
		assert!(matches!(read, CacheOutcome::Miss));
		assert_eq!(cache.stats().misses, 5);
	}

	#[test]
	fn update_signals_full_when_budget_exhausted() {
		let (index, dir) = fresh(4);
		let outcome =
			FileDataCache::open(index, dir.path(), 4, "/a", Some(1), false, 0).unwrap();
		let mut cache = match outcome {
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		let result = cache.update(b"hello", 0, true).unwrap();
		assert!(matches!(result, CacheOutcome::Full));
	}

	#[test]
	fn unlink_removes_shadow_file_and_path_binding() {
		let (index, dir) = fresh(1024);
		let outcome =
			FileDataCache::open(index.clone(), dir.path(), 1024, "/a", Some(1), false, 0).unwrap();
		let cache = match outcome {
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		cache.unlink().unwrap();
		assert_eq!(index.lookup_node_by_path("/a").unwrap(), None);
	}

	#[test]
	fn hard_link_shares_bytes_between_sibling_paths() {
		let (index, dir) = fresh(1024);
		let first = match FileDataCache::open(index.clone(), dir.path(), 1024, "/a", Some(1), false, 0)
			.unwrap()
		{
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		drop(first);

		let mut second = match FileDataCache::open(index, dir.path(), 1024, "/b", Some(1), false, 0)
			.unwrap()
		{
			CacheOutcome::Hit(c) => c,
			_ => panic!("expected hit"),
		};
		second.update(b"shared bytes", 0, true).unwrap();

		let shadow_a = store::shadow_path(dir.path(), "/a");
		let shadow_b = store::shadow_path(dir.path(), "/b");
		let meta_a = std::fs::metadata(&shadow_a).unwrap();
		let meta_b = std::fs::metadata(&shadow_b).unwrap();
		use std::os::unix::fs::MetadataExt;
		assert_eq!(meta_a.ino(), meta_b.ino());
	}
}
