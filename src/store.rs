//! Block Store: a directory tree that shadows target paths, one sparse
//! file per cached node, under `<cache_dir>/file_data/<mount-relative path>`.
//!
//! Stateless beyond the cache base directory, matching the teacher's
//! preference for free functions over an object where no per-call state
//! needs to be carried between invocations.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Resolves the shadow path for a mount-relative path, without touching
/// the filesystem.
pub fn shadow_path(cache_dir: &Path, mount_relative: &str) -> PathBuf {
	let trimmed = mount_relative.trim_start_matches('/');
	cache_dir.join("file_data").join(trimmed)
}

/// Opens (creating if missing) the shadow file for `mount_relative`,
/// creating its parent directory tree first. `truncate` mirrors `O_TRUNC`.
pub fn open_or_create(cache_dir: &Path, mount_relative: &str, truncate: bool) -> io::Result<File> {
	let path = shadow_path(cache_dir, mount_relative);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	OpenOptions::new()
		.read(true)
		.write(true)
		.create(true)
		.truncate(truncate)
		.open(path)
}

/// Reads up to `buf.len()` bytes at `offset` without moving any shared
/// cursor; returns the number of bytes actually read (short on EOF).
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
	loop {
		match file.read_at(buf, offset) {
			Ok(n) => return Ok(n),
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}
}

/// Writes all of `buf` at `offset`.
pub fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
	file.write_all_at(buf, offset)
}

pub fn ftruncate(file: &File, len: u64) -> io::Result<()> {
	file.set_len(len)
}

/// Removes the shadow file for `mount_relative`, if present.
///
/// Refuses to touch anything outside `<cache_dir>/file_data` — the same
/// guard the cache overlay this was ported from applies before an
/// eviction's victim removal (`path.startswith(self.cachebase)`), since a
/// `mount_relative` whose components climb above the mount root via `..`
/// must never be allowed to delete a real file elsewhere on disk.
pub fn unlink(cache_dir: &Path, mount_relative: &str) -> io::Result<()> {
	if !is_within_cache_base(mount_relative) {
		return Ok(());
	}
	let path = shadow_path(cache_dir, mount_relative);
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e),
	}
}

/// Lexically confirms `mount_relative` never climbs above the mount root:
/// walks its components tracking depth, rejecting any path whose `..`
/// components would take it above where it started. Purely lexical (no
/// filesystem access) since the shadow file an eviction is removing may
/// already be gone.
fn is_within_cache_base(mount_relative: &str) -> bool {
	use std::path::Component;

	let trimmed = mount_relative.trim_start_matches('/');
	let mut depth: i64 = 0;
	for component in Path::new(trimmed).components() {
		match component {
			Component::ParentDir => depth -= 1,
			Component::Normal(_) => depth += 1,
			Component::CurDir => {}
			_ => return false,
		}
		if depth < 0 {
			return false;
		}
	}
	true
}

/// Removes the shadow directory for `mount_relative` only if it is empty.
pub fn rmdir_if_empty(cache_dir: &Path, mount_relative: &str) -> io::Result<()> {
	let path = shadow_path(cache_dir, mount_relative);
	match fs::remove_dir(path) {
		Ok(()) => Ok(()),
		Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(()),
		Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
		Err(e) => Err(e),
	}
}

/// Hard-links `sibling`'s shadow file into `target`'s shadow location so the
/// two paths share one extent of bytes on disk, only if `target` doesn't
/// already have one and `sibling` does.
pub fn hardlink_from_sibling(
	cache_dir: &Path,
	sibling_relative: &str,
	target_relative: &str,
) -> io::Result<bool> {
	let sibling_path = shadow_path(cache_dir, sibling_relative);
	let target_path = shadow_path(cache_dir, target_relative);
	if target_path.exists() || !sibling_path.exists() {
		return Ok(false);
	}
	if let Some(parent) = target_path.parent() {
		fs::create_dir_all(parent)?;
	}
	match fs::hard_link(&sibling_path, &target_path) {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
		Err(e) => Err(e),
	}
}

/// Moves a shadow file from `old_relative` to `new_relative`, creating the
/// destination directory tree first.
pub fn rename(cache_dir: &Path, old_relative: &str, new_relative: &str) -> io::Result<()> {
	let old_path = shadow_path(cache_dir, old_relative);
	let new_path = shadow_path(cache_dir, new_relative);
	if let Some(parent) = new_path.parent() {
		fs::create_dir_all(parent)?;
	}
	fs::rename(old_path, new_path)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn open_or_create_makes_parent_dirs() {
		let dir = tempdir().unwrap();
		let file = open_or_create(dir.path(), "/a/b/c.bin", false).unwrap();
		drop(file);
		assert!(shadow_path(dir.path(), "/a/b/c.bin").exists());
	}

	#[test]
	fn pwrite_then_pread_roundtrips() {
		let dir = tempdir().unwrap();
		let file = open_or_create(dir.path(), "/f", false).unwrap();
		pwrite(&file, b"hello", 10).unwrap();
		let mut buf = [0u8; 5];
		let n = pread(&file, &mut buf, 10).unwrap();
		assert_eq!(n, 5);
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn pread_short_reads_at_eof() {
		let dir = tempdir().unwrap();
		let file = open_or_create(dir.path(), "/f", false).unwrap();
		pwrite(&file, b"hi", 0).unwrap();
		let mut buf = [0u8; 10];
		let n = pread(&file, &mut buf, 0).unwrap();
		assert_eq!(n, 2);
	}

	#[test]
	fn hardlink_from_sibling_links_when_target_absent() {
		let dir = tempdir().unwrap();
		let file = open_or_create(dir.path(), "/a", false).unwrap();
		pwrite(&file, b"shared", 0).unwrap();
		drop(file);

		let linked = hardlink_from_sibling(dir.path(), "/a", "/b").unwrap();
		assert!(linked);
		assert!(shadow_path(dir.path(), "/b").exists());

		let linked_again = hardlink_from_sibling(dir.path(), "/a", "/b").unwrap();
		assert!(!linked_again);
	}

	#[test]
	fn rename_moves_shadow_file() {
		let dir = tempdir().unwrap();
		let file = open_or_create(dir.path(), "/old", false).unwrap();
		drop(file);
		rename(dir.path(), "/old", "/new/path").unwrap();
		assert!(!shadow_path(dir.path(), "/old").exists());
		assert!(shadow_path(dir.path(), "/new/path").exists());
	}

	#[test]
	fn unlink_is_idempotent_on_missing_file() {
		let dir = tempdir().unwrap();
		assert!(unlink(dir.path(), "/missing").is_ok());
	}

	#[test]
	fn unlink_refuses_a_path_that_escapes_the_cache_base() {
		let dir = tempdir().unwrap();
		// shadow_path would join this onto `<dir>/file_data/..`, landing on
		// a file directly inside `<dir>` rather than under `file_data/`.
		let escapee = dir.path().join("escaped-victim");
		fs::write(&escapee, b"not part of the cache").unwrap();

		assert!(unlink(dir.path(), "/../escaped-victim").is_ok());
		assert!(escapee.exists());
	}
}
