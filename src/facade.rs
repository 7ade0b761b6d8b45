//! Filesystem Facade: a `fuser::Filesystem` that mirrors a target directory
//! tree and caches data operations through a `FileDataCache`.
//!
//! Every op below serves one FUSE request to completion before returning —
//! unlike the mo2fuse-style passthrough filesystems in the example pack,
//! nothing here is dispatched onto a worker pool. The index's transactional
//! invariants only hold if requests are handled one at a time.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
	FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
	ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, warn};

use crate::cache::{CacheOutcome, FileDataCache};
use crate::index::BlockIndex;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct OpenHandle {
	target: File,
	relative: PathBuf,
	cache: Option<FileDataCache>,
}

/// The mounted cachefs filesystem: target tree, cache configuration, and
/// the in-memory ino <-> path table FUSE's lowlevel API requires.
pub struct CacheFs {
	target: PathBuf,
	index: BlockIndex,
	cache_dir: PathBuf,
	budget: u64,
	ino_to_path: HashMap<u64, PathBuf>,
	path_to_ino: HashMap<PathBuf, u64>,
	next_ino: u64,
	handles: HashMap<u64, OpenHandle>,
	next_fh: u64,
}

impl CacheFs {
	pub fn new(target: PathBuf, index: BlockIndex, cache_dir: PathBuf, budget: u64) -> Self {
		let mut ino_to_path = HashMap::new();
		let mut path_to_ino = HashMap::new();
		ino_to_path.insert(ROOT_INO, PathBuf::new());
		path_to_ino.insert(PathBuf::new(), ROOT_INO);

		Self {
			target,
			index,
			cache_dir,
			budget,
			ino_to_path,
			path_to_ino,
			next_ino: ROOT_INO + 1,
			handles: HashMap::new(),
			next_fh: 1,
		}
	}

	fn resolve_ino(&mut self, relative: &Path) -> u64 {
		if let Some(ino) = self.path_to_ino.get(relative) {
			return *ino;
		}
		let ino = self.next_ino;
		self.next_ino += 1;
		self.ino_to_path.insert(ino, relative.to_path_buf());
		self.path_to_ino.insert(relative.to_path_buf(), ino);
		ino
	}

	fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
		self.ino_to_path.get(&ino).cloned()
	}

	fn rename_ino_entry(&mut self, old: &Path, new: &Path) {
		if let Some(ino) = self.path_to_ino.remove(old) {
			self.path_to_ino.insert(new.to_path_buf(), ino);
			self.ino_to_path.insert(ino, new.to_path_buf());
		}
	}

	fn target_path(&self, relative: &Path) -> PathBuf {
		self.target.join(relative)
	}

	/// Decodes `relative` as UTF-8 for the index/shadow-store key. Per
	/// spec.md §9 "Charset handling", non-decodable bytes must fail rather
	/// than be silently replaced (`to_string_lossy` would collide two
	/// distinct non-UTF-8 names onto the same U+FFFD-substituted key).
	fn mount_relative_str(relative: &Path) -> Result<String, std::str::Utf8Error> {
		let decoded = std::str::from_utf8(relative.as_os_str().as_bytes())?;
		Ok(format!("/{decoded}"))
	}

	fn alloc_fh(&mut self) -> u64 {
		let fh = self.next_fh;
		self.next_fh += 1;
		fh
	}

	fn attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
		let kind = if meta.is_dir() {
			FileType::Directory
		} else if meta.file_type().is_symlink() {
			FileType::Symlink
		} else {
			FileType::RegularFile
		};
		FileAttr {
			ino,
			size: meta.len(),
			blocks: meta.blocks(),
			atime: meta.accessed().unwrap_or(UNIX_EPOCH),
			mtime: meta.modified().unwrap_or(UNIX_EPOCH),
			ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
			crtime: UNIX_EPOCH,
			kind,
			perm: (meta.permissions().mode() & 0o7777) as u16,
			nlink: meta.nlink() as u32,
			uid: meta.uid(),
			gid: meta.gid(),
			rdev: meta.rdev() as u32,
			blksize: meta.blksize() as u32,
			flags: 0,
		}
	}
}

impl Filesystem for CacheFs {
	fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
		debug!(target = ?self.target, "cachefs mounted");
		Ok(())
	}

	fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let relative = parent_path.join(name);
		let full = self.target_path(&relative);
		match fs::symlink_metadata(&full) {
			Ok(meta) => {
				let ino = self.resolve_ino(&relative);
				reply.entry(&TTL, &Self::attr(ino, &meta), 0);
			}
			Err(_) => reply.error(libc::ENOENT),
		}
	}

	fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		match fs::symlink_metadata(self.target_path(&relative)) {
			Ok(meta) => reply.attr(&TTL, &Self::attr(ino, &meta)),
			Err(_) => reply.error(libc::ENOENT),
		}
	}

	fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		match fs::read_link(self.target_path(&relative)) {
			Ok(target) => reply.data(target.as_os_str().as_bytes()),
			Err(_) => reply.error(libc::ENOENT),
		}
	}

	fn readdir(
		&mut self,
		_req: &Request,
		ino: u64,
		_fh: u64,
		offset: i64,
		mut reply: ReplyDirectory,
	) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let dir = match fs::read_dir(self.target_path(&relative)) {
			Ok(d) => d,
			Err(_) => return reply.error(libc::ENOENT),
		};

		let mut entries = vec![
			(ino, FileType::Directory, ".".to_string()),
			(ROOT_INO, FileType::Directory, "..".to_string()),
		];
		for entry in dir.flatten() {
			let name = entry.file_name().to_string_lossy().to_string();
			let child_relative = relative.join(&name);
			let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
			let kind = if is_dir {
				FileType::Directory
			} else {
				FileType::RegularFile
			};
			let child_ino = self.resolve_ino(&child_relative);
			entries.push((child_ino, kind, name));
		}

		for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
			if reply.add(*ino, (i + 1) as i64, *kind, name) {
				break;
			}
		}
		reply.ok();
	}

	fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let full = self.target_path(&relative);
		let c_path = match std::ffi::CString::new(full.as_os_str().as_bytes()) {
			Ok(p) => p,
			Err(_) => return reply.error(libc::EINVAL),
		};
		let result = unsafe { libc::access(c_path.as_ptr(), mask) };
		if result == 0 {
			reply.ok();
		} else {
			reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
		}
	}

	fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let full = self.target_path(&relative);
		let truncate = flags & libc::O_TRUNC != 0;
		let accmode = flags & libc::O_ACCMODE;
		let mut opts = fs::OpenOptions::new();
		opts.read(accmode != libc::O_WRONLY);
		opts.write(accmode != libc::O_RDONLY);
		opts.truncate(truncate);

		let target = match opts.open(&full) {
			Ok(f) => f,
			Err(e) => return reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		};

		let node_id = match target.metadata() {
			Ok(meta) => meta.ino(),
			Err(e) => return reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		};

		let now = now_secs();
		let cache = match Self::mount_relative_str(&relative) {
			Err(e) => {
				warn!(path = ?relative, error = %e, "path is not valid UTF-8, degrading to target-only");
				None
			}
			Ok(mount_relative) => match FileDataCache::open(
				self.index.clone(),
				&self.cache_dir,
				self.budget,
				&mount_relative,
				Some(node_id),
				truncate,
				now,
			) {
				Ok(CacheOutcome::Hit(c)) => Some(c),
				Ok(CacheOutcome::Miss) | Ok(CacheOutcome::Full) => None,
				Err(e) => {
					warn!(path = %mount_relative, error = %e, "cache open failed, degrading to target-only");
					None
				}
			},
		};

		let fh = self.alloc_fh();
		self.handles.insert(
			fh,
			OpenHandle {
				target,
				relative,
				cache,
			},
		);
		reply.opened(fh, 0);
	}

	fn read(
		&mut self,
		_req: &Request,
		_ino: u64,
		fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		let handle = match self.handles.get_mut(&fh) {
			Some(h) => h,
			None => return reply.error(libc::EBADF),
		};
		let offset = offset as u64;
		let size = size as u64;

		if let Some(cache) = handle.cache.as_mut() {
			match cache.read(size, offset) {
				Ok(CacheOutcome::Hit(buf)) => return reply.data(&buf),
				Ok(CacheOutcome::Miss) => {}
				Ok(CacheOutcome::Full) => unreachable!("read never signals Full"),
				Err(e) => warn!(error = %e, "cache read failed, falling back to target"),
			}
		}

		let mut buf = vec![0u8; size as usize];
		let n = match handle.target.read_at(&mut buf, offset) {
			Ok(n) => n,
			Err(e) => return reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		};
		buf.truncate(n);

		if let Some(cache) = handle.cache.as_mut() {
			let mut probe = [0u8; 1];
			let probed = handle
				.target
				.read_at(&mut probe, offset + n as u64)
				.unwrap_or(0);
			let at_eof = probed == 0;
			if let Err(e) = cache.update(&buf, offset, at_eof) {
				warn!(error = %e, "cache update after miss failed");
			}
		}

		reply.data(&buf);
	}

	fn write(
		&mut self,
		_req: &Request,
		_ino: u64,
		fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		let handle = match self.handles.get_mut(&fh) {
			Some(h) => h,
			None => return reply.error(libc::EBADF),
		};
		let offset = offset as u64;

		if let Err(e) = handle.target.write_all_at(data, offset) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}

		if let Some(cache) = handle.cache.as_mut() {
			let new_size = handle.target.metadata().map(|m| m.len()).unwrap_or(0);
			let last_bytes = offset + data.len() as u64 == new_size;
			if let Err(e) = cache.update(data, offset, last_bytes) {
				warn!(error = %e, "cache update after write failed");
			}
		}

		reply.written(data.len() as u32);
	}

	fn flush(
		&mut self,
		_req: &Request,
		_ino: u64,
		fh: u64,
		_lock_owner: u64,
		reply: ReplyEmpty,
	) {
		if let Some(handle) = self.handles.get(&fh) {
			let _ = handle.target.sync_data();
		}
		reply.ok();
	}

	fn release(
		&mut self,
		_req: &Request,
		_ino: u64,
		fh: u64,
		_flags: i32,
		_lock_owner: Option<u64>,
		_flush: bool,
		reply: ReplyEmpty,
	) {
		self.handles.remove(&fh);
		reply.ok();
	}

	fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let relative = parent_path.join(name);
		let full = self.target_path(&relative);

		if let Err(e) = fs::remove_file(&full) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}

		match Self::mount_relative_str(&relative) {
			Err(e) => {
				warn!(path = ?relative, error = %e, "path is not valid UTF-8, skipping cache cleanup");
			}
			Ok(mount_relative) => {
				if let Err(e) = self.index.drop_path(&mount_relative) {
					warn!(path = %mount_relative, error = %e, "cache drop_path after unlink failed");
				}
				if let Err(e) = crate::store::unlink(&self.cache_dir, &mount_relative) {
					warn!(path = %mount_relative, error = %e, "shadow file unlink failed");
				}
			}
		}
		reply.ok();
	}

	fn mkdir(
		&mut self,
		_req: &Request,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: ReplyEntry,
	) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let relative = parent_path.join(name);
		let full = self.target_path(&relative);
		if let Err(e) = fs::create_dir(&full) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}
		let _ = fs::set_permissions(&full, fs::Permissions::from_mode(mode));
		match fs::symlink_metadata(&full) {
			Ok(meta) => {
				let ino = self.resolve_ino(&relative);
				reply.entry(&TTL, &Self::attr(ino, &meta), 0);
			}
			Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		}
	}

	fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let relative = parent_path.join(name);
		let full = self.target_path(&relative);
		match fs::remove_dir(&full) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		}
	}

	fn symlink(
		&mut self,
		_req: &Request,
		parent: u64,
		name: &OsStr,
		link: &Path,
		reply: ReplyEntry,
	) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let relative = parent_path.join(name);
		let full = self.target_path(&relative);
		if let Err(e) = std::os::unix::fs::symlink(link, &full) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}
		match fs::symlink_metadata(&full) {
			Ok(meta) => {
				let ino = self.resolve_ino(&relative);
				reply.entry(&TTL, &Self::attr(ino, &meta), 0);
			}
			Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		}
	}

	fn link(
		&mut self,
		_req: &Request,
		ino: u64,
		newparent: u64,
		newname: &OsStr,
		reply: ReplyEntry,
	) {
		let old_relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let new_parent_path = match self.path_for_ino(newparent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let new_relative = new_parent_path.join(newname);
		let old_full = self.target_path(&old_relative);
		let new_full = self.target_path(&new_relative);
		if let Err(e) = fs::hard_link(&old_full, &new_full) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}
		match fs::symlink_metadata(&new_full) {
			Ok(meta) => {
				let new_ino = self.resolve_ino(&new_relative);
				reply.entry(&TTL, &Self::attr(new_ino, &meta), 0);
			}
			Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		}
	}

	fn rename(
		&mut self,
		_req: &Request,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let parent_path = match self.path_for_ino(parent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let new_parent_path = match self.path_for_ino(newparent) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let old_relative = parent_path.join(name);
		let new_relative = new_parent_path.join(newname);
		let old_full = self.target_path(&old_relative);
		let new_full = self.target_path(&new_relative);

		if let Err(e) = fs::rename(&old_full, &new_full) {
			return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
		}

		match (
			Self::mount_relative_str(&old_relative),
			Self::mount_relative_str(&new_relative),
		) {
			(Ok(old_mount_relative), Ok(new_mount_relative)) => {
				if let Err(e) = self.index.rename_path(&old_mount_relative, &new_mount_relative) {
					debug!(old = %old_mount_relative, error = %e, "no cache binding to rename, skipping");
				} else if let Err(e) =
					crate::store::rename(&self.cache_dir, &old_mount_relative, &new_mount_relative)
				{
					warn!(error = %e, "shadow file rename failed");
				}
			}
			_ => {
				debug!(old = ?old_relative, new = ?new_relative, "path is not valid UTF-8, skipping cache rename");
			}
		}
		self.rename_ino_entry(&old_relative, &new_relative);
		reply.ok();
	}

	fn setattr(
		&mut self,
		_req: &Request,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<SystemTime>,
		fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		let relative = match self.path_for_ino(ino) {
			Some(p) => p,
			None => return reply.error(libc::ENOENT),
		};
		let full = self.target_path(&relative);

		if let Some(mode) = mode {
			let _ = fs::set_permissions(&full, fs::Permissions::from_mode(mode));
		}
		if uid.is_some() || gid.is_some() {
			if let Ok(c_path) = std::ffi::CString::new(full.as_os_str().as_bytes()) {
				unsafe {
					libc::chown(c_path.as_ptr(), uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX));
				}
			}
		}
		if let Some(new_size) = size {
			if let Err(e) = truncate_target(&full, new_size) {
				return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
			}
			if let Some(fh) = fh {
				if let Some(handle) = self.handles.get_mut(&fh) {
					if let Some(cache) = handle.cache.as_mut() {
						if let Err(e) = cache.truncate(new_size) {
							warn!(error = %e, "cache truncate failed");
						}
					}
				}
			} else if let Some(node_id) = fs::metadata(&full).ok().map(|m| m.ino()) {
				if let Err(e) = self.index.truncate_node(node_id, new_size) {
					debug!(path = ?relative, error = %e, "no cache node to truncate, skipping");
				}
			}
		}
		if atime.is_some() || mtime.is_some() {
			let _ = apply_times(&full, atime, mtime);
		}

		match fs::symlink_metadata(&full) {
			Ok(meta) => reply.attr(&TTL, &Self::attr(ino, &meta)),
			Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
		}
	}
}

fn truncate_target(path: &Path, len: u64) -> std::io::Result<()> {
	let file = fs::OpenOptions::new().write(true).open(path)?;
	file.set_len(len)
}

fn apply_times(
	path: &Path,
	atime: Option<TimeOrNow>,
	mtime: Option<TimeOrNow>,
) -> std::io::Result<()> {
	let resolve = |t: Option<TimeOrNow>| -> Option<SystemTime> {
		t.map(|t| match t {
			TimeOrNow::SpecificTime(t) => t,
			TimeOrNow::Now => SystemTime::now(),
		})
	};
	let a = resolve(atime);
	let m = resolve(mtime);
	let to_timespec = |t: Option<SystemTime>| -> libc::timespec {
		match t {
			Some(t) => {
				let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
				libc::timespec {
					tv_sec: dur.as_secs() as libc::time_t,
					tv_nsec: dur.subsec_nanos() as libc::c_long,
				}
			}
			None => libc::timespec {
				tv_sec: 0,
				tv_nsec: libc::UTIME_OMIT,
			},
		}
	};
	let specs = [to_timespec(a), to_timespec(m)];
	let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
		.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
	let result = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), specs.as_ptr(), 0) };
	if result == 0 {
		Ok(())
	} else {
		Err(std::io::Error::last_os_error())
	}
}

fn now_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}
