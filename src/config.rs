//! Mount configuration: the validated settings a `cachefs` mount runs with.

use std::path::PathBuf;

pub const DEFAULT_CACHE_SIZE: u64 = 1 << 30; // 1 GiB

/// Path-byte decoding scheme for the index. Only `Utf8` is implemented;
/// any other requested charset fails validation (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
	Utf8,
}

impl Charset {
	pub fn parse(name: &str) -> Option<Self> {
		if name.eq_ignore_ascii_case("utf-8") || name.eq_ignore_ascii_case("utf8") {
			Some(Charset::Utf8)
		} else {
			None
		}
	}
}

#[derive(Debug, Clone)]
pub struct MountConfig {
	pub target: PathBuf,
	pub mountpoint: PathBuf,
	pub cache_dir: PathBuf,
	pub cache_size: u64,
	pub charset: Charset,
}

impl MountConfig {
	pub fn validate(&self) -> Result<(), String> {
		if !self.target.is_absolute() {
			return Err(format!("target path {:?} must be absolute", self.target));
		}
		if !self.target.is_dir() {
			return Err(format!("target path {:?} is not a directory", self.target));
		}
		if !self.mountpoint.is_dir() {
			return Err(format!(
				"mountpoint {:?} is not a directory",
				self.mountpoint
			));
		}
		if self.cache_size == 0 {
			return Err("cache_size must be greater than zero".to_string());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn charset_accepts_utf8_case_insensitively() {
		assert_eq!(Charset::parse("UTF-8"), Some(Charset::Utf8));
		assert_eq!(Charset::parse("utf8"), Some(Charset::Utf8));
		assert_eq!(Charset::parse("latin1"), None);
	}

	#[test]
	fn validate_rejects_zero_cache_size() {
		let dir = tempdir().unwrap();
		let config = MountConfig {
			target: dir.path().to_path_buf(),
			mountpoint: dir.path().to_path_buf(),
			cache_dir: dir.path().join("cache"),
			cache_size: 0,
			charset: Charset::Utf8,
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn validate_rejects_relative_target() {
		let dir = tempdir().unwrap();
		let config = MountConfig {
			target: PathBuf::from("relative/path"),
			mountpoint: dir.path().to_path_buf(),
			cache_dir: dir.path().join("cache"),
			cache_size: DEFAULT_CACHE_SIZE,
			charset: Charset::Utf8,
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn validate_accepts_well_formed_config() {
		let dir = tempdir().unwrap();
		let config = MountConfig {
			target: dir.path().to_path_buf(),
			mountpoint: dir.path().to_path_buf(),
			cache_dir: dir.path().join("cache"),
			cache_size: DEFAULT_CACHE_SIZE,
			charset: Charset::Utf8,
		};
		assert!(config.validate().is_ok());
	}
}
