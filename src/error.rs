use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheFsError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("block index error: {0}")]
	Index(#[from] crate::index::IndexError),

	#[error("configuration error: {parameter} - {reason}")]
	ConfigurationError { parameter: String, reason: String },

	#[error("invalid path: {path}")]
	InvalidPath { path: String },
}

impl CacheFsError {
	pub fn configuration_error(parameter: &str, reason: &str) -> Self {
		CacheFsError::ConfigurationError {
			parameter: parameter.to_string(),
			reason: reason.to_string(),
		}
	}

	/// Maps this error to the `libc` errno FUSE expects in a `Reply*::error` call.
	pub fn as_errno(&self) -> i32 {
		match self {
			CacheFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
			CacheFsError::Index(_) => libc::EIO,
			CacheFsError::ConfigurationError { .. } => libc::EINVAL,
			CacheFsError::InvalidPath { .. } => libc::ENOENT,
		}
	}
}

pub type Result<T> = std::result::Result<T, CacheFsError>;

#[cfg(test)]
mod tests {
	use super::*;
	use std::io;

	#[test]
	fn io_error_maps_to_its_own_errno() {
		let err = CacheFsError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
		assert_eq!(err.as_errno(), libc::ENOSPC);
	}

	#[test]
	fn configuration_error_maps_to_einval() {
		let err = CacheFsError::configuration_error("cache-size", "must be positive");
		assert_eq!(err.as_errno(), libc::EINVAL);
		assert!(err.to_string().contains("cache-size"));
	}
}
