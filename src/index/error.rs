//! Error types for Block Index operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
	#[error("database initialization failed: {0}")]
	InitializationFailed(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] bincode::Error),

	#[error("redb database error: {0}")]
	Database(#[from] redb::DatabaseError),

	#[error("redb transaction error: {0}")]
	Transaction(#[from] redb::TransactionError),

	#[error("redb commit error: {0}")]
	Commit(#[from] redb::CommitError),

	#[error("redb table error: {0}")]
	Table(#[from] redb::TableError),

	#[error("redb storage error: {0}")]
	Storage(#[from] redb::StorageError),

	#[error("node {0} not found")]
	NodeNotFound(u64),

	#[error("path {0:?} not found")]
	PathNotFound(String),
}

pub type IndexResult<T> = Result<T, IndexError>;
