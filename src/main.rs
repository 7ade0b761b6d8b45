use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};

use cachefs::config::{Charset, MountConfig, DEFAULT_CACHE_SIZE};
use cachefs::{BlockIndex, CacheFs, CacheFsError};

#[derive(Parser)]
#[command(name = "cachefs")]
#[command(about = "A read-through caching FUSE overlay for a target directory tree")]
struct Cli {
	/// Absolute path of the tree to cache
	#[arg(long)]
	target: PathBuf,

	/// Where to mount the cached view of `target`
	mountpoint: PathBuf,

	/// Cache directory (default: <home>/.cachefs/<hex MD5 of target>)
	#[arg(long)]
	cache: Option<PathBuf>,

	/// Cache size budget in bytes
	#[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
	cache_size: u64,

	/// Charset used to decode path bytes for the index
	#[arg(long, default_value = "utf-8")]
	charset: String,

	/// Enable verbose logging
	#[arg(short, long)]
	verbose: bool,
}

fn default_cache_dir(target: &std::path::Path) -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| {
		anyhow::anyhow!("could not determine home directory for default cache location")
	})?;
	let digest = md5::compute(target.to_string_lossy().as_bytes());
	Ok(home.join(".cachefs").join(format!("{digest:x}")))
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let level = if cli.verbose {
		Level::DEBUG
	} else {
		Level::INFO
	};
	tracing_subscriber::fmt().with_max_level(level).init();

	let charset = Charset::parse(&cli.charset).ok_or_else(|| {
		CacheFsError::configuration_error(
			"charset",
			&format!("unsupported charset {:?}, only utf-8 is implemented", cli.charset),
		)
	})?;

	let cache_dir = match cli.cache {
		Some(path) => path,
		None => default_cache_dir(&cli.target)?,
	};

	let config = MountConfig {
		target: cli.target,
		mountpoint: cli.mountpoint,
		cache_dir,
		cache_size: cli.cache_size,
		charset,
	};
	config
		.validate()
		.map_err(|reason| CacheFsError::configuration_error("mount", &reason))?;

	info!(target = ?config.target, mountpoint = ?config.mountpoint, cache_dir = ?config.cache_dir, "starting cachefs");

	let index = BlockIndex::open_or_create(&config.cache_dir)?;
	let filesystem = CacheFs::new(
		config.target.clone(),
		index,
		config.cache_dir.clone(),
		config.cache_size,
	);

	let options = vec![
		fuser::MountOption::FSName("cachefs".to_string()),
		fuser::MountOption::AutoUnmount,
		fuser::MountOption::RW,
	];
	fuser::mount2(filesystem, &config.mountpoint, &options)?;

	info!("cachefs unmounted cleanly");
	Ok(())
}
