use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::KilnError;
use crate::KilnResult;

pub const CACHE_SCHEMA_VERSION: u32 = 1;
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_CACHE_PATH: &str = ".kiln/cache.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
	pub path: String,
	pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
	schema_version: u32,
	tool_version: String,
	entries: Vec<CacheEntry>,
}

/// How a cache file was obtained by [`ContentCache::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheLoad {
	/// No cache file exists yet.
	Missing,
	/// Entries were read from disk.
	Loaded,
	/// The file was written by a different schema or tool version and was
	/// discarded.
	VersionMismatch {
		schema_version: u32,
		tool_version: String,
	},
	/// The file exists but could not be read or parsed.
	Unreadable(String),
}

/// Path → content hash store deciding whether a file changed since the last
/// run.
///
/// All lookups and mutations of the entry map happen under a single lock.
/// Hashing is performed before the lock is taken.
#[derive(Debug, Default)]
pub struct ContentCache {
	entries: Mutex<BTreeMap<String, String>>,
}

impl ContentCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Load a cache file. Every outcome other than [`CacheLoad::Loaded`]
	/// produces an empty cache.
	pub fn load(path: &Path) -> (Self, CacheLoad) {
		let bytes = match std::fs::read(path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return (Self::new(), CacheLoad::Missing);
			}
			Err(e) => return (Self::new(), CacheLoad::Unreadable(e.to_string())),
		};

		let file: CacheFile = match serde_json::from_slice(&bytes) {
			Ok(file) => file,
			Err(e) => return (Self::new(), CacheLoad::Unreadable(e.to_string())),
		};

		if file.schema_version != CACHE_SCHEMA_VERSION || file.tool_version != TOOL_VERSION {
			return (
				Self::new(),
				CacheLoad::VersionMismatch {
					schema_version: file.schema_version,
					tool_version: file.tool_version,
				},
			);
		}

		let entries = file
			.entries
			.into_iter()
			.map(|entry| (entry.path, entry.hash))
			.collect();

		(
			Self {
				entries: Mutex::new(entries),
			},
			CacheLoad::Loaded,
		)
	}

	/// Hash the current contents of `path` and compare against the stored
	/// hash. Returns `true` when the file is unchanged. Otherwise the new hash
	/// is recorded and `false` is returned.
	pub fn check_and_update(&self, path: &Path) -> KilnResult<bool> {
		let hash = hash_file(path)?;
		let key = normalize_path_key(path);

		let mut entries = self.lock();
		if entries.get(&key).is_some_and(|stored| *stored == hash) {
			return Ok(true);
		}

		entries.insert(key, hash);
		Ok(false)
	}

	/// Forget the stored hash for `path` so the next check reports it as
	/// changed.
	pub fn invalidate(&self, path: &Path) {
		self.lock().remove(&normalize_path_key(path));
	}

	pub fn get(&self, path: &Path) -> Option<String> {
		self.lock().get(&normalize_path_key(path)).cloned()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	pub fn entries(&self) -> Vec<CacheEntry> {
		self.lock()
			.iter()
			.map(|(path, hash)| {
				CacheEntry {
					path: path.clone(),
					hash: hash.clone(),
				}
			})
			.collect()
	}

	/// Persist the cache through a temporary file and an atomic rename.
	pub fn save(&self, path: &Path) -> KilnResult<()> {
		let file = CacheFile {
			schema_version: CACHE_SCHEMA_VERSION,
			tool_version: TOOL_VERSION.to_string(),
			entries: self.entries(),
		};

		if let Some(cache_dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
			std::fs::create_dir_all(cache_dir).map_err(|e| KilnError::file_io(cache_dir, e))?;
		}

		let payload = serde_json::to_vec_pretty(&file)
			.map_err(|e| KilnError::Unknown(format!("failed to serialize cache: {e}")))?;

		let temp_path = path.with_extension(format!(
			"json.tmp-{}-{}",
			std::process::id(),
			SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map_or(0, |duration| duration.as_nanos())
		));

		std::fs::write(&temp_path, payload).map_err(|e| KilnError::file_io(&temp_path, e))?;

		if let Err(e) = std::fs::rename(&temp_path, path) {
			let _ = std::fs::remove_file(&temp_path);
			return Err(KilnError::file_io(path, e));
		}

		Ok(())
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
		self.entries.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// One run's view of a [`ContentCache`].
///
/// A file is checked against the cache at most once per run, so every step
/// reading the same template or input sees the same answer.
#[derive(Debug)]
pub struct ChangeTracker<'cache> {
	cache: &'cache ContentCache,
	checked: Mutex<BTreeMap<String, bool>>,
}

impl<'cache> ChangeTracker<'cache> {
	pub fn new(cache: &'cache ContentCache) -> Self {
		Self {
			cache,
			checked: Mutex::new(BTreeMap::new()),
		}
	}

	/// Whether `path` is unchanged since the previous run. The first call for
	/// a path records its new hash in the cache.
	pub fn is_unchanged(&self, path: &Path) -> KilnResult<bool> {
		let key = normalize_path_key(path);
		if let Some(unchanged) = self.lock().get(&key) {
			return Ok(*unchanged);
		}

		let unchanged = self.cache.check_and_update(path)?;
		Ok(*self.lock().entry(key).or_insert(unchanged))
	}

	/// Drop the cached hash of `path`. Answers already given in this run are
	/// kept so other steps still render the file.
	pub fn invalidate(&self, path: &Path) {
		self.cache.invalidate(path);
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, bool>> {
		self.checked.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Read-only health report for a cache file.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInspection {
	pub path: PathBuf,
	pub exists: bool,
	pub readable: bool,
	pub valid: bool,
	pub schema_version: Option<u32>,
	pub tool_version: Option<String>,
	pub schema_supported: bool,
	pub entry_count: usize,
}

/// Inspect a cache file without loading it into a [`ContentCache`].
pub fn inspect_cache(path: &Path) -> CacheInspection {
	let mut inspection = CacheInspection {
		path: path.to_path_buf(),
		exists: path.is_file(),
		readable: false,
		valid: false,
		schema_version: None,
		tool_version: None,
		schema_supported: false,
		entry_count: 0,
	};

	if !inspection.exists {
		return inspection;
	}

	let Ok(bytes) = std::fs::read(path) else {
		return inspection;
	};
	inspection.readable = true;

	let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
		return inspection;
	};

	inspection.schema_version = value
		.get("schema_version")
		.and_then(serde_json::Value::as_u64)
		.and_then(|version| u32::try_from(version).ok());
	inspection.tool_version = value
		.get("tool_version")
		.and_then(serde_json::Value::as_str)
		.map(ToString::to_string);
	inspection.schema_supported = inspection.schema_version == Some(CACHE_SCHEMA_VERSION)
		&& inspection.tool_version.as_deref() == Some(TOOL_VERSION);

	let Ok(file) = serde_json::from_value::<CacheFile>(value) else {
		return inspection;
	};

	inspection.valid = inspection.schema_supported;
	inspection.entry_count = file.entries.len();
	inspection
}

/// Hex-encoded SHA-256 digest of a file's bytes.
pub fn hash_file(path: &Path) -> KilnResult<String> {
	let bytes = std::fs::read(path).map_err(|e| KilnError::file_io(path, e))?;
	Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Cache key for a path: absolute, lexically cleaned and `/`-separated.
pub fn normalize_path_key(path: &Path) -> String {
	let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
	let mut cleaned = PathBuf::new();

	for component in absolute.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				cleaned.pop();
			}
			other => cleaned.push(other.as_os_str()),
		}
	}

	cleaned.to_string_lossy().replace('\\', "/")
}
