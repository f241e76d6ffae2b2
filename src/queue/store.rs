//! Durable storage behind the delivery queue.
//!
//! A store is a flat key-value namespace plus a single alarm slot. The queue
//! keeps one entry per pending job and uses the alarm to remember when it next
//! needs to wake up.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
	/// I/O operation failed (file read/write/delete).
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// A stored entry could not be encoded or decoded.
	#[error("Serialization error: {0}")]
	Codec(#[from] serde_json::Error),

	/// Internal error (lock poisoning, corrupted entries, etc.).
	#[error("Internal error: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<PoisonError<T>> for StoreError {
	fn from(e: PoisonError<T>) -> Self {
		Self::Internal(format!("Lock poisoned: {e}"))
	}
}

#[async_trait]
pub trait QueueStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

	/// Inserts or overwrites `key`.
	async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

	/// Removes `key`. Removing a key that isn't there is not an error.
	async fn delete(&self, key: &str) -> Result<()>;

	/// Every entry whose key starts with `prefix`, ordered by key.
	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

	async fn alarm(&self) -> Result<Option<u64>>;

	async fn set_alarm(&self, at: u64) -> Result<()>;

	async fn clear_alarm(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
	entries: BTreeMap<String, Vec<u8>>,
	alarm: Option<u64>,
}

/// Store kept entirely in memory.
///
/// Nothing survives a restart, so this is meant for tests and for running
/// without a configured `store_path`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl QueueStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		Ok(self.state.read()?.entries.get(key).cloned())
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
		self.state.write()?.entries.insert(key.to_string(), value);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self.state.write()?.entries.remove(key);
		Ok(())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
		Ok(self
			.state
			.read()?
			.entries
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect())
	}

	async fn alarm(&self) -> Result<Option<u64>> {
		Ok(self.state.read()?.alarm)
	}

	async fn set_alarm(&self, at: u64) -> Result<()> {
		self.state.write()?.alarm = Some(at);
		Ok(())
	}

	async fn clear_alarm(&self) -> Result<()> {
		self.state.write()?.alarm = None;
		Ok(())
	}
}

const ENTRY_EXTENSION: &str = "entry";
const KEYED_EXTENSION: &str = "keyed";
const ALARM_FILE: &str = "alarm";

/// Longest encoded key used directly as a file name. Leaves room for the
/// extension and the temporary suffix under the usual 255-byte limit.
const MAX_ENCODED_NAME: usize = 200;

/// Store backed by a directory, one file per entry.
///
/// Keys are arbitrary strings (report IDs come from whoever sent the report),
/// so file names are the URL-safe base64 encoding of the key. Keys too long
/// for that are stored under the SHA-256 of the key instead, with the key
/// written at the top of the file. Every write goes to a temporary file first
/// and is renamed into place, so an entry is either the old value or the new
/// one, never a mix.
#[derive(Debug, Clone)]
pub struct FileStore {
	root: PathBuf,
}

enum EntryPath {
	/// File name is the encoded key; the file holds only the value.
	Encoded(PathBuf),
	/// File name is a digest of the key; the file holds the key and the value.
	Keyed(PathBuf),
}

impl EntryPath {
	fn path(&self) -> &Path {
		match self {
			EntryPath::Encoded(path) | EntryPath::Keyed(path) => path,
		}
	}
}

/// `<base64 key>\n<value>`
fn encode_keyed(key: &str, value: &[u8]) -> Vec<u8> {
	let mut contents = base64::encode_config(key, base64::URL_SAFE_NO_PAD).into_bytes();
	contents.push(b'\n');
	contents.extend_from_slice(value);
	contents
}

fn decode_keyed(contents: &[u8]) -> Option<(String, Vec<u8>)> {
	let split = contents.iter().position(|b| *b == b'\n')?;
	let key = base64::decode_config(&contents[..split], base64::URL_SAFE_NO_PAD).ok()?;
	Some((String::from_utf8(key).ok()?, contents[split + 1..].to_vec()))
}

impl FileStore {
	/// Opens the store at `root`, creating the directory if needed.
	pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
		let root = root.as_ref().to_path_buf();
		tokio::fs::create_dir_all(&root).await?;
		debug!(path = %root.display(), "Opened queue store");
		Ok(Self { root })
	}

	fn entry_path(&self, key: &str) -> EntryPath {
		let name = base64::encode_config(key, base64::URL_SAFE_NO_PAD);
		if name.len() <= MAX_ENCODED_NAME {
			return EntryPath::Encoded(self.root.join(format!("{name}.{ENTRY_EXTENSION}")));
		}

		let mut hasher = Sha256::new();
		hasher.update(key.as_bytes());
		let digest = hex::encode(hasher.finalize());
		EntryPath::Keyed(self.root.join(format!("{digest}.{KEYED_EXTENSION}")))
	}

	fn decode_name(file_name: &str) -> Option<String> {
		let encoded = file_name.strip_suffix(&format!(".{ENTRY_EXTENSION}"))?;
		let bytes = base64::decode_config(encoded, base64::URL_SAFE_NO_PAD).ok()?;
		String::from_utf8(bytes).ok()
	}

	async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
		let mut temporary = path.as_os_str().to_owned();
		temporary.push(".tmp");
		let temporary = PathBuf::from(temporary);

		tokio::fs::write(&temporary, contents).await?;
		tokio::fs::rename(&temporary, path).await?;
		Ok(())
	}

	async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
		match tokio::fs::read(path).await {
			Ok(contents) => Ok(Some(contents)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn remove_optional(path: &Path) -> Result<()> {
		match tokio::fs::remove_file(path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Reads a keyed file, giving nothing back if it belongs to a different
	/// key with the same digest.
	async fn read_keyed(path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
		let contents = match Self::read_optional(path).await? {
			Some(contents) => contents,
			None => return Ok(None),
		};

		match decode_keyed(&contents) {
			Some((stored, value)) if stored == key => Ok(Some(value)),
			Some(_) => Ok(None),
			None => Err(StoreError::Internal(format!("Unreadable entry {}", path.display()))),
		}
	}
}

#[async_trait]
impl QueueStore for FileStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		match self.entry_path(key) {
			EntryPath::Encoded(path) => Self::read_optional(&path).await,
			EntryPath::Keyed(path) => Self::read_keyed(&path, key).await,
		}
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
		match self.entry_path(key) {
			EntryPath::Encoded(path) => self.write_atomic(&path, &value).await,
			EntryPath::Keyed(path) => {
				match Self::read_optional(&path).await?.as_deref().and_then(decode_keyed) {
					Some((stored, _)) if stored != key => {
						return Err(StoreError::Internal(format!("Digest collision between {stored:?} and {key:?}")));
					}
					_ => {}
				}
				self.write_atomic(&path, &encode_keyed(key, &value)).await
			}
		}
	}

	async fn delete(&self, key: &str) -> Result<()> {
		match self.entry_path(key) {
			EntryPath::Encoded(path) => Self::remove_optional(&path).await,
			EntryPath::Keyed(path) => {
				if Self::read_keyed(&path, key).await?.is_some() {
					Self::remove_optional(&path).await?;
				}
				Ok(())
			}
		}
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
		let mut listed = Vec::new();
		let mut entries = tokio::fs::read_dir(&self.root).await?;

		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			let file_name = match entry.file_name().to_str() {
				Some(file_name) => file_name.to_string(),
				None => continue,
			};

			if let Some(key) = Self::decode_name(&file_name) {
				if !key.starts_with(prefix) {
					continue;
				}
				// an entry deleted between the directory scan and the read is skipped
				if let Some(value) = Self::read_optional(&path).await? {
					listed.push((key, value));
				}
			} else if file_name.ends_with(&format!(".{KEYED_EXTENSION}")) {
				let contents = match Self::read_optional(&path).await? {
					Some(contents) => contents,
					None => continue,
				};
				match decode_keyed(&contents) {
					Some((key, value)) if key.starts_with(prefix) => listed.push((key, value)),
					Some(_) => {}
					None => return Err(StoreError::Internal(format!("Unreadable entry {}", path.display()))),
				}
			}
		}

		listed.sort_by(|a, b| a.0.cmp(&b.0));
		Ok(listed)
	}

	async fn alarm(&self) -> Result<Option<u64>> {
		let contents = match Self::read_optional(&self.root.join(ALARM_FILE)).await? {
			Some(contents) => contents,
			None => return Ok(None),
		};

		let text = String::from_utf8_lossy(&contents);
		text.trim()
			.parse()
			.map(Some)
			.map_err(|e| StoreError::Internal(format!("Unreadable alarm value {:?}: {e}", text.trim())))
	}

	async fn set_alarm(&self, at: u64) -> Result<()> {
		self.write_atomic(&self.root.join(ALARM_FILE), at.to_string().as_bytes())
			.await
	}

	async fn clear_alarm(&self) -> Result<()> {
		Self::remove_optional(&self.root.join(ALARM_FILE)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn exercise(store: &dyn QueueStore) {
		store.put("job:b", b"2".to_vec()).await.unwrap();
		store.put("job:a", b"1".to_vec()).await.unwrap();
		store.put("other", b"x".to_vec()).await.unwrap();
		store.put("job:a", b"1'".to_vec()).await.unwrap();

		assert_eq!(store.get("job:a").await.unwrap(), Some(b"1'".to_vec()));
		assert_eq!(store.get("job:missing").await.unwrap(), None);

		let listed = store.list("job:").await.unwrap();
		assert_eq!(
			listed,
			vec![
				("job:a".to_string(), b"1'".to_vec()),
				("job:b".to_string(), b"2".to_vec()),
			]
		);

		store.delete("job:a").await.unwrap();
		store.delete("job:a").await.unwrap();
		assert_eq!(store.list("job:").await.unwrap().len(), 1);

		assert_eq!(store.alarm().await.unwrap(), None);
		store.set_alarm(1_700_000_000_000).await.unwrap();
		assert_eq!(store.alarm().await.unwrap(), Some(1_700_000_000_000));
		store.clear_alarm().await.unwrap();
		store.clear_alarm().await.unwrap();
		assert_eq!(store.alarm().await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_memory_store() {
		exercise(&MemoryStore::new()).await;
	}

	#[tokio::test]
	async fn test_file_store() {
		let dir = tempfile::tempdir().unwrap();
		exercise(&FileStore::open(dir.path()).await.unwrap()).await;
	}

	#[tokio::test]
	async fn test_file_store_keys_with_path_characters() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::open(dir.path().join("nested")).await.unwrap();
		let key = "job:../../etc/passwd!@example.com";

		store.put(key, b"ok".to_vec()).await.unwrap();

		assert_eq!(store.list("job:").await.unwrap(), vec![(key.to_string(), b"ok".to_vec())]);
	}

	#[tokio::test]
	async fn test_file_store_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = FileStore::open(dir.path()).await.unwrap();
			store.put("job:a", b"1".to_vec()).await.unwrap();
			store.set_alarm(42).await.unwrap();
		}

		let store = FileStore::open(dir.path()).await.unwrap();
		assert_eq!(store.get("job:a").await.unwrap(), Some(b"1".to_vec()));
		assert_eq!(store.alarm().await.unwrap(), Some(42));
	}

	#[tokio::test]
	async fn test_file_store_long_keys() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::open(dir.path()).await.unwrap();
		let long = format!("job:{}", "x".repeat(300));
		let longer = format!("job:{}", "x".repeat(301));

		store.put(&long, b"1".to_vec()).await.unwrap();
		store.put(&longer, b"2".to_vec()).await.unwrap();
		store.put("job:short", b"3".to_vec()).await.unwrap();
		store.put(&long, b"1'".to_vec()).await.unwrap();

		assert_eq!(store.get(&long).await.unwrap(), Some(b"1'".to_vec()));
		assert_eq!(
			store.list("job:").await.unwrap(),
			vec![
				("job:short".to_string(), b"3".to_vec()),
				(long.clone(), b"1'".to_vec()),
				(longer.clone(), b"2".to_vec()),
			]
		);

		store.delete(&long).await.unwrap();
		assert_eq!(store.get(&long).await.unwrap(), None);
		assert_eq!(store.list("job:").await.unwrap().len(), 2);
	}

	#[test]
	fn test_keyed_contents() {
		let contents = encode_keyed("job:a\nb", b"value\nwith lines");
		assert_eq!(
			decode_keyed(&contents),
			Some(("job:a\nb".to_string(), b"value\nwith lines".to_vec()))
		);
		assert_eq!(decode_keyed(b"no separator"), None);
	}
}
