//! RocksDB-backed offline queue and push token table.
//!
//! Column families:
//! - `offline`       — Queued envelopes (bincode record, LZ4 compressed payload)
//! - `offline_index` — message_id → offline key, for delivered-ack cleanup
//! - `push_tokens`   — user id → device push token
//!
//! Key layout (all integers big-endian, so byte order is replay order):
//! ```text
//! offline:       ┌─────────┬──────────┬─────────────┬──────────┐
//!                │ len u16 │ receiver │ enqueued µs │ seq u64  │
//!                └─────────┴──────────┴─────────────┴──────────┘
//! offline_index: ┌─────────┬──────────┬─────────┬────────────┬─────────────┐
//!                │ len u16 │ receiver │ len u16 │ message_id │ offline key │
//!                └─────────┴──────────┴─────────┴────────────┴─────────────┘
//! ```
//!
//! The length prefix keeps `"ab"` from ever scanning into `"abc"`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_OFFLINE: &str = "offline";
const CF_OFFLINE_INDEX: &str = "offline_index";
const CF_PUSH_TOKENS: &str = "push_tokens";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_OFFLINE, CF_OFFLINE_INDEX, CF_PUSH_TOKENS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("courier_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// An envelope waiting for its receiver to come online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEntry {
    pub entry_id: Uuid,
    pub receiver_id: String,
    /// Microseconds since epoch
    pub enqueued_at: u64,
    pub message_id: Option<String>,
    /// Encoded envelope, written to the socket as-is on replay
    pub payload: String,
}

/// On-disk form of [`OfflineEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OfflineRecord {
    entry_id: Uuid,
    receiver_id: String,
    enqueued_at: u64,
    message_id: Option<String>,
    /// LZ4 with prepended size
    payload: Vec<u8>,
}

impl OfflineRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }

    fn into_entry(self) -> Result<OfflineEntry, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let payload = String::from_utf8(raw)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(OfflineEntry {
            entry_id: self.entry_id,
            receiver_id: self.receiver_id,
            enqueued_at: self.enqueued_at,
            message_id: self.message_id,
            payload,
        })
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Identifier cannot be encoded into a key
    InvalidKey(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::InvalidKey(e) => write!(f, "Invalid key: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed relay store.
///
/// Safe to share behind an `Arc`; every operation is a short synchronous call.
pub struct RelayStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Tie-breaker for entries enqueued in the same microsecond
    sequence: AtomicU64,
}

impl RelayStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024); // 64MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Relay store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(0),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OFFLINE => {
                // Append-mostly, prefix-scanned per receiver on reconnect
                opts.set_max_write_buffer_number(4);
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_OFFLINE_INDEX => {
                // Tiny keys, empty values
                opts.set_max_write_buffer_number(2);
            }
            CF_PUSH_TOKENS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Offline Queue ────────────────────────────────────────────────

    /// Persist an envelope for `receiver_id`.
    ///
    /// With a `message_id`, the entry is also indexed so a delivered
    /// acknowledgment can remove it.
    pub fn enqueue(
        &self,
        receiver_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<OfflineEntry, StoreError> {
        let cf_offline = self.cf(CF_OFFLINE)?;
        let cf_index = self.cf(CF_OFFLINE_INDEX)?;

        let enqueued_at = now_micros();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::offline_key(receiver_id, enqueued_at, seq)?;

        let record = OfflineRecord {
            entry_id: Uuid::new_v4(),
            receiver_id: receiver_id.to_string(),
            enqueued_at,
            message_id: message_id.map(str::to_string),
            payload: lz4_flex::compress_prepend_size(payload.as_bytes()),
        };

        // Entry and index land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_offline, &key, &record.encode()?);
        if let Some(message_id) = message_id {
            let index_key = Self::index_key(receiver_id, message_id, &key)?;
            batch.put_cf(&cf_index, &index_key, b"");
        }
        self.write(batch)?;

        Ok(OfflineEntry {
            entry_id: record.entry_id,
            receiver_id: record.receiver_id,
            enqueued_at,
            message_id: record.message_id,
            payload: payload.to_string(),
        })
    }

    /// All queued entries for `receiver_id`, oldest first. Nothing is removed.
    pub fn pending_for(&self, receiver_id: &str) -> Result<Vec<OfflineEntry>, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let prefix = Self::receiver_prefix(receiver_id)?;

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(OfflineRecord::decode(&value)?.into_entry()?);
        }

        Ok(entries)
    }

    /// Number of queued entries for `receiver_id`.
    pub fn pending_count(&self, receiver_id: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let prefix = Self::receiver_prefix(receiver_id)?;

        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Delete every entry for `receiver_id` indexed under `message_id`.
    ///
    /// Idempotent: a second call finds nothing and returns 0.
    pub fn delete_by_message_id(
        &self,
        receiver_id: &str,
        message_id: &str,
    ) -> Result<usize, StoreError> {
        let cf_offline = self.cf(CF_OFFLINE)?;
        let cf_index = self.cf(CF_OFFLINE_INDEX)?;
        let prefix = Self::index_prefix(receiver_id, message_id)?;

        let mut batch = WriteBatch::default();
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_offline, &key[prefix.len()..]);
            batch.delete_cf(&cf_index, &key);
            count += 1;
        }

        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }

    /// Drop the whole queue of `receiver_id`, index included.
    pub fn purge_receiver(&self, receiver_id: &str) -> Result<usize, StoreError> {
        let cf_offline = self.cf(CF_OFFLINE)?;
        let cf_index = self.cf(CF_OFFLINE_INDEX)?;
        let prefix = Self::receiver_prefix(receiver_id)?;

        let entries = self.keys_with_prefix(cf_offline, &prefix)?;
        let index = self.keys_with_prefix(cf_index, &prefix)?;

        let mut batch = WriteBatch::default();
        for key in &entries {
            batch.delete_cf(&cf_offline, key);
        }
        for key in &index {
            batch.delete_cf(&cf_index, key);
        }
        if !entries.is_empty() || !index.is_empty() {
            self.write(batch)?;
        }
        Ok(entries.len())
    }

    // ─── Push Tokens ──────────────────────────────────────────────────

    pub fn set_push_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_PUSH_TOKENS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, user_id.as_bytes(), token.as_bytes(), &write_opts)?;
        Ok(())
    }

    pub fn push_token(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_PUSH_TOKENS)?;
        match self.db.get_cf(&cf, user_id.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Remove a user's token. Returns whether one existed.
    pub fn clear_push_token(&self, user_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_PUSH_TOKENS)?;
        let existed = self.db.get_cf(&cf, user_id.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(&cf, user_id.as_bytes())?;
        }
        Ok(existed)
    }

    /// Flush memtables to disk (called on shutdown).
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn keys_with_prefix(
        &self,
        cf: &rocksdb::ColumnFamily,
        prefix: &[u8],
    ) -> Result<Vec<Box<[u8]>>, StoreError> {
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Length-prefixed identifier.
    fn push_segment(key: &mut Vec<u8>, segment: &str) -> Result<(), StoreError> {
        let len = u16::try_from(segment.len())
            .map_err(|_| StoreError::InvalidKey(format!("{} bytes exceeds u16", segment.len())))?;
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(segment.as_bytes());
        Ok(())
    }

    fn receiver_prefix(receiver_id: &str) -> Result<Vec<u8>, StoreError> {
        let mut key = Vec::with_capacity(2 + receiver_id.len());
        Self::push_segment(&mut key, receiver_id)?;
        Ok(key)
    }

    fn offline_key(receiver_id: &str, enqueued_at: u64, seq: u64) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::receiver_prefix(receiver_id)?;
        key.extend_from_slice(&enqueued_at.to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    fn index_prefix(receiver_id: &str, message_id: &str) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::receiver_prefix(receiver_id)?;
        Self::push_segment(&mut key, message_id)?;
        Ok(key)
    }

    fn index_key(
        receiver_id: &str,
        message_id: &str,
        offline_key: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::index_prefix(receiver_id, message_id)?;
        key.extend_from_slice(offline_key);
        Ok(key)
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
