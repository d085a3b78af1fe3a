//! Order transaction tracking with a persisted short-lived cache.
//!
//! Transactions are looked up through [`TransactionCache::fetch`]. Terminal
//! statuses (`ready`, `cancelled`) are answered from the cache; pending ones
//! are refetched from the provider on every read. The cache is written to a
//! JSON file after each update, through a temporary file renamed into
//! place, and entries older than [`CACHE_TTL`] are
//! dropped when the file is loaded.

use std::collections::HashMap;
use std::env;
use std::io;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::robot::{RobotApi, RobotError, Transaction};

mod orders;

pub use orders::{OrderLifecycle, OrderRequest};

/// Age after which a persisted entry is discarded at load time.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Directory, relative to the working directory, holding cache files.
pub const DEFAULT_CACHE_DIR: &str = ".cache";

/// Errors raised while tracking orders.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransactionError {
    /// The provider call failed.
    #[error(transparent)]
    Robot(#[from] RobotError),
    /// Orders cannot be changed once placed.
    #[error("order {id} cannot be modified; cancel it and place a new order")]
    ImmutableOrder {
        /// Transaction identifier.
        id: String,
    },
}

/// The two order flavours, each with its own endpoints and cache file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Standard product order.
    Standard,
    /// Server market (auction) order.
    Market,
}

impl OrderKind {
    /// File name of the cache inside the cache directory.
    #[must_use]
    pub const fn cache_file_name(self) -> &'static str {
        match self {
            Self::Standard => "transaction-cache.json",
            Self::Market => "market-transaction-cache.json",
        }
    }

    /// File name used when falling back to the system temp directory.
    #[must_use]
    pub const fn temp_file_name(self) -> &'static str {
        match self {
            Self::Standard => "hrobot-transaction-cache.json",
            Self::Market => "hrobot-market-transaction-cache.json",
        }
    }

    /// Resolves the cache file location.
    ///
    /// A configured directory wins. Otherwise the file lives under
    /// [`DEFAULT_CACHE_DIR`] in the working directory, or in the system
    /// temp directory when the working directory is unavailable.
    #[must_use]
    pub fn cache_path(self, configured: Option<&str>) -> Option<Utf8PathBuf> {
        if let Some(dir) = configured.filter(|dir| !dir.trim().is_empty()) {
            return Some(Utf8Path::new(dir).join(self.cache_file_name()));
        }
        if let Some(cwd) = env::current_dir()
            .ok()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        {
            return Some(cwd.join(DEFAULT_CACHE_DIR).join(self.cache_file_name()));
        }
        Utf8PathBuf::from_path_buf(env::temp_dir())
            .ok()
            .map(|tmp| tmp.join(self.temp_file_name()))
    }

    async fn fetch<A: RobotApi + ?Sized>(self, api: &A, id: &str) -> Result<Transaction, RobotError> {
        match self {
            Self::Standard => api.get_order_transaction(id).await,
            Self::Market => api.get_market_transaction(id).await,
        }
    }
}

/// A cached transaction and the time it was last written.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CachedTransaction {
    /// Provider snapshot.
    pub transaction: Transaction,
    /// When the snapshot was stored.
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

/// Cache of transactions for one [`OrderKind`].
#[derive(Debug)]
pub struct TransactionCache {
    kind: OrderKind,
    path: Option<Utf8PathBuf>,
    entries: RwLock<HashMap<String, CachedTransaction>>,
}

impl TransactionCache {
    /// Creates an empty cache that is never written to disk.
    #[must_use]
    pub fn in_memory(kind: OrderKind) -> Self {
        Self {
            kind,
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Opens the cache backed by `path`, discarding entries older than
    /// [`CACHE_TTL`]. A missing or unreadable file yields an empty cache.
    #[must_use]
    pub fn open(kind: OrderKind, path: Utf8PathBuf) -> Self {
        Self::open_at(kind, path, Utc::now())
    }

    fn open_at(kind: OrderKind, path: Utf8PathBuf, now: DateTime<Utc>) -> Self {
        let entries = match read_entries(&path) {
            Ok(Some(stored)) => {
                let total = stored.len();
                let fresh: HashMap<_, _> = stored
                    .into_iter()
                    .filter(|(_, entry)| is_fresh(entry, now))
                    .collect();
                debug!(path = %path, total, kept = fresh.len(), "transaction cache loaded");
                fresh
            }
            Ok(None) => HashMap::new(),
            Err(message) => {
                warn!(path = %path, error = %message, "ignoring unreadable transaction cache");
                HashMap::new()
            }
        };
        Self {
            kind,
            path: Some(path),
            entries: RwLock::new(entries),
        }
    }

    /// Order flavour this cache tracks.
    #[must_use]
    pub const fn kind(&self) -> OrderKind {
        self.kind
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Returns the cached snapshot for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.read()
            .get(id)
            .map(|entry| entry.transaction.clone())
    }

    /// Stores `transaction` and writes the cache file.
    ///
    /// The file is written while the entries are still locked, so
    /// concurrent updates land on disk in the order they were made.
    pub fn insert(&self, transaction: Transaction) {
        let id = transaction.id.clone();
        let mut entries = self.write();
        entries.insert(
            id,
            CachedTransaction {
                transaction,
                last_updated: Utc::now(),
            },
        );
        self.persist(&entries);
    }

    /// Drops `id` from the cache.
    pub fn forget(&self, id: &str) {
        let mut entries = self.write();
        if entries.remove(id).is_some() {
            self.persist(&entries);
        }
    }

    /// Returns the transaction, calling the provider only when it is not
    /// cached or its cached status is still pending.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Robot`] when the provider call fails.
    pub async fn fetch<A: RobotApi + ?Sized>(
        &self,
        api: &A,
        id: &str,
    ) -> Result<Transaction, TransactionError> {
        if let Some(cached) = self.get(id).filter(|cached| !cached.status.is_pending()) {
            debug!(transaction_id = id, status = %cached.status, "transaction served from cache");
            return Ok(cached);
        }

        let fresh = self.kind.fetch(api, id).await?;
        info!(transaction_id = id, status = %fresh.status, "transaction refreshed");
        self.insert(fresh.clone());
        Ok(fresh)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CachedTransaction>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CachedTransaction>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &HashMap<String, CachedTransaction>) {
        let Some(ref path) = self.path else {
            return;
        };
        let result = serde_json::to_string_pretty(entries)
            .map_err(|err| err.to_string())
            .and_then(|contents| write_file(path, &contents).map_err(|err| err.to_string()));
        if let Err(message) = result {
            warn!(path = %path, error = %message, "failed to write transaction cache");
        }
    }
}

/// Entries stamped in the future are kept.
fn is_fresh(entry: &CachedTransaction, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(entry.last_updated)
        .to_std()
        .map_or(true, |age| age <= CACHE_TTL)
}

fn split(path: &Utf8Path) -> io::Result<(&Utf8Path, &str)> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} is not a file path"),
        )),
    }
}

fn read_entries(path: &Utf8Path) -> Result<Option<HashMap<String, CachedTransaction>>, String> {
    let (parent, name) = split(path).map_err(|err| err.to_string())?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };
    let contents = match dir.read_to_string(name) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|err| err.to_string())
}

fn write_file(path: &Utf8Path, contents: &str) -> io::Result<()> {
    let (parent, name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    let staging = format!(".{name}.tmp");
    dir.write(&staging, contents)?;
    dir.rename(&staging, &dir, name)
}
