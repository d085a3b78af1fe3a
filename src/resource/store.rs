//! Persistence of managed server state, one JSON document per server.
//!
//! Records are keyed by the provider server number, which never changes for
//! the life of a resource; the declared name is only an attribute and can be
//! renamed in place.

use std::fs::Permissions as StdPermissions;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs::{OpenOptions, OpenOptionsExt}, fs_utf8::Dir};
use thiserror::Error;

use super::ManagedServerState;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Errors raised by state stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StateStoreError {
    /// Reading or writing the backing storage failed.
    #[error("state store I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Error message.
        message: String,
    },
    /// A stored document could not be decoded.
    #[error("state document {path} is invalid: {message}")]
    Parse {
        /// Document path.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
}

/// Read/write access to persisted resource state.
pub trait StateStore {
    /// Loads the state for `server_number`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the record exists but cannot be read.
    fn load(&self, server_number: u32) -> Result<Option<ManagedServerState>, StateStoreError>;

    /// Writes `state`, replacing any previous record for the same server.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the record cannot be written.
    fn save(&self, state: &ManagedServerState) -> Result<(), StateStoreError>;

    /// Deletes the record for `server_number`. Removing a missing record
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the record cannot be deleted.
    fn remove(&self, server_number: u32) -> Result<(), StateStoreError>;

    /// Returns every stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be listed or a
    /// record cannot be decoded.
    fn scan(&self) -> Result<Vec<ManagedServerState>, StateStoreError>;

    /// Finds the record currently declared under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be scanned.
    fn find_by_name(&self, name: &str) -> Result<Option<ManagedServerState>, StateStoreError> {
        Ok(self.scan()?.into_iter().find(|state| state.name() == name))
    }
}

/// Stores each server as `server-{number}.json` inside a private directory.
///
/// Documents hold the LUKS passphrase and the cluster token, so the
/// directory is kept at mode 0700 and every document at 0600. Writes go
/// through a temporary file that is renamed over the document.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    root: Utf8PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `root`. The directory is created on first
    /// write.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn document_name(server_number: u32) -> String {
        format!("server-{server_number}.json")
    }

    fn open_root(&self) -> Result<Option<Dir>, StateStoreError> {
        match Dir::open_ambient_dir(&self.root, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&self.root, &err)),
        }
    }

    fn create_root(&self) -> Result<Dir, StateStoreError> {
        Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))?;
        std::fs::set_permissions(&self.root, StdPermissions::from_mode(DIR_MODE))
            .map_err(|err| io_error(&self.root, &err))?;
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))
    }

    fn decode(&self, file: &str, contents: &str) -> Result<ManagedServerState, StateStoreError> {
        serde_json::from_str(contents).map_err(|err| StateStoreError::Parse {
            path: self.root.join(file),
            message: err.to_string(),
        })
    }
}

impl StateStore for FileStateStore {
    fn load(&self, server_number: u32) -> Result<Option<ManagedServerState>, StateStoreError> {
        let file = Self::document_name(server_number);
        let Some(dir) = self.open_root()? else {
            return Ok(None);
        };
        match dir.read_to_string(&file) {
            Ok(contents) => self.decode(&file, &contents).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&self.root.join(&file), &err)),
        }
    }

    fn save(&self, state: &ManagedServerState) -> Result<(), StateStoreError> {
        let file = Self::document_name(state.declared.server_number);
        let staging = format!(".{file}.tmp");
        let dir = self.create_root()?;
        let rendered =
            serde_json::to_string_pretty(state).map_err(|err| StateStoreError::Parse {
                path: self.root.join(&file),
                message: err.to_string(),
            })?;

        match dir.remove_file(&staging) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&self.root.join(&staging), &err)),
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true).mode(FILE_MODE);
        let mut handle = dir
            .open_with(&staging, &options)
            .map_err(|err| io_error(&self.root.join(&staging), &err))?;
        handle
            .write_all(rendered.as_bytes())
            .and_then(|()| handle.sync_all())
            .map_err(|err| io_error(&self.root.join(&staging), &err))?;
        dir.rename(&staging, &dir, &file)
            .map_err(|err| io_error(&self.root.join(&file), &err))
    }

    fn remove(&self, server_number: u32) -> Result<(), StateStoreError> {
        let file = Self::document_name(server_number);
        let Some(dir) = self.open_root()? else {
            return Ok(());
        };
        match dir.remove_file(&file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.root.join(&file), &err)),
        }
    }

    fn scan(&self) -> Result<Vec<ManagedServerState>, StateStoreError> {
        let Some(dir) = self.open_root()? else {
            return Ok(Vec::new());
        };
        let entries = dir
            .entries()
            .map_err(|err| io_error(&self.root, &err))?;

        let mut states = Vec::new();
        for item in entries {
            let entry = item.map_err(|err| io_error(&self.root, &err))?;
            let file = entry
                .file_name()
                .map_err(|err| io_error(&self.root, &err))?;
            if !(file.starts_with("server-") && file.ends_with(".json")) {
                continue;
            }
            let contents = dir
                .read_to_string(&file)
                .map_err(|err| io_error(&self.root.join(&file), &err))?;
            states.push(self.decode(&file, &contents)?);
        }
        states.sort_by(|left, right| left.name().cmp(right.name()));
        Ok(states)
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
