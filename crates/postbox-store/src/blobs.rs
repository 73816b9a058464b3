//! Filesystem blob slots.
//!
//! Blobs live at `<root>/<area>/<owner dir>/<token>.encrypted` where the owner
//! dir is the hex SHA-256 of the owner id and the token is random and
//! URL-safe. Incoming data is first written to a spool file under
//! `<root>/tmp` and only moved into a slot once complete; a slot is never
//! overwritten.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use postbox_crypto::HashAlgorithm;
use postbox_protocol::limits::{MAX_SLOT_ATTEMPTS, TOKEN_BYTES};

use crate::{Result, StoreError};

/// File extension of stored blobs.
pub const BLOB_EXTENSION: &str = "encrypted";

const SPOOL_DIR: &str = "tmp";

/// Generate a random URL-safe token.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Which kind of content a blob holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobArea {
    /// Fetched webreference content.
    Cached,
    /// Envelopes of messages sent from a postbox.
    Sending,
}

impl BlobArea {
    /// Directory name of the area.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Sending => "sending",
        }
    }
}

/// A committed blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    /// Slot token.
    pub token: String,
    /// Size in bytes.
    pub size: u64,
}

/// Partially written content waiting to be committed to a slot.
///
/// Dropping a spool deletes its file.
#[derive(Debug)]
pub struct Spool {
    file: NamedTempFile,
    written: u64,
}

impl Spool {
    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.written
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }
}

impl Write for Spool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Blob storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open blob storage, creating the directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(SPOOL_DIR))?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new spool file.
    pub fn spool(&self) -> Result<Spool> {
        let file = NamedTempFile::new_in(self.root.join(SPOOL_DIR))?;
        Ok(Spool { file, written: 0 })
    }

    fn owner_dir(&self, area: BlobArea, owner: &str) -> PathBuf {
        self.root
            .join(area.dir_name())
            .join(HashAlgorithm::Sha256.hex_digest(owner.as_bytes()))
    }

    /// Path of a slot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if the token cannot be used as a single path
    /// component.
    pub fn slot_path(&self, area: BlobArea, owner: &str, token: &str) -> Result<PathBuf> {
        check_component(token)?;
        Ok(self
            .owner_dir(area, owner)
            .join(format!("{}.{}", token, BLOB_EXTENSION)))
    }

    /// Move a complete spool into a fresh slot.
    ///
    /// Tries up to `MAX_SLOT_ATTEMPTS` random tokens. Existing slots are
    /// skipped and the final move refuses to overwrite; a collision at that
    /// point counts as a failed attempt.
    pub fn commit(&self, spool: Spool, area: BlobArea, owner: &str) -> Result<StoredBlob> {
        self.commit_with(spool, area, owner, random_token)
    }

    pub(crate) fn commit_with(
        &self,
        spool: Spool,
        area: BlobArea,
        owner: &str,
        mut next_token: impl FnMut() -> String,
    ) -> Result<StoredBlob> {
        let Spool { mut file, written } = spool;
        file.as_file().sync_all()?;
        fs::create_dir_all(self.owner_dir(area, owner))?;

        for attempt in 0..MAX_SLOT_ATTEMPTS {
            let token = next_token();
            let path = self.slot_path(area, owner, &token)?;
            if path.exists() {
                debug!(attempt, "blob slot taken");
                continue;
            }
            match file.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(area = area.dir_name(), owner, size = written, "blob committed");
                    return Ok(StoredBlob {
                        token,
                        size: written,
                    });
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(attempt, "blob slot taken during commit");
                    file = e.file;
                }
                Err(e) => return Err(StoreError::Io(e.error)),
            }
        }

        warn!(owner, "no free blob slot");
        Err(StoreError::NoFreeSlot {
            attempts: MAX_SLOT_ATTEMPTS,
        })
    }

    /// Open a blob for reading.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the slot is empty.
    pub fn open_blob(&self, area: BlobArea, owner: &str, token: &str) -> Result<File> {
        let path = self.slot_path(area, owner, token)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(format!("blob {}", token)),
            _ => StoreError::Io(e),
        })
    }

    /// Remove a blob. Returns `false` if it did not exist.
    pub fn remove(&self, area: BlobArea, owner: &str, token: &str) -> Result<bool> {
        let path = self.slot_path(area, owner, token)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

fn check_component(component: &str) -> Result<()> {
    let valid = !component.is_empty()
        && !component.starts_with('.')
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(component.to_string()))
    }
}
