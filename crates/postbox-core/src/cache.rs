//! Webreference content cache.
//!
//! A reference starts out unfetched (`cached_size` is `None`). The first
//! access streams the remote body into a spool file, charges the owner's
//! quota for the exact byte count and commits the spool to a cache slot.
//! Failures leave the reference unfetched so a later access can retry.
//! Later accesses are served from the slot without touching the network.
//!
//! At most one fetch per reference is in flight; concurrent callers wait
//! for it and are then served from the cache.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use postbox_protocol::limits::KEYLIST_HEADER;
use postbox_protocol::KeyList;
use postbox_store::{BlobArea, BlobStore, PostboxDb, ReferenceId, ReferenceRecord, Spool, StoreError};

use crate::config::{FetchConfig, LimitsConfig};
use crate::fetch::{FetchRequest, RemoteSource, RequestContext};
use crate::guard::GuardRegistry;
use crate::{CoreError, Result};

/// Cached content of a webreference, ready to be served.
#[derive(Debug)]
pub struct CachedContent {
    /// Reference row as stored after caching.
    pub reference: ReferenceRecord,
    /// Size of the envelope in bytes.
    pub size: u64,
    /// Envelope bytes.
    pub body: File,
}

impl CachedContent {
    /// Key list of the reference.
    pub fn key_list(&self) -> &KeyList {
        &self.reference.key_list
    }

    /// `X-KEYLIST` response metadata.
    pub fn keylist_header(&self) -> Result<(&'static str, String)> {
        Ok((KEYLIST_HEADER, self.reference.key_list.to_json()?))
    }
}

/// Fetches and caches webreference content.
pub struct ContentCache {
    db: PostboxDb,
    blobs: BlobStore,
    source: Arc<dyn RemoteSource>,
    limits: LimitsConfig,
    fetch: FetchConfig,
    guards: GuardRegistry<ReferenceId>,
}

impl ContentCache {
    /// Create a cache over the given stores and remote source.
    pub fn new(
        db: PostboxDb,
        blobs: BlobStore,
        source: Arc<dyn RemoteSource>,
        limits: LimitsConfig,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            db,
            blobs,
            source,
            limits,
            fetch,
            guards: GuardRegistry::new(),
        }
    }

    /// Exclusive access to a reference; held by fetches and revocation.
    pub(crate) async fn lock(&self, reference_id: ReferenceId) -> OwnedMutexGuard<()> {
        self.guards.lock(reference_id).await
    }

    /// Serve a reference from the cache, fetching it first if needed.
    ///
    /// # Errors
    ///
    /// - `ReferenceGone` if the reference does not exist
    /// - `PayloadTooLarge` if the remote declares no length, declares or
    ///   sends more than the payload limit, or sends more than declared
    /// - `QuotaExceeded` if the owner cannot afford the content
    /// - `RemoteUnavailable` on network, status or timeout failures
    /// - `NoFreeSlot` if no cache slot could be allocated
    pub async fn fetch_or_get_cached(
        &self,
        reference_id: ReferenceId,
        context: &RequestContext,
    ) -> Result<CachedContent> {
        let _guard = self.lock(reference_id).await;

        // Re-read under the guard; a concurrent fetch may have finished.
        let mut reference = self
            .db
            .get_reference(reference_id)?
            .ok_or(CoreError::ReferenceGone(reference_id))?;

        if reference.is_cached() {
            match self.open_cached(&reference) {
                Ok(content) => {
                    debug!(reference_id, size = content.size, "serving cached reference");
                    return Ok(content);
                }
                Err(CoreError::Store(StoreError::NotFound(_))) => {
                    warn!(reference_id, "cached blob missing, fetching again");
                    self.forget_cached(&mut reference)?;
                }
                Err(e) => return Err(e),
            }
        }

        let request = FetchRequest {
            url: reference.url.clone(),
            referer: context.referer(),
        };
        let spool = match tokio::time::timeout(self.fetch.timeout, self.download(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::RemoteUnavailable(format!(
                "timed out after {:?}",
                self.fetch.timeout
            ))),
        }
        .map_err(|e| {
            warn!(reference_id, error = %e, "fetch failed");
            e
        })?;

        self.store(&mut reference, spool)?;
        info!(
            reference_id,
            owner = %reference.owner,
            size = reference.cached_size,
            "reference cached"
        );
        self.open_cached(&reference)
    }

    fn open_cached(&self, reference: &ReferenceRecord) -> Result<CachedContent> {
        let (token, size) = match (&reference.cached_content, reference.cached_size) {
            (Some(token), Some(size)) => (token, size),
            _ => return Err(CoreError::ReferenceGone(reference.id)),
        };
        let body = self.blobs.open_blob(BlobArea::Cached, &reference.owner, token)?;
        Ok(CachedContent {
            reference: reference.clone(),
            size,
            body,
        })
    }

    fn forget_cached(&self, reference: &mut ReferenceRecord) -> Result<()> {
        if let Some(size) = reference.cached_size.take() {
            self.db.release_quota(&reference.owner, size)?;
        }
        reference.cached_content = None;
        self.db.update_reference(reference)?;
        Ok(())
    }

    async fn download(&self, request: &FetchRequest) -> Result<Spool> {
        let limit = self.limits.max_payload_size;
        let mut body = self.source.get(request).await?;

        let declared = match body.content_length() {
            Some(length) if length <= limit => length,
            size => return Err(CoreError::PayloadTooLarge { size, limit }),
        };

        let mut spool = self.blobs.spool()?;
        let mut buffer = Vec::with_capacity(self.fetch.chunk_size.min(declared as usize));
        let mut received: u64 = 0;

        while let Some(chunk) = body.next_chunk().await? {
            received += chunk.len() as u64;
            if received > declared {
                return Err(CoreError::PayloadTooLarge {
                    size: Some(received),
                    limit,
                });
            }
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.fetch.chunk_size {
                spool = spill(spool, std::mem::take(&mut buffer)).await?;
            }
        }
        if !buffer.is_empty() {
            spool = spill(spool, buffer).await?;
        }

        if received < declared {
            return Err(CoreError::RemoteUnavailable(format!(
                "body ended after {} of {} bytes",
                received, declared
            )));
        }
        Ok(spool)
    }

    fn store(&self, reference: &mut ReferenceRecord, spool: Spool) -> Result<()> {
        let size = spool.len();
        self.db
            .charge_quota(&reference.owner, size, self.limits.max_used_space)?;

        let blob = match self.blobs.commit(spool, BlobArea::Cached, &reference.owner) {
            Ok(blob) => blob,
            Err(e) => {
                self.db.release_quota(&reference.owner, size)?;
                return Err(e.into());
            }
        };

        reference.cached_content = Some(blob.token.clone());
        reference.cached_size = Some(size);
        if let Err(e) = self.db.update_reference(reference) {
            self.blobs.remove(BlobArea::Cached, &reference.owner, &blob.token)?;
            self.db.release_quota(&reference.owner, size)?;
            return Err(match e {
                StoreError::NotFound(_) => CoreError::ReferenceGone(reference.id),
                other => other.into(),
            });
        }
        Ok(())
    }
}

/// Append to a spool on the blocking pool.
async fn spill(mut spool: Spool, data: Vec<u8>) -> Result<Spool> {
    let written = tokio::task::spawn_blocking(move || -> io::Result<Spool> {
        spool.write_all(&data)?;
        Ok(spool)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(written)
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("blobs", &self.blobs)
            .field("limits", &self.limits)
            .field("fetch", &self.fetch)
            .finish_non_exhaustive()
    }
}
