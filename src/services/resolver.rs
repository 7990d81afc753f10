//! Stream Resolution Service
//!
//! Turns a (video id, quality) pair into fetchable locations. Results are
//! cached for a short TTL because the locations are signed URLs that expire
//! on their own; lookups go through a [`ResolutionBackend`] and are bounded by
//! a deadline that does not depend on the caller staying connected.
//! Concurrent misses for the same key share a single lookup.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{HdFallback, ResolverConfig};
use crate::errors::{ResolutionError, ResolutionResult};
use crate::models::{Quality, ResolvedLocation, VideoId};
use crate::services::formats::{Criteria, FormatCatalog};

/// What the backend is asked to look up
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub video_id: VideoId,
    pub criteria: Criteria,
}

/// Raw backend answer, interpreted by the resolver
#[derive(Debug, Clone)]
pub enum BackendOutput {
    /// Candidate URLs, one per line
    Lines(String),
    /// Full format description
    Catalog(FormatCatalog),
}

/// External lookup mechanism. Implementations do not need their own timeout;
/// the resolver enforces one and drops the future when it expires.
#[async_trait]
pub trait ResolutionBackend: Send + Sync {
    async fn lookup(&self, request: &LookupRequest) -> ResolutionResult<BackendOutput>;

    fn name(&self) -> &'static str;
}

type CacheKey = (VideoId, Quality);

type SharedResolution = Shared<BoxFuture<'static, ResolutionResult<Arc<ResolvedLocation>>>>;

type InFlight = Arc<Mutex<HashMap<CacheKey, SharedResolution>>>;

/// Critical sections never await and never panic, so a poisoned lock still
/// holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    location: Arc<ResolvedLocation>,
    expires_at: Instant,
}

/// Short-lived, size-bounded resolution cache.
///
/// Expired entries are dropped when looked up; entries nobody asks for again
/// are pushed out by newer ones once `capacity` is reached.
#[derive(Debug)]
pub struct ResolutionCache {
    ttl: Duration,
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl ResolutionCache {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, video_id: &VideoId, quality: Quality) -> Option<Arc<ResolvedLocation>> {
        let key = (video_id.clone(), quality);
        let mut entries = lock(&self.entries);
        match entries.get(&key) {
            None => return None,
            Some(entry) if Instant::now() < entry.expires_at => {
                return Some(entry.location.clone());
            }
            Some(_) => {}
        }
        entries.pop(&key);
        debug!(video_id = %video_id, quality = %quality, "Evicted expired resolution");
        None
    }

    pub fn insert(
        &self,
        video_id: &VideoId,
        quality: Quality,
        location: ResolvedLocation,
    ) -> Arc<ResolvedLocation> {
        let location = Arc::new(location);
        let entry = CacheEntry {
            location: location.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        let displaced = lock(&self.entries).push((video_id.clone(), quality), entry);
        if let Some(((evicted_id, evicted_quality), _)) = displaced {
            if evicted_id != *video_id || evicted_quality != quality {
                debug!(video_id = %evicted_id, quality = %evicted_quality, "Cache full, dropped least recently used resolution");
            }
        }
        location
    }

    /// Stored entries, expired ones included until they are looked up or pushed out
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.entries).cap().get()
    }
}

/// Removes a key from the in-flight map when its lookup task ends, whether
/// it finished, failed or panicked.
struct InFlightSlot {
    in_flight: InFlight,
    key: CacheKey,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.key);
    }
}

/// Cached, deadline-bounded resolver
#[derive(Clone)]
pub struct StreamResolver {
    backend: Arc<dyn ResolutionBackend>,
    cache: Arc<ResolutionCache>,
    in_flight: InFlight,
    timeout: Duration,
    hd_fallback: HdFallback,
    mux_available: bool,
}

impl StreamResolver {
    pub fn new(
        backend: Arc<dyn ResolutionBackend>,
        config: &ResolverConfig,
        mux_available: bool,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            cache: Arc::new(ResolutionCache::new(config.cache_ttl, capacity)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            timeout: config.timeout,
            hd_fallback: config.hd_fallback,
            mux_available,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub async fn resolve(
        &self,
        video_id: &VideoId,
        quality: Quality,
    ) -> ResolutionResult<Arc<ResolvedLocation>> {
        if let Some(location) = self.cache.get(video_id, quality) {
            debug!(video_id = %video_id, quality = %quality, mode = location.mode(), "Resolution cache hit");
            return Ok(location);
        }

        let pending = {
            let key = (video_id.clone(), quality);
            let mut in_flight = lock(&self.in_flight);

            if let Some(pending) = in_flight.get(&key) {
                debug!(video_id = %video_id, quality = %quality, "Joining in-flight resolution");
                pending.clone()
            } else {
                // A lookup stores its result before leaving the map
                if let Some(location) = self.cache.get(video_id, quality) {
                    return Ok(location);
                }
                let pending = self.start_lookup(key.clone());
                in_flight.insert(key, pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Spawn the lookup detached so the deadline holds even if every caller
    /// goes away; a late success still lands in the cache.
    fn start_lookup(&self, key: CacheKey) -> SharedResolution {
        let (video_id, quality) = key.clone();
        let request = LookupRequest {
            video_id,
            criteria: Criteria::for_quality(quality, self.mux_available, self.hd_fallback),
        };
        let slot = InFlightSlot {
            in_flight: self.in_flight.clone(),
            key,
        };

        let task = tokio::spawn(Self::lookup_and_store(
            self.backend.clone(),
            self.cache.clone(),
            self.timeout,
            request,
            quality,
            slot,
        ));

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(ResolutionError::external_failure(format!(
                    "resolution task failed: {join_error}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    async fn lookup_and_store(
        backend: Arc<dyn ResolutionBackend>,
        cache: Arc<ResolutionCache>,
        timeout: Duration,
        request: LookupRequest,
        quality: Quality,
        _slot: InFlightSlot,
    ) -> ResolutionResult<Arc<ResolvedLocation>> {
        let started = Instant::now();
        let output = match tokio::time::timeout(timeout, backend.lookup(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    video_id = %request.video_id,
                    backend = backend.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Resolution timed out"
                );
                return Err(ResolutionError::ExternalTimeout { timeout });
            }
        };

        let location = match output {
            BackendOutput::Lines(text) => request.criteria.interpret_lines(&text)?,
            BackendOutput::Catalog(catalog) => catalog.select(&request.criteria)?,
        };

        info!(
            video_id = %request.video_id,
            quality = %quality,
            mode = location.mode(),
            backend = backend.name(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Resolved stream location"
        );

        Ok(cache.insert(&request.video_id, quality, location))
    }
}
