//! Immutable fetch/insert configuration.
//!
//! `FetchContext`/`InsertContext` mirror the teacher's [`crate::archive::PackOptions`]
//! pattern: a `Default` base plus named builder methods that return an
//! overridden copy, rather than a constructor with a long positional
//! argument list. `ArchiveContext` is the one piece of *mutable* per-request
//! state, threaded by reference as the fetch descends.

use crate::bucket::Bucket;
use crate::compression::CompressionCodecId;
use crate::uri::{ContentURI, RoutingKey};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{event, Level};

/// Structured events fired at the boundaries the original `EventSink` would
/// have fired. `tracing` underneath carries the free-form operational log;
/// this is the typed, caller-visible channel on top of it.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    BlockReceived { key: RoutingKey },
    BlockFailed { key: RoutingKey, reason: String },
    SegmentDecoded { segment_index: usize },
    ArchiveExtracted { entry_count: usize },
    MetadataParsed,
    FetchCompleted { bytes: u64 },
    FetchFailed { reason: String },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: FetchEvent);
}

/// Default sink: every event becomes a `tracing` event at an appropriate
/// level, nothing else.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: FetchEvent) {
        match &event {
            FetchEvent::BlockFailed { key, reason } => {
                event!(Level::WARN, ?key, %reason, "block fetch failed");
            }
            FetchEvent::FetchFailed { reason } => {
                event!(Level::WARN, %reason, "fetch failed");
            }
            other => event!(Level::DEBUG, ?other, "fetch event"),
        }
    }
}

pub struct NullEventSink;
impl EventSink for NullEventSink {
    fn on_event(&self, _event: FetchEvent) {}
}

#[derive(Clone)]
pub struct FetchContext {
    pub max_output_len: u64,
    pub max_temp_len: u64,
    pub max_metadata_size: u64,
    pub max_recursion_level: u32,
    pub max_archive_restarts: u32,
    pub max_archive_levels: u32,
    pub dont_enter_implicit_archives: bool,
    pub max_splitfile_workers: usize,
    pub max_splitfile_block_retries: u32,
    pub max_nonsplit_retries: u32,
    pub allow_splitfiles: bool,
    pub follow_redirects: bool,
    pub local_only: bool,
    pub ignore_store: bool,
    pub max_data_blocks_per_segment: u32,
    pub max_check_blocks_per_segment: u32,
    pub cache_local_requests: bool,
    pub return_archive_manifests_as_data: bool,
    pub ignore_too_many_path_components: bool,
    pub event_sink: Arc<dyn EventSink>,
    pub allowed_mime_types: Option<Vec<String>>,
    pub prefetched_blocks: Option<HashMap<RoutingKey, Arc<dyn Bucket>>>,
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            max_output_len: 64 * 1024 * 1024 * 1024,
            max_temp_len: 64 * 1024 * 1024 * 1024,
            max_metadata_size: 2 * 1024 * 1024,
            max_recursion_level: 10,
            max_archive_restarts: 2,
            max_archive_levels: 4,
            dont_enter_implicit_archives: false,
            max_splitfile_workers: 16,
            max_splitfile_block_retries: 3,
            max_nonsplit_retries: 3,
            allow_splitfiles: true,
            follow_redirects: true,
            local_only: false,
            ignore_store: false,
            max_data_blocks_per_segment: 128,
            max_check_blocks_per_segment: 64,
            cache_local_requests: true,
            return_archive_manifests_as_data: false,
            ignore_too_many_path_components: false,
            event_sink: Arc::new(TracingEventSink),
            allowed_mime_types: None,
            prefetched_blocks: None,
        }
    }
}

impl FetchContext {
    /// Override used for the per-block fetch inside a splitfile: one level
    /// of recursion only, no nested splitfiles or archives, since a
    /// splitfile's own data/check blocks are always raw CHKs.
    pub fn splitfile_default_block_mask(&self) -> Self {
        Self {
            max_recursion_level: 1,
            allow_splitfiles: false,
            max_archive_levels: 0,
            dont_enter_implicit_archives: true,
            event_sink: self.event_sink.clone(),
            ..self.clone()
        }
    }

    /// Override used when the caller wants an `ArchiveManifest` handed back
    /// as opaque data instead of being auto-entered.
    pub fn preset_return_archives(&self) -> Self {
        Self { return_archive_manifests_as_data: true, event_sink: self.event_sink.clone(), ..self.clone() }
    }

    pub fn mime_allowed(&self, mime: &str) -> bool {
        match &self.allowed_mime_types {
            None => true,
            Some(list) => list.iter().any(|m| m == mime),
        }
    }
}

#[derive(Clone)]
pub struct InsertContext {
    pub default_codec: CompressionCodecId,
    pub compression_level: i32,
    pub splitfile_segment_data_blocks: u32,
    pub splitfile_segment_check_blocks: u32,
    pub max_insert_retries: u32,
    pub max_manifest_padding: usize,
    pub get_cypher_key: Option<Vec<u8>>,
}

impl Default for InsertContext {
    fn default() -> Self {
        Self {
            default_codec: CompressionCodecId::Gzip,
            compression_level: 6,
            splitfile_segment_data_blocks: 128,
            splitfile_segment_check_blocks: 64,
            max_insert_retries: 3,
            max_manifest_padding: 64,
            get_cypher_key: None,
        }
    }
}

impl InsertContext {
    /// Override used when a caller wants to skip compression entirely
    /// (e.g. already-compressed payloads like archive containers).
    pub fn preset_no_compression(&self) -> Self {
        Self { compression_level: 0, ..self.clone() }
    }
}

/// Re-usable descriptor a caller keeps per logical archive reference.
#[derive(Debug, Clone)]
pub struct ArchiveHandler {
    pub key: ContentURI,
    pub kind: crate::metadata::ArchiveKind,
    pub force_refetch: bool,
}

/// Per-top-level-request mutable state: which URIs have already been
/// visited (loop detection) and the restart budget shared across the whole
/// descent.
pub struct ArchiveContext {
    visited_urls: RwLock<HashSet<String>>,
    pub max_archive_levels: u32,
    restarts_remaining: AtomicU32,
    cancelled: AtomicBool,
}

impl ArchiveContext {
    pub fn new(max_archive_levels: u32, max_archive_restarts: u32) -> Self {
        Self {
            visited_urls: RwLock::new(HashSet::new()),
            max_archive_levels,
            restarts_remaining: AtomicU32::new(max_archive_restarts),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Requests cooperative cancellation of the fetch this context is
    /// threaded through. Checked between stages in `fetch.rs`; does not
    /// interrupt an in-progress FEC codec run or archive extraction.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Records `uri` as visited, returning an error string if it was
    /// already present (a loop).
    pub fn detect_loop(&self, uri: &str) -> Result<(), String> {
        let mut guard = self.visited_urls.write().unwrap();
        if !guard.insert(uri.to_string()) {
            return Err(uri.to_string());
        }
        Ok(())
    }

    /// Un-records `uri`, so a retried extraction of the same archive (after
    /// an [`crate::error::ArchiveError::Restart`]) isn't mistaken for a
    /// self-referencing loop on its next attempt.
    pub fn forget_visit(&self, uri: &str) {
        self.visited_urls.write().unwrap().remove(uri);
    }

    pub fn take_restart(&self) -> bool {
        let mut remaining = self.restarts_remaining.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return false;
            }
            match self.restarts_remaining.compare_exchange(
                remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => remaining = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitfile_mask_disables_recursion() {
        let base = FetchContext::default();
        let masked = base.splitfile_default_block_mask();
        assert_eq!(masked.max_recursion_level, 1);
        assert!(!masked.allow_splitfiles);
        assert_eq!(base.max_recursion_level, 10, "original context must be untouched");
    }

    #[test]
    fn archive_context_detects_loop() {
        let ctx = ArchiveContext::new(4, 2);
        ctx.detect_loop("CHK@abc").unwrap();
        assert!(ctx.detect_loop("CHK@abc").is_err());
    }

    #[test]
    fn restart_budget_is_exhausted() {
        let ctx = ArchiveContext::new(4, 1);
        assert!(ctx.take_restart());
        assert!(!ctx.take_restart());
    }

    #[test]
    fn cancel_is_observable() {
        let ctx = ArchiveContext::new(4, 2);
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }
}
