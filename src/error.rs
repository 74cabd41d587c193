//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own flat `thiserror` enum, the way the teacher
//! crate separates `CodecError` from `SuperblockError`. [`ContentError`]
//! unifies them for callers that cross subsystem boundaries (chiefly
//! `fetch.rs`).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Invalid magic: expected {expected:#018x}, got {got:#018x}")]
    BadMagic { expected: u64, got: u64 },
    #[error("Unsupported metadata version {0}")]
    UnsupportedVersion(u16),
    #[error("Unknown document type {0}")]
    UnknownDocumentType(u8),
    #[error("Reserved flag bit set: {0:#06x}")]
    ReservedFlag(u16),
    #[error("Date-based redirects are not supported")]
    DbrRejected,
    #[error("Extra-metadata flag is not supported")]
    ExtraMetadataRejected,
    #[error("Unknown archive kind {0}")]
    UnknownArchiveKind(u16),
    #[error("Unknown compression codec id {0}")]
    UnknownCodec(u16),
    #[error("Too many splitfile blocks: {0}")]
    TooManySplitfileBlocks(u64),
    #[error("Non-redundant splitfile algorithm is rejected")]
    NonRedundantRejected,
    #[error("Manifest sub-entry of {0} bytes exceeds the inline cap of 32767")]
    SubEntryTooLarge(usize),
    #[error("Manifest declares {0} entries, exceeding the cap")]
    TooManyManifestEntries(u32),
    #[error("Malformed embedded key: {0}")]
    MalformedKey(String),
    #[error("Truncated metadata blob: expected at least {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Emitted by [`crate::metadata::emit`] when a manifest entry could not be
/// inlined. The caller must insert each listed sub-document as its own
/// top-level object, obtain a URI for it, and re-emit with that entry
/// replaced by a `SimpleRedirect`.
#[derive(Error, Debug)]
#[error("{} metadata sub-entries must be resolved to URIs before this document can be emitted", .0.len())]
pub struct MetadataUnresolved(pub Vec<crate::metadata::Metadata>);

#[derive(Error, Debug)]
pub enum FecError {
    #[error("not enough blocks to decode: need {need}, have {have}")]
    InsufficientBlocks { need: usize, have: usize },
    #[error("malformed block: expected length {expected}, got {got}")]
    Malformed { expected: usize, got: usize },
    #[error("reed-solomon error: {0}")]
    ReedSolomon(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive container is malformed: {0}")]
    Failure(String),
    #[error("archive bucket is incomplete, caller should retry")]
    Restart,
    #[error("archive loop detected at {0}")]
    Loop(String),
    #[error("entry not found in archive: {0}")]
    NotInArchive(String),
    #[error("archive exceeds max_archive_size cap")]
    TooBig,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("bucket already freed")]
    Freed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("recursion too deep: depth {depth} exceeds max {max}")]
    RecursionTooDeep { depth: u32, max: u32 },
    #[error("too many path components remaining in URI")]
    TooManyPathComponents,
    #[error("no such entry in manifest: {0}")]
    NotEnoughMetaStrings(String),
    #[error("requested MIME type is not in the allow-list: {0}")]
    UnsafeContentType(String),
    #[error("output exceeds size cap: {got} > {cap}")]
    TooBig { got: u64, cap: u64 },
    #[error("splitfile segment unrecoverable")]
    SplitfileSegmentUnrecoverable,
    #[error("request was cancelled")]
    Cancelled,
    #[error("block not found: {0}")]
    BlockNotFound(String),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Fec(#[from] FecError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Bucket(#[from] BucketError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Bucket/file I/O crosses every fetch-path function; treat it as an
/// internal error rather than adding a dedicated variant per call site.
impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Internal(e.to_string())
    }
}
