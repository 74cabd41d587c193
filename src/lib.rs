//! # freetide — peer-to-peer content distribution node, client content layer
//!
//! Format guarantees carried over from the wire format this subsystem reads
//! and writes:
//! - Every metadata blob opens with the magic `0xF053B2842D91482B`, big-endian
//! - Flags are a 16-bit bitfield; `DBR` and `EXTRA_METADATA` are rejected on read
//! - Splitfile bodies carry only raw CHKs; full keys are rejected inside them
//! - FEC decode never substitutes a different codec on an unknown id — it fails
//! - Archive extraction is content-addressed and at-most-once per key in flight

pub mod archive_manager;
pub mod bucket;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod fec;
pub mod fetch;
pub mod metadata;
pub mod splitfile;
pub mod uri;

// Flat re-exports for the most common types.
pub use archive_manager::ArchiveManager;
pub use bucket::{Bucket, BucketFactory, FileBucket, MemBucket};
pub use compression::{get_codec, get_codec_by_metadata_id, CompressionCodec, CompressionCodecId};
pub use config::NodeConfig;
pub use context::{ArchiveContext, EventSink, FetchContext, FetchEvent, InsertContext};
pub use error::{ArchiveError, BucketError, FecError, FetchError, MetadataError, MetadataUnresolved};
pub use fec::{FecCodec, FecQueue};
pub use fetch::{fetch, insert, FetchEnv, LocalBlockStore};
pub use metadata::{ArchiveKind, ClientMetadata, FecAlgorithm, Metadata, Splitfile, Target};
pub use splitfile::{fetch_splitfile, insert_splitfile, BlockFetcher, BlockInserter};
pub use uri::{ContentRef, ContentURI, RoutingKey};
