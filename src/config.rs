//! Process-level configuration: a plain struct with `Default`, overridable
//! by CLI flags. No remote config service, no file format — the teacher's
//! CLI takes flags directly too.

use crate::compression::CompressionCodecId;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Upper bound on FEC worker threads; actual count is clamped further
    /// by `FecQueue` to available cores.
    pub max_fec_workers: usize,
    /// Cap on cached (non-durable) FEC jobs awaited across all priorities.
    pub fec_cache_size: usize,
    pub max_splitfile_workers: usize,
    pub default_codec: CompressionCodecId,
    pub default_compression_level: i32,
    pub local_store_dir: PathBuf,
    pub archive_tags_dir: PathBuf,
    pub max_archive_cache_bytes: u64,
    pub max_archive_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_fec_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2).min(3),
            fec_cache_size: 32,
            max_splitfile_workers: 16,
            default_codec: CompressionCodecId::Gzip,
            default_compression_level: 6,
            local_store_dir: PathBuf::from("./content-node-data/store"),
            archive_tags_dir: PathBuf::from("./content-node-data/archive-tags"),
            max_archive_cache_bytes: 256 * 1024 * 1024,
            max_archive_size: 512 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_clamped() {
        let cfg = NodeConfig::default();
        assert!(cfg.max_fec_workers >= 1 && cfg.max_fec_workers <= 3);
    }
}
