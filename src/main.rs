use clap::{Parser, Subcommand};
use freetide::{
    fetch, insert, ArchiveContext, ArchiveManager, BucketFactory, ContentRef, ContentURI,
    FetchContext, FetchEnv, FecQueue, InsertContext, LocalBlockStore, NodeConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "content-node", version = "0.1.0", about = "Peer-to-peer content distribution node: client content layer")]
struct Cli {
    /// Directory the local block store, bucket temp files, and archive tags
    /// live under. Defaults to `NodeConfig::local_store_dir`'s parent.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a file, printing the CHK URI it can be fetched back with
    Insert {
        input: PathBuf,
        /// Disable compression even if the payload would shrink
        #[arg(long)]
        no_compress: bool,
    },
    /// Fetch a CHK URI (optionally with a `/meta/string/path`) to a file
    Fetch {
        uri: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Parse and print a raw metadata blob
    Inspect {
        input: PathBuf,
    },
    /// Zip a directory and insert it as an archive manifest
    Pack {
        input_dir: PathBuf,
    },
    /// Fetch an archive URI and extract every entry to a directory
    Unpack {
        uri: String,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
}

struct Env {
    store: LocalBlockStore,
    archive_manager: Arc<ArchiveManager>,
    queue: Arc<FecQueue>,
    factory: BucketFactory,
}

fn build_env(cfg: &NodeConfig) -> std::io::Result<Env> {
    Ok(Env {
        store: LocalBlockStore::new(cfg.local_store_dir.clone())?,
        archive_manager: Arc::new(ArchiveManager::new(
            cfg.max_archive_cache_bytes,
            cfg.max_archive_size,
            cfg.archive_tags_dir.clone(),
        )),
        queue: FecQueue::new(cfg.max_fec_workers, cfg.fec_cache_size),
        factory: BucketFactory::new(cfg.local_store_dir.join("buckets")),
    })
}

impl Env {
    fn as_fetch_env(&self) -> FetchEnv<'_> {
        FetchEnv {
            store: &self.store,
            archive_manager: &self.archive_manager,
            queue: &self.queue,
            factory: &self.factory,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::try_init().ok();
    let cli = Cli::parse();
    let mut cfg = NodeConfig::default();
    if let Some(dir) = &cli.data_dir {
        cfg.local_store_dir = dir.join("store");
        cfg.archive_tags_dir = dir.join("archive-tags");
    }
    let env = build_env(&cfg)?;
    let fetch_ctx = FetchContext::default();

    match cli.command {
        // ── Insert ───────────────────────────────────────────────────────────
        Commands::Insert { input, no_compress } => {
            let data = std::fs::read(&input)?;
            let insert_ctx = if no_compress {
                InsertContext { default_codec: cfg.default_codec, ..InsertContext::default() }.preset_no_compression()
            } else {
                InsertContext { default_codec: cfg.default_codec, compression_level: cfg.default_compression_level, ..InsertContext::default() }
            };
            let uri = insert(&data, &fetch_ctx, &insert_ctx, &env.as_fetch_env())?;
            println!("{uri}");
        }

        // ── Fetch ────────────────────────────────────────────────────────────
        Commands::Fetch { uri, output } => {
            let content_ref = parse_content_ref(&uri)?;
            let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
            let bucket = fetch(&content_ref, &archive_ctx, &fetch_ctx, &env.as_fetch_env())?;
            let bytes = freetide::bucket::read_all(bucket.as_ref())?;
            std::fs::write(&output, &bytes)?;
            println!("Fetched {} bytes -> {}", bytes.len(), output.display());
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input } => {
            let bytes = std::fs::read(&input)?;
            let meta = freetide::metadata::parse(&bytes)?;
            println!("{meta:#?}");
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input_dir } => {
            let zip_bytes = zip_directory(&input_dir)?;
            let insert_ctx = InsertContext::default().preset_no_compression();
            let uri = insert(&zip_bytes, &fetch_ctx, &insert_ctx, &env.as_fetch_env())?;
            println!("Packed {} -> {uri}", input_dir.display());
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { uri, output_dir } => {
            let content_ref = parse_content_ref(&uri)?;
            let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
            let bucket = fetch(&content_ref, &archive_ctx, &fetch_ctx, &env.as_fetch_env())?;
            let raw = freetide::bucket::read_all(bucket.as_ref())?;

            let mut zip = zip::ZipArchive::new(std::io::Cursor::new(&raw))?;
            let names: Vec<String> = (0..zip.len())
                .map(|i| zip.by_index(i).unwrap().name().to_string())
                .filter(|n| !n.ends_with('/'))
                .collect();

            let archive_key = content_ref.to_string();
            let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
            std::fs::create_dir_all(&output_dir)?;
            for name in &names {
                let entry = env.archive_manager.get(
                    &archive_key,
                    freetide::ArchiveKind::Zip,
                    name,
                    &archive_ctx,
                    false,
                    &env.factory,
                    || {
                        let b: Arc<dyn freetide::Bucket> = Arc::new(freetide::MemBucket::from_bytes(raw.clone()));
                        Ok(b)
                    },
                )?;
                let dest = output_dir.join(name);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, freetide::bucket::read_all(entry.as_ref())?)?;
            }
            println!("Unpacked {} entries -> {}", names.len(), output_dir.display());
        }
    }

    Ok(())
}

fn zip_directory(dir: &PathBuf) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut out);
        let mut zip = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default();
        for entry in walk_files(dir)? {
            let rel = entry.strip_prefix(dir).unwrap_or(&entry).to_string_lossy().replace('\\', "/");
            let data = std::fs::read(&entry)?;
            zip.start_file(rel, options)?;
            std::io::Write::write_all(&mut zip, &data)?;
        }
        zip.finish()?;
    }
    Ok(out)
}

fn walk_files(dir: &PathBuf) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

fn parse_content_ref(s: &str) -> Result<ContentRef, String> {
    let rest = s.strip_prefix("CHK@").ok_or_else(|| format!("unsupported URI scheme in '{s}', only CHK@<hex> is accepted by this CLI"))?;
    let mut parts = rest.split('/');
    let hash_hex = parts.next().unwrap_or("");
    let hash_bytes = hex::decode(hash_hex).map_err(|e| e.to_string())?;
    if hash_bytes.len() != 32 {
        return Err(format!("CHK hash must be 32 bytes, got {}", hash_bytes.len()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hash_bytes);
    let meta_strings: Vec<String> = parts.filter(|s| !s.is_empty()).map(String::from).collect();
    Ok(ContentRef::with_path(ContentURI::Chk { hash, crypto_params: Vec::new(), extras: Vec::new() }, meta_strings))
}
