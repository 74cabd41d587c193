//! Binary metadata codec.
//!
//! Parses and emits the document descriptor blob described by the wire
//! format: a magic, a version, a document type, a flag bitfield, and then
//! type-dependent bodies (single target key, splitfile geometry, manifest
//! entries, or an archive-internal name).
//!
//! Framing follows the same discipline the teacher's `block.rs`/
//! `superblock.rs` use for their own headers — a fixed magic checked first,
//! then a version gate — except this format is big-endian per the wire
//! spec, so the byte-pushing here goes through `byteorder` instead of the
//! teacher's `to_le_bytes` calls.

use crate::error::{MetadataError, MetadataUnresolved};
use crate::uri::{ContentRef, ContentURI, RoutingKey};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const METADATA_MAGIC: u64 = 0xF053_B284_2D91_482B;
pub const METADATA_VERSION: u16 = 0;

pub const MAX_INLINE_PARAMS_LEN: usize = 32_768;
pub const MAX_BLOCKS_PER_SIDE: u64 = 1_000_000;
pub const MAX_SUB_ENTRY_INLINE_SIZE: usize = 32_767;
pub const MAX_MANIFEST_ENTRIES: u32 = 100_000;

pub const FLAG_SPLITFILE: u16 = 0x0001;
pub const FLAG_DBR: u16 = 0x0002;
pub const FLAG_NO_MIME: u16 = 0x0004;
pub const FLAG_COMPRESSED_MIME: u16 = 0x0008;
pub const FLAG_EXTRA_METADATA: u16 = 0x0010;
pub const FLAG_FULL_KEYS: u16 = 0x0020;
pub const FLAG_RESERVED_BIT6: u16 = 0x0040;
pub const FLAG_COMPRESSED: u16 = 0x0080;

/// Common client-visible metadata carried by every document-bearing
/// variant except `SimpleManifest`, which has no MIME slot on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientMetadata {
    pub mime: Option<String>,
    /// Opaque 2-byte params carried alongside a compressed-mime-table index.
    /// Only meaningful when `mime` was encoded via the table (high bit of
    /// the index signals its presence on the wire); `None` for a literal
    /// string MIME or a table hit with no params.
    pub mime_params: Option<u16>,
}

/// A redirect/manifest target is either a plain URI or an embedded
/// splitfile descriptor (used when the target document itself is large
/// enough to need FEC-protected segmentation).
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Uri(ContentRef),
    Splitfile(Splitfile),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGzip,
}

impl ArchiveKind {
    pub fn metadata_id(self) -> u16 {
        match self {
            ArchiveKind::Zip => 0,
            ArchiveKind::TarGzip => 1,
        }
    }

    pub fn from_metadata_id(id: u16) -> Result<Self, MetadataError> {
        match id {
            0 => Ok(ArchiveKind::Zip),
            1 => Ok(ArchiveKind::TarGzip),
            other => Err(MetadataError::UnknownArchiveKind(other)),
        }
    }

    pub fn guess_from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/zip" => Some(ArchiveKind::Zip),
            "application/x-tar-gz" | "application/gzip" => Some(ArchiveKind::TarGzip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecAlgorithm {
    OnionStandard,
}

impl FecAlgorithm {
    fn wire_id(self) -> u16 {
        match self {
            FecAlgorithm::OnionStandard => 1,
        }
    }

    fn from_wire_id(id: u16) -> Result<Self, MetadataError> {
        match id {
            1 => Ok(FecAlgorithm::OnionStandard),
            0 => Err(MetadataError::NonRedundantRejected),
            _ => Err(MetadataError::MalformedKey(format!("unknown FEC algorithm id {id}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentParams {
    pub segment_size: u32,
    pub check_segment_size: u32,
}

impl SegmentParams {
    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.write_u32::<BigEndian>(self.segment_size).unwrap();
        out.write_u32::<BigEndian>(self.check_segment_size).unwrap();
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() < 8 {
            return Err(MetadataError::Truncated { needed: 8, have: bytes.len() });
        }
        let mut c = Cursor::new(bytes);
        Ok(Self {
            segment_size: c.read_u32::<BigEndian>()?,
            check_segment_size: c.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Splitfile {
    pub algorithm: FecAlgorithm,
    pub data_keys: Vec<RoutingKey>,
    pub check_keys: Vec<RoutingKey>,
    pub data_length: u64,
    pub params: SegmentParams,
    pub compression: Option<(u16, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    SimpleRedirect { target: Target, client: ClientMetadata },
    MultiLevelMetadata { target: Target, client: ClientMetadata },
    SimpleManifest { entries: Vec<(String, Metadata)> },
    ArchiveManifest { target: Target, archive_type: ArchiveKind, client: ClientMetadata },
    ArchiveInternalRedirect { name_in_archive: String, client: ClientMetadata },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentType {
    SimpleRedirect = 0,
    MultiLevelMetadata = 1,
    SimpleManifest = 2,
    ArchiveManifest = 3,
    ArchiveInternalRedirect = 4,
}

impl DocumentType {
    fn from_u8(v: u8) -> Result<Self, MetadataError> {
        match v {
            0 => Ok(DocumentType::SimpleRedirect),
            1 => Ok(DocumentType::MultiLevelMetadata),
            2 => Ok(DocumentType::SimpleManifest),
            3 => Ok(DocumentType::ArchiveManifest),
            4 => Ok(DocumentType::ArchiveInternalRedirect),
            other => Err(MetadataError::UnknownDocumentType(other)),
        }
    }
}

/// A small, fixed table of common MIME strings eligible for the compact
/// `COMPRESSED_MIME` encoding. Anything not in this table falls back to a
/// literal length-prefixed string.
const MIME_TABLE: &[&str] = &[
    "text/plain",
    "text/html",
    "text/css",
    "application/octet-stream",
    "application/zip",
    "application/x-tar-gz",
    "application/gzip",
    "image/png",
    "image/jpeg",
    "image/gif",
    "application/json",
    "application/pdf",
];

fn mime_table_index(mime: &str) -> Option<u16> {
    MIME_TABLE.iter().position(|m| *m == mime).map(|i| i as u16)
}

// ── emit ─────────────────────────────────────────────────────────────────

/// Emit `metadata` to its binary form.
///
/// Returns [`MetadataUnresolved`] listing the oversized manifest
/// sub-entries the caller must resolve (insert as their own top-level
/// documents, then splice back in as a `SimpleRedirect`) before this blob
/// can be produced.
pub fn emit(metadata: &Metadata) -> Result<Vec<u8>, MetadataUnresolved> {
    let mut out = Vec::new();
    out.write_u64::<BigEndian>(METADATA_MAGIC).unwrap();
    out.write_u16::<BigEndian>(METADATA_VERSION).unwrap();

    match metadata {
        Metadata::SimpleRedirect { target, client } => {
            out.push(DocumentType::SimpleRedirect as u8);
            emit_redirect_body(&mut out, target, client);
        }
        Metadata::MultiLevelMetadata { target, client } => {
            out.push(DocumentType::MultiLevelMetadata as u8);
            emit_redirect_body(&mut out, target, client);
        }
        Metadata::SimpleManifest { entries } => {
            out.push(DocumentType::SimpleManifest as u8);
            emit_manifest_body(&mut out, entries)?;
        }
        Metadata::ArchiveManifest { target, archive_type, client } => {
            out.push(DocumentType::ArchiveManifest as u8);
            let flags = redirect_flags(target, client);
            out.write_u16::<BigEndian>(flags).unwrap();
            out.write_u16::<BigEndian>(archive_type.metadata_id()).unwrap();
            emit_splitfile_header(&mut out, target, flags);
            emit_client_metadata(&mut out, client, flags);
            emit_target_body(&mut out, target, flags);
        }
        Metadata::ArchiveInternalRedirect { name_in_archive, client } => {
            out.push(DocumentType::ArchiveInternalRedirect as u8);
            let flags = client_only_flags(client);
            out.write_u16::<BigEndian>(flags).unwrap();
            emit_client_metadata(&mut out, client, flags);
            write_u16_str(&mut out, name_in_archive);
        }
    }

    Ok(out)
}

fn client_only_flags(client: &ClientMetadata) -> u16 {
    let mut flags = 0u16;
    if client.mime.is_none() {
        flags |= FLAG_NO_MIME;
    } else if let Some(m) = &client.mime {
        if mime_table_index(m).is_some() {
            flags |= FLAG_COMPRESSED_MIME;
        }
    }
    flags
}

fn redirect_flags(target: &Target, client: &ClientMetadata) -> u16 {
    let mut flags = client_only_flags(client);
    match target {
        Target::Splitfile(sf) => {
            flags |= FLAG_SPLITFILE;
            if sf.compression.is_some() {
                flags |= FLAG_COMPRESSED;
            }
        }
        Target::Uri(r) => {
            if !r.is_raw_chk() {
                flags |= FLAG_FULL_KEYS;
            }
        }
    }
    flags
}

fn emit_redirect_body(out: &mut Vec<u8>, target: &Target, client: &ClientMetadata) {
    let flags = redirect_flags(target, client);
    out.write_u16::<BigEndian>(flags).unwrap();
    emit_splitfile_header(out, target, flags);
    emit_client_metadata(out, client, flags);
    emit_target_body(out, target, flags);
}

/// `data_length` and, if compressed, `compression_codec`/`decompressed_length`
/// lead the splitfile's own fields on the wire, ahead of the MIME field —
/// written here rather than inside `emit_splitfile_body` so the field order
/// matches the wire table regardless of where MIME falls in `emit_target_body`.
fn emit_splitfile_header(out: &mut Vec<u8>, target: &Target, flags: u16) {
    if let Target::Splitfile(sf) = target {
        out.write_u64::<BigEndian>(sf.data_length).unwrap();
        if flags & FLAG_COMPRESSED != 0 {
            let (codec_id, decompressed_len) = sf.compression.expect("FLAG_COMPRESSED implies compression is set");
            out.write_u16::<BigEndian>(codec_id).unwrap();
            out.write_u64::<BigEndian>(decompressed_len).unwrap();
        }
    }
}

fn emit_client_metadata(out: &mut Vec<u8>, client: &ClientMetadata, flags: u16) {
    if flags & FLAG_NO_MIME != 0 {
        return;
    }
    let mime = client.mime.as_deref().unwrap_or("application/octet-stream");
    if flags & FLAG_COMPRESSED_MIME != 0 {
        let idx = mime_table_index(mime).expect("flag set implies table hit");
        match client.mime_params {
            Some(params) => {
                out.write_u16::<BigEndian>(idx | MIME_INDEX_HAS_PARAMS).unwrap();
                out.write_u16::<BigEndian>(params).unwrap();
            }
            None => out.write_u16::<BigEndian>(idx).unwrap(),
        }
    } else {
        write_u8_str(out, mime);
    }
}

fn emit_target_body(out: &mut Vec<u8>, target: &Target, flags: u16) {
    match target {
        Target::Splitfile(sf) => emit_splitfile_body(out, sf),
        Target::Uri(r) => emit_key(out, r, flags & FLAG_FULL_KEYS != 0),
    }
}

fn emit_splitfile_body(out: &mut Vec<u8>, sf: &Splitfile) {
    out.write_u16::<BigEndian>(sf.algorithm.wire_id()).unwrap();
    let params = sf.params.to_bytes();
    out.write_u32::<BigEndian>(params.len() as u32).unwrap();
    out.extend_from_slice(&params);
    out.write_u32::<BigEndian>(sf.data_keys.len() as u32).unwrap();
    out.write_u32::<BigEndian>(sf.check_keys.len() as u32).unwrap();
    for k in &sf.data_keys {
        out.extend_from_slice(k);
    }
    for k in &sf.check_keys {
        out.extend_from_slice(k);
    }
}

fn emit_manifest_body(out: &mut Vec<u8>, entries: &[(String, Metadata)]) -> Result<(), MetadataUnresolved> {
    out.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    let mut unresolved = Vec::new();
    for (name, sub) in entries {
        let blob = match emit(sub) {
            Ok(b) => b,
            Err(e) => {
                unresolved.extend(e.0);
                continue;
            }
        };
        if blob.len() > MAX_SUB_ENTRY_INLINE_SIZE {
            unresolved.push(sub.clone());
            continue;
        }
        write_u16_str(out, name);
        out.write_u16::<BigEndian>(blob.len() as u16).unwrap();
        out.extend_from_slice(&blob);
    }
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(MetadataUnresolved(unresolved))
    }
}

fn write_u8_str(out: &mut Vec<u8>, s: &str) {
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn write_u16_str(out: &mut Vec<u8>, s: &str) {
    out.write_u16::<BigEndian>(s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn emit_key(out: &mut Vec<u8>, r: &ContentRef, full: bool) {
    if !full {
        if let ContentURI::Chk { hash, crypto_params, .. } = &r.key {
            out.extend_from_slice(hash);
            out.write_u16::<BigEndian>(crypto_params.len() as u16).unwrap();
            out.extend_from_slice(crypto_params);
            return;
        }
        unreachable!("raw key encoding is only valid for a raw CHK");
    }

    match &r.key {
        ContentURI::Chk { hash, crypto_params, extras } => {
            out.push(0);
            out.extend_from_slice(hash);
            out.write_u16::<BigEndian>(crypto_params.len() as u16).unwrap();
            out.extend_from_slice(crypto_params);
            out.write_u16::<BigEndian>(extras.len() as u16).unwrap();
            out.extend_from_slice(extras);
        }
        ContentURI::Ssk { pubkey_hash, salt, docname } => {
            out.push(1);
            out.extend_from_slice(pubkey_hash);
            out.write_u16::<BigEndian>(salt.len() as u16).unwrap();
            out.extend_from_slice(salt);
            write_u16_str(out, docname);
        }
        ContentURI::Ksk { keyword } => {
            out.push(2);
            write_u16_str(out, keyword);
        }
        ContentURI::Usk { pubkey_hash, salt, sitename, edition } => {
            out.push(3);
            out.extend_from_slice(pubkey_hash);
            out.write_u16::<BigEndian>(salt.len() as u16).unwrap();
            out.extend_from_slice(salt);
            write_u16_str(out, sitename);
            out.write_i64::<BigEndian>(*edition).unwrap();
        }
    }

    out.write_u16::<BigEndian>(r.meta_strings.len() as u16).unwrap();
    for s in &r.meta_strings {
        write_u16_str(out, s);
    }
    match r.suggested_edition {
        Some(e) => {
            out.push(1);
            out.write_i64::<BigEndian>(e).unwrap();
        }
        None => out.push(0),
    }
}

// ── parse ────────────────────────────────────────────────────────────────

pub fn parse(bytes: &[u8]) -> Result<Metadata, MetadataError> {
    let mut c = Cursor::new(bytes);
    let magic = c.read_u64::<BigEndian>().map_err(|_| MetadataError::Truncated { needed: 8, have: bytes.len() })?;
    if magic != METADATA_MAGIC {
        return Err(MetadataError::BadMagic { expected: METADATA_MAGIC, got: magic });
    }
    let version = c.read_u16::<BigEndian>()?;
    if version != METADATA_VERSION {
        return Err(MetadataError::UnsupportedVersion(version));
    }
    let doc_type = DocumentType::from_u8(read_u8(&mut c)?)?;

    match doc_type {
        DocumentType::SimpleRedirect => {
            let (target, client) = parse_redirect_body(&mut c)?;
            Ok(Metadata::SimpleRedirect { target, client })
        }
        DocumentType::MultiLevelMetadata => {
            let (target, client) = parse_redirect_body(&mut c)?;
            Ok(Metadata::MultiLevelMetadata { target, client })
        }
        DocumentType::SimpleManifest => {
            let entries = parse_manifest_body(&mut c)?;
            Ok(Metadata::SimpleManifest { entries })
        }
        DocumentType::ArchiveManifest => {
            let flags = check_flags(c.read_u16::<BigEndian>()?)?;
            let archive_type = ArchiveKind::from_metadata_id(c.read_u16::<BigEndian>()?)?;
            let splitfile_header = parse_splitfile_header(&mut c, flags)?;
            let client = parse_client_metadata(&mut c, flags)?;
            let target = parse_target_body(&mut c, flags, splitfile_header)?;
            Ok(Metadata::ArchiveManifest { target, archive_type, client })
        }
        DocumentType::ArchiveInternalRedirect => {
            let flags = check_flags(c.read_u16::<BigEndian>()?)?;
            let client = parse_client_metadata(&mut c, flags)?;
            let name_in_archive = read_u16_str(&mut c)?;
            Ok(Metadata::ArchiveInternalRedirect { name_in_archive, client })
        }
    }
}

fn check_flags(flags: u16) -> Result<u16, MetadataError> {
    if flags & FLAG_DBR != 0 {
        return Err(MetadataError::DbrRejected);
    }
    if flags & FLAG_EXTRA_METADATA != 0 {
        return Err(MetadataError::ExtraMetadataRejected);
    }
    if flags & FLAG_RESERVED_BIT6 != 0 {
        return Err(MetadataError::ReservedFlag(FLAG_RESERVED_BIT6));
    }
    Ok(flags)
}

fn parse_redirect_body(c: &mut Cursor<&[u8]>) -> Result<(Target, ClientMetadata), MetadataError> {
    let flags = check_flags(c.read_u16::<BigEndian>()?)?;
    let splitfile_header = parse_splitfile_header(c, flags)?;
    let client = parse_client_metadata(c, flags)?;
    let target = parse_target_body(c, flags, splitfile_header)?;
    Ok((target, client))
}

/// Mirrors [`emit_splitfile_header`]: `data_length`/compression fields lead
/// the splitfile body on the wire, ahead of MIME.
struct SplitfileHeader {
    data_length: u64,
    compression: Option<(u16, u64)>,
}

fn parse_splitfile_header(c: &mut Cursor<&[u8]>, flags: u16) -> Result<Option<SplitfileHeader>, MetadataError> {
    if flags & FLAG_SPLITFILE == 0 {
        return Ok(None);
    }
    let data_length = c.read_u64::<BigEndian>()?;
    let compression = if flags & FLAG_COMPRESSED != 0 {
        let codec_id = c.read_u16::<BigEndian>()?;
        let decompressed_len = c.read_u64::<BigEndian>()?;
        Some((codec_id, decompressed_len))
    } else {
        None
    };
    Ok(Some(SplitfileHeader { data_length, compression }))
}

/// The compressed-MIME table index reserves its high bit to signal a
/// following 2-byte params field (spec §6); bit 15 is never a valid table
/// index on its own since `MIME_TABLE` is far smaller than 2^15 entries.
const MIME_INDEX_HAS_PARAMS: u16 = 0x8000;

fn parse_client_metadata(c: &mut Cursor<&[u8]>, flags: u16) -> Result<ClientMetadata, MetadataError> {
    if flags & FLAG_NO_MIME != 0 {
        return Ok(ClientMetadata { mime: None, mime_params: None });
    }
    if flags & FLAG_COMPRESSED_MIME != 0 {
        let raw = c.read_u16::<BigEndian>()?;
        let has_params = raw & MIME_INDEX_HAS_PARAMS != 0;
        let idx = (raw & !MIME_INDEX_HAS_PARAMS) as usize;
        let mime = MIME_TABLE.get(idx).map(|s| s.to_string())
            .ok_or_else(|| MetadataError::MalformedKey(format!("MIME table index {idx} out of range")))?;
        let mime_params = if has_params { Some(c.read_u16::<BigEndian>()?) } else { None };
        Ok(ClientMetadata { mime: Some(mime), mime_params })
    } else {
        Ok(ClientMetadata { mime: Some(read_u8_str(c)?), mime_params: None })
    }
}

fn parse_target_body(c: &mut Cursor<&[u8]>, flags: u16, splitfile_header: Option<SplitfileHeader>) -> Result<Target, MetadataError> {
    if flags & FLAG_SPLITFILE != 0 {
        let header = splitfile_header.expect("FLAG_SPLITFILE implies the header was already parsed");
        Ok(Target::Splitfile(parse_splitfile_body(c, header)?))
    } else {
        Ok(Target::Uri(parse_key(c, flags & FLAG_FULL_KEYS != 0)?))
    }
}

fn parse_splitfile_body(c: &mut Cursor<&[u8]>, header: SplitfileHeader) -> Result<Splitfile, MetadataError> {
    let SplitfileHeader { data_length, compression } = header;
    let algorithm = FecAlgorithm::from_wire_id(c.read_u16::<BigEndian>()?)?;
    let params_len = c.read_u32::<BigEndian>()? as usize;
    if params_len > MAX_INLINE_PARAMS_LEN {
        return Err(MetadataError::MalformedKey("splitfile params_len exceeds inline cap".into()));
    }
    let mut params_bytes = vec![0u8; params_len];
    c.read_exact(&mut params_bytes)?;
    let params = SegmentParams::from_bytes(&params_bytes)?;

    let block_count = c.read_u32::<BigEndian>()? as u64;
    let check_count = c.read_u32::<BigEndian>()? as u64;
    if block_count > MAX_BLOCKS_PER_SIDE || check_count > MAX_BLOCKS_PER_SIDE {
        return Err(MetadataError::TooManySplitfileBlocks(block_count.max(check_count)));
    }

    let mut data_keys = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        data_keys.push(read_routing_key(c)?);
    }
    let mut check_keys = Vec::with_capacity(check_count as usize);
    for _ in 0..check_count {
        check_keys.push(read_routing_key(c)?);
    }

    Ok(Splitfile { algorithm, data_keys, check_keys, data_length, params, compression })
}

fn read_routing_key(c: &mut Cursor<&[u8]>) -> Result<RoutingKey, MetadataError> {
    let mut key = [0u8; 32];
    c.read_exact(&mut key)?;
    Ok(key)
}

fn parse_manifest_body(c: &mut Cursor<&[u8]>) -> Result<Vec<(String, Metadata)>, MetadataError> {
    let count = c.read_u32::<BigEndian>()?;
    if count > MAX_MANIFEST_ENTRIES {
        return Err(MetadataError::TooManyManifestEntries(count));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_u16_str(c)?;
        let body_len = c.read_u16::<BigEndian>()? as usize;
        if body_len > MAX_SUB_ENTRY_INLINE_SIZE {
            return Err(MetadataError::SubEntryTooLarge(body_len));
        }
        let mut body = vec![0u8; body_len];
        c.read_exact(&mut body)?;
        let sub = parse(&body)?;
        entries.push((name, sub));
    }
    Ok(entries)
}

fn parse_key(c: &mut Cursor<&[u8]>, full: bool) -> Result<ContentRef, MetadataError> {
    if !full {
        let mut hash = [0u8; 32];
        c.read_exact(&mut hash)?;
        let params_len = c.read_u16::<BigEndian>()? as usize;
        let mut params = vec![0u8; params_len];
        c.read_exact(&mut params)?;
        return Ok(ContentRef::new(ContentURI::Chk { hash, crypto_params: params, extras: Vec::new() }));
    }

    let tag = read_u8(c)?;
    let key = match tag {
        0 => {
            let mut hash = [0u8; 32];
            c.read_exact(&mut hash)?;
            let params_len = c.read_u16::<BigEndian>()? as usize;
            let mut params = vec![0u8; params_len];
            c.read_exact(&mut params)?;
            let extras_len = c.read_u16::<BigEndian>()? as usize;
            let mut extras = vec![0u8; extras_len];
            c.read_exact(&mut extras)?;
            ContentURI::Chk { hash, crypto_params: params, extras }
        }
        1 => {
            let mut pubkey_hash = [0u8; 32];
            c.read_exact(&mut pubkey_hash)?;
            let salt_len = c.read_u16::<BigEndian>()? as usize;
            let mut salt = vec![0u8; salt_len];
            c.read_exact(&mut salt)?;
            let docname = read_u16_str(c)?;
            ContentURI::Ssk { pubkey_hash, salt, docname }
        }
        2 => ContentURI::Ksk { keyword: read_u16_str(c)? },
        3 => {
            let mut pubkey_hash = [0u8; 32];
            c.read_exact(&mut pubkey_hash)?;
            let salt_len = c.read_u16::<BigEndian>()? as usize;
            let mut salt = vec![0u8; salt_len];
            c.read_exact(&mut salt)?;
            let sitename = read_u16_str(c)?;
            let edition = c.read_i64::<BigEndian>()?;
            ContentURI::Usk { pubkey_hash, salt, sitename, edition }
        }
        other => return Err(MetadataError::MalformedKey(format!("unknown key type tag {other}"))),
    };

    let meta_count = c.read_u16::<BigEndian>()?;
    let mut meta_strings = Vec::with_capacity(meta_count as usize);
    for _ in 0..meta_count {
        meta_strings.push(read_u16_str(c)?);
    }
    let has_edition = read_u8(c)? != 0;
    let suggested_edition = if has_edition { Some(c.read_i64::<BigEndian>()?) } else { None };

    Ok(ContentRef { key, meta_strings, suggested_edition })
}

fn read_u8(c: &mut Cursor<&[u8]>) -> Result<u8, MetadataError> {
    Ok(ReadBytesExt::read_u8(c)?)
}

fn read_u8_str(c: &mut Cursor<&[u8]>) -> Result<String, MetadataError> {
    let len = read_u8(c)? as usize;
    let mut buf = vec![0u8; len];
    c.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn read_u16_str(c: &mut Cursor<&[u8]>) -> Result<String, MetadataError> {
    let len = c.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    c.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}
