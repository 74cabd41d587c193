//! Content URIs: the four routing-key kinds plus the meta-string path that
//! trails them. Generalizes the teacher's fixed-size hash reference
//! ([`crate::uri::RoutingKey`] below is the `block::BlockHeader::content_hash`
//! idea lifted out of the block-archive domain and into a key type of its
//! own) into a tagged union over the key kinds the content layer must
//! route through.

use std::fmt;

/// 32-byte content hash, used as both a CHK's routing key and a splitfile
/// block's CAS identity.
pub type RoutingKey = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentURI {
    /// Content Hash Key — `hash` is the routing key, `crypto_params` and
    /// `extras` are opaque bytes carried verbatim from the wire format.
    Chk {
        hash: RoutingKey,
        crypto_params: Vec<u8>,
        extras: Vec<u8>,
    },
    /// Signed Subspace Key.
    Ssk {
        pubkey_hash: RoutingKey,
        salt: Vec<u8>,
        docname: String,
    },
    /// Keyword Signed Key.
    Ksk { keyword: String },
    /// Updatable Subspace Key.
    Usk {
        pubkey_hash: RoutingKey,
        salt: Vec<u8>,
        sitename: String,
        edition: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef {
    pub key: ContentURI,
    pub meta_strings: Vec<String>,
    pub suggested_edition: Option<i64>,
}

impl ContentRef {
    pub fn new(key: ContentURI) -> Self {
        Self { key, meta_strings: Vec::new(), suggested_edition: None }
    }

    pub fn with_path(key: ContentURI, meta_strings: Vec<String>) -> Self {
        Self { key, meta_strings, suggested_edition: None }
    }

    /// A "raw" CHK is eligible to appear unframed inside a splitfile body:
    /// no meta-strings, no suggested edition.
    pub fn is_raw_chk(&self) -> bool {
        matches!(self.key, ContentURI::Chk { .. })
            && self.meta_strings.is_empty()
            && self.suggested_edition.is_none()
    }

    /// Consume the next path component, returning it and the remaining ref.
    /// `None` if no meta-strings remain.
    pub fn pop_front(&self) -> Option<(String, ContentRef)> {
        let (first, rest) = self.meta_strings.split_first()?;
        Some((
            first.clone(),
            ContentRef {
                key: self.key.clone(),
                meta_strings: rest.to_vec(),
                suggested_edition: self.suggested_edition,
            },
        ))
    }
}

impl fmt::Display for ContentURI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentURI::Chk { hash, .. } => write!(f, "CHK@{}", hex::encode(hash)),
            ContentURI::Ssk { pubkey_hash, docname, .. } => {
                write!(f, "SSK@{}/{}", hex::encode(pubkey_hash), docname)
            }
            ContentURI::Ksk { keyword } => write!(f, "KSK@{keyword}"),
            ContentURI::Usk { pubkey_hash, sitename, edition, .. } => {
                write!(f, "USK@{}/{}/{}", hex::encode(pubkey_hash), sitename, edition)
            }
        }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for s in &self.meta_strings {
            write!(f, "/{s}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_chk_detection() {
        let chk = ContentRef::new(ContentURI::Chk { hash: [1u8; 32], crypto_params: vec![], extras: vec![] });
        assert!(chk.is_raw_chk());

        let with_path = ContentRef::with_path(
            ContentURI::Chk { hash: [1u8; 32], crypto_params: vec![], extras: vec![] },
            vec!["foo".into()],
        );
        assert!(!with_path.is_raw_chk());
    }

    #[test]
    fn pop_front_walks_path() {
        let r = ContentRef::with_path(
            ContentURI::Ksk { keyword: "site".into() },
            vec!["a".into(), "b".into()],
        );
        let (first, rest) = r.pop_front().unwrap();
        assert_eq!(first, "a");
        assert_eq!(rest.meta_strings, vec!["b".to_string()]);
    }
}
