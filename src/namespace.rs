//! Namespace Module
//!
//! Resolves the directory owned by one cache kind for one server/account
//! identity ("instance"), so that switching accounts or wiping one account's
//! cache never touches another's.
//!
//! Layout produced by [`DirectoryLayout`]:
//!
//! ```text
//! <base_dir>/<kind dir>/<sanitized instance id>/...
//! ```

use crate::cache_types::CacheKind;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::PathBuf;

/// Characters that must not appear verbatim in a single path component.
///
/// `%` is included so the encoding stays injective.
const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'*')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'|');

/// Encode an identifier so it is a single, visible, filesystem-safe component.
///
/// Separators are percent-encoded and a leading dot becomes `%2E`, so neither
/// `..` nor hidden names can be produced from caller-supplied ids.
pub fn sanitize_component(raw: &str) -> String {
    let encoded = utf8_percent_encode(raw, COMPONENT).to_string();
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded,
    }
}

/// Maps (kind, instance) pairs to namespace roots.
///
/// Implementations must return the same directory for a given pair for the
/// lifetime of the process and distinct directories for distinct instances.
pub trait NamespaceResolver: Send + Sync {
    /// Root directory holding every instance of `kind`.
    fn kind_root(&self, kind: CacheKind) -> PathBuf;

    /// Directory owned by one instance of `kind`.
    fn namespace_root(&self, kind: CacheKind, instance_id: &str) -> PathBuf {
        self.kind_root(kind).join(sanitize_component(instance_id))
    }
}

/// Default resolver rooted at a single base directory
#[derive(Debug, Clone)]
pub struct DirectoryLayout {
    base_dir: PathBuf,
}

impl DirectoryLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }
}

impl NamespaceResolver for DirectoryLayout {
    fn kind_root(&self, kind: CacheKind) -> PathBuf {
        self.base_dir.join(kind.dir_name())
    }
}
