//! Cache Types Module
//!
//! Key spaces, cache kinds and the small value types passed between the
//! entry store, size ledger, eviction engine and cache facade.
//!
//! # On-disk layout
//!
//! | Kind | Key | Relative path |
//! |---|---|---|
//! | Page image | `PageKey` | `<book_id>/page/<number>/<file_name>` |
//! | Thumbnail | `ThumbnailKey` | `<type>/<id>.jpg`, `<type>/<id>_<page>.jpg` |
//! | Book file | `BookFileKey` | `<book_id>/book.epub`, `<book_id>/<file_name>` |
//!
//! Files hold the raw payload with no header, so a stored path can be handed
//! straight to an image decoder or reader.

use crate::namespace::sanitize_component;
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

/// One of the logical caches, each with its own namespace and budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    PageImage,
    Thumbnail,
    BookFile,
}

impl CacheKind {
    pub const ALL: [CacheKind; 3] = [CacheKind::PageImage, CacheKind::Thumbnail, CacheKind::BookFile];

    /// Directory name of this kind below the cache base directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheKind::PageImage => "page-images",
            CacheKind::Thumbnail => "thumbnails",
            CacheKind::BookFile => "book-files",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::PageImage => "page_image",
            CacheKind::Thumbnail => "thumbnail",
            CacheKind::BookFile => "book_file",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "page" | "pages" | "page_image" | "page_images" => Ok(CacheKind::PageImage),
            "thumbnail" | "thumbnails" => Ok(CacheKind::Thumbnail),
            "book" | "book_file" | "book_files" => Ok(CacheKind::BookFile),
            other => Err(CacheError::ConfigError(format!("Unknown cache kind: {}", other))),
        }
    }
}

/// Kind of entity a thumbnail belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailType {
    Book,
    Series,
    Collection,
    Readlist,
    Page,
}

impl ThumbnailType {
    pub const ALL: [ThumbnailType; 5] = [
        ThumbnailType::Book,
        ThumbnailType::Series,
        ThumbnailType::Collection,
        ThumbnailType::Readlist,
        ThumbnailType::Page,
    ];

    /// Directory name inside the thumbnail namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailType::Book => "book",
            ThumbnailType::Series => "series",
            ThumbnailType::Collection => "collection",
            ThumbnailType::Readlist => "readlist",
            ThumbnailType::Page => "page",
        }
    }

    /// Collection segment used by the media server API (`/api/v1/<segment>/<id>/thumbnail`).
    pub fn api_path_segment(&self) -> &'static str {
        match self {
            ThumbnailType::Book => "books",
            ThumbnailType::Series => "series",
            ThumbnailType::Collection => "collections",
            ThumbnailType::Readlist => "readlists",
            ThumbnailType::Page => "pages",
        }
    }
}

/// Logical identity of a cached payload.
///
/// The mapping from key to relative path is a pure function: equal keys
/// always resolve to the same file and are coalesced together when fetched
/// concurrently.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Cache kind whose namespace holds this key space.
    const KIND: CacheKind;

    /// Path of the entry relative to the namespace root.
    fn relative_path(&self) -> PathBuf;
}

/// A coarser logical prefix covering every entry of one owning entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubtreePrefix(PathBuf);

impl SubtreePrefix {
    fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CacheError::InvalidKey(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// A rendered page image of a book
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    book_id: String,
    page_number: u32,
    file_name: String,
}

impl PageKey {
    /// `file_name` is the server-side name of the page; only its last path
    /// component is kept.
    pub fn new(book_id: impl Into<String>, page_number: u32, file_name: impl AsRef<str>) -> Result<Self> {
        let book_id = book_id.into();
        require_id("book_id", &book_id)?;

        let last = file_name
            .as_ref()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let file_name = if last.is_empty() || last == "." || last == ".." {
            format!("page-{}", page_number)
        } else {
            last.to_string()
        };

        Ok(Self {
            book_id,
            page_number,
            file_name,
        })
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Every page image cached for one book.
    pub fn book_prefix(book_id: &str) -> Result<SubtreePrefix> {
        require_id("book_id", book_id)?;
        Ok(SubtreePrefix::new(PathBuf::from(sanitize_component(book_id))))
    }
}

impl CacheKey for PageKey {
    const KIND: CacheKind = CacheKind::PageImage;

    fn relative_path(&self) -> PathBuf {
        PathBuf::from(sanitize_component(&self.book_id))
            .join("page")
            .join(self.page_number.to_string())
            .join(sanitize_component(&self.file_name))
    }
}

/// A server-rendered thumbnail
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThumbnailKey {
    thumbnail_type: ThumbnailType,
    id: String,
    page: Option<u32>,
}

impl ThumbnailKey {
    /// Thumbnail of one entity.
    ///
    /// An id ending in `_<n>` shares its file with `for_page(id_prefix, n)`:
    /// `new(Page, "x_3")` and `for_page("x", 3)` both store `page/x_3.jpg`.
    /// Server ids never carry such a suffix. Entry locks are taken per path,
    /// so colliding keys are still serialized against each other.
    pub fn new(thumbnail_type: ThumbnailType, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        require_id("id", &id)?;
        Ok(Self {
            thumbnail_type,
            id,
            page: None,
        })
    }

    /// Thumbnail of a single page of a book.
    ///
    /// See [`ThumbnailKey::new`] for the path it can share with a plain id.
    pub fn for_page(book_id: impl Into<String>, page: u32) -> Result<Self> {
        let id = book_id.into();
        require_id("book_id", &id)?;
        Ok(Self {
            thumbnail_type: ThumbnailType::Page,
            id,
            page: Some(page),
        })
    }

    pub fn thumbnail_type(&self) -> ThumbnailType {
        self.thumbnail_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn page(&self) -> Option<u32> {
        self.page
    }

    /// Every thumbnail of one type.
    pub fn type_prefix(thumbnail_type: ThumbnailType) -> SubtreePrefix {
        SubtreePrefix::new(PathBuf::from(thumbnail_type.as_str()))
    }
}

impl CacheKey for ThumbnailKey {
    const KIND: CacheKind = CacheKind::Thumbnail;

    fn relative_path(&self) -> PathBuf {
        let id = sanitize_component(&self.id);
        let file_name = match self.page {
            Some(page) => format!("{}_{}.jpg", id, page),
            None => format!("{}.jpg", id),
        };
        PathBuf::from(self.thumbnail_type.as_str()).join(file_name)
    }
}

/// Downloadable asset belonging to a book
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BookAsset {
    /// Converted EPUB used by the reflowable reader
    Epub,
    /// The book's original file as stored on the server
    Original(String),
}

/// A downloaded book file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookFileKey {
    book_id: String,
    asset: BookAsset,
}

impl BookFileKey {
    /// The converted EPUB, stored as `<book>/book.epub`.
    pub fn epub(book_id: impl Into<String>) -> Result<Self> {
        let book_id = book_id.into();
        require_id("book_id", &book_id)?;
        Ok(Self {
            book_id,
            asset: BookAsset::Epub,
        })
    }

    /// The original file under its server-side name.
    ///
    /// An original named `book.epub` resolves to the same file as
    /// [`BookFileKey::epub`] for that book. A book carries only one of the
    /// two, and writes to the shared path are serialized by its entry lock.
    pub fn original(book_id: impl Into<String>, file_name: impl Into<String>) -> Result<Self> {
        let book_id = book_id.into();
        let file_name = file_name.into();
        require_id("book_id", &book_id)?;
        require_id("file_name", &file_name)?;
        Ok(Self {
            book_id,
            asset: BookAsset::Original(file_name),
        })
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn asset(&self) -> &BookAsset {
        &self.asset
    }

    /// Every file cached for one book.
    pub fn book_prefix(book_id: &str) -> Result<SubtreePrefix> {
        require_id("book_id", book_id)?;
        Ok(SubtreePrefix::new(PathBuf::from(sanitize_component(book_id))))
    }
}

impl CacheKey for BookFileKey {
    const KIND: CacheKind = CacheKind::BookFile;

    fn relative_path(&self) -> PathBuf {
        let dir = PathBuf::from(sanitize_component(&self.book_id));
        match &self.asset {
            BookAsset::Epub => dir.join("book.epub"),
            BookAsset::Original(file_name) => dir.join(sanitize_component(file_name)),
        }
    }
}

/// A stored entry as reported by a namespace scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, the recency proxy used for eviction ranking
    pub modified: Option<SystemTime>,
}

/// Ground truth of a namespace at scan time
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    pub total_size: u64,
}

impl ScanResult {
    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }
}

/// Aggregate occupancy as known by the size ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// Counters must be rebuilt from a scan before they can be trusted
    Unknown,
    Known { bytes: u64, count: u64 },
}

impl LedgerState {
    pub fn is_valid(&self) -> bool {
        matches!(self, LedgerState::Known { .. })
    }

    pub fn size_info(&self) -> Option<SizeInfo> {
        match *self {
            LedgerState::Known { bytes, count } => Some(SizeInfo { bytes, count }),
            LedgerState::Unknown => None,
        }
    }
}

/// Occupied bytes and entry count of one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub bytes: u64,
    pub count: u64,
}
