//! Virtual filesystem handed to a run and returned with its result.
//!
//! A [`FileSystemMap`] maps absolute paths (`/dir/file.txt`) to
//! [`FileEntry`] values. Maps are seeded from an archive with
//! [`extract_archive`] or built directly by a caller, and the engine hands
//! back a final snapshot when a run completes.

mod archive;

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

pub use archive::{LoaderError, extract_archive};

/// Path separator used by every key of a [`FileSystemMap`].
pub const SEPARATOR: char = '/';

/// Content of a single file, either raw bytes or text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum FileContent {
    /// Text content.
    Text(String),
    /// Binary content.
    Bytes(Vec<u8>),
}

impl FileContent {
    /// View the content as bytes regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Bytes(bytes) => bytes,
        }
    }

    /// Content length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the content as UTF-8, replacing invalid sequences.
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        FileContent::Text(text)
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        FileContent::Text(text.to_string())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        FileContent::Bytes(bytes)
    }
}

/// A named file. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFileEntry")]
pub struct FileEntry {
    name: String,
    content: FileContent,
}

impl FileEntry {
    /// Create an entry. The name is normalized to an absolute path.
    pub fn new(name: impl AsRef<str>, content: impl Into<FileContent>) -> Self {
        Self {
            name: normalize_path(name.as_ref()),
            content: content.into(),
        }
    }

    /// Absolute path of the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File content.
    pub fn content(&self) -> &FileContent {
        &self.content
    }
}

#[derive(Deserialize)]
struct RawFileEntry {
    name: String,
    content: FileContent,
}

impl From<RawFileEntry> for FileEntry {
    fn from(raw: RawFileEntry) -> Self {
        FileEntry::new(raw.name, raw.content)
    }
}

/// Mapping from absolute path to file entry.
///
/// Every key starts with [`SEPARATOR`]; [`FileSystemMap::insert`] enforces
/// this by keying on the entry's normalized name. Inserting a second entry
/// under the same path replaces the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FileSystemMap {
    files: BTreeMap<String, FileEntry>,
}

// Keys are rebuilt from entry names, never trusted from the document.
impl<'de> Deserialize<'de> for FileSystemMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let files = BTreeMap::<String, FileEntry>::deserialize(deserializer)?;
        Ok(files.into_values().collect())
    }
}

impl FileSystemMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the entry it replaced.
    pub fn insert(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.files.insert(entry.name.clone(), entry)
    }

    /// Insert `content` at `path`.
    pub fn write(&mut self, path: &str, content: impl Into<FileContent>) -> Option<FileEntry> {
        self.insert(FileEntry::new(path, content))
    }

    /// Look up a file by path. Relative paths are resolved against the root.
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(&normalize_path(path))
    }

    /// Whether a file exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Remove a file.
    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(&normalize_path(path))
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the map holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate over paths in lexical order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Iterate over entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }
}

impl FromIterator<FileEntry> for FileSystemMap {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        let mut map = Self::new();
        for entry in iter {
            map.insert(entry);
        }
        map
    }
}

impl IntoIterator for FileSystemMap {
    type Item = FileEntry;
    type IntoIter = std::collections::btree_map::IntoValues<String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_values()
    }
}

/// Prefix `path` with [`SEPARATOR`] unless it already starts with one.
///
/// A leading `./` (as written by `tar -C dir .`) is dropped first.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.strip_prefix("./").unwrap_or(path);
    if trimmed.starts_with(SEPARATOR) {
        trimmed.to_string()
    } else {
        format!("{SEPARATOR}{trimmed}")
    }
}
