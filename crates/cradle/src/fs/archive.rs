//! Gzip-compressed tar archive loader.
//!
//! The archive is inflated fully into memory and its 512-byte blocks are
//! walked one header at a time. Only regular files are materialized.
//!
//! Extraction is lenient: an entry that cannot be parsed (bad checksum,
//! undecodable path) is logged and skipped so the rest of the archive still
//! seeds the filesystem. Only a payload that cannot be decompressed at all
//! fails the whole call.

use std::io::{self, Read};

use flate2::read::GzDecoder;
use tar::{Header, PaxExtensions};
use thiserror::Error;

use super::{FileEntry, FileSystemMap};

const BLOCK_SIZE: usize = 512;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Byte range of the checksum field inside a header block.
const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;

/// Type tags for a regular file: POSIX `'0'` and the pre-POSIX NUL byte.
const REGULAR_FILE_TAGS: [u8; 2] = [b'0', b'\0'];
const GNU_LONG_NAME_TAG: u8 = b'L';
const PAX_HEADER_TAG: u8 = b'x';

/// Errors produced while loading an archive.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The payload is not a readable gzip stream.
    #[error("failed to decompress archive: {0}")]
    Decompression(#[source] io::Error),
    /// A single entry could not be parsed.
    #[error("malformed archive entry {path:?}: {reason}")]
    ArchiveFormat {
        /// Best-effort path of the entry.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Unpack a gzip-compressed tar archive into a [`FileSystemMap`].
///
/// Every regular file becomes an entry keyed by its path prefixed with `/`.
/// Directories, links and other entry types are skipped. When two entries
/// share a path the later one wins.
///
/// # Errors
///
/// Returns [`LoaderError::Decompression`] if `bytes` is not a gzip stream.
/// Malformed entries are logged and skipped, never returned.
pub fn extract_archive(bytes: &[u8]) -> Result<FileSystemMap, LoaderError> {
    let tarball = decompress(bytes)?;
    let mut fs = FileSystemMap::new();

    for item in Entries::new(&tarball) {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping archive entry");
                continue;
            }
        };

        if !REGULAR_FILE_TAGS.contains(&entry.tag) {
            tracing::debug!(path = %entry.path, tag = entry.tag, "skipping non-file entry");
            continue;
        }

        let file = FileEntry::new(&entry.path, entry.data.to_vec());
        if let Some(previous) = fs.insert(file) {
            tracing::debug!(path = previous.name(), "duplicate archive path, keeping last");
        }
    }

    tracing::debug!(files = fs.len(), "extracted archive");
    Ok(fs)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, LoaderError> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Err(LoaderError::Decompression(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing gzip header",
        )));
    }

    let mut tarball = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut tarball)
        .map_err(LoaderError::Decompression)?;
    Ok(tarball)
}

/// A parsed archive entry borrowing its data from the inflated tarball.
#[derive(Debug)]
struct RawEntry<'a> {
    path: String,
    tag: u8,
    data: &'a [u8],
}

/// Sequential walker over the header blocks of an uncompressed tarball.
///
/// GNU long-name and PAX `path` records are folded into the entry that
/// follows them. Once a header's size field is unreadable the position of
/// the next header is unknown and iteration ends.
struct Entries<'a> {
    tarball: &'a [u8],
    offset: usize,
    long_name: Option<String>,
    done: bool,
}

impl<'a> Entries<'a> {
    fn new(tarball: &'a [u8]) -> Self {
        Self {
            tarball,
            offset: 0,
            long_name: None,
            done: false,
        }
    }

    /// Read the header at the current offset and advance past its data.
    ///
    /// Returns `Ok(None)` at the end-of-archive marker.
    fn next_block(&mut self) -> Result<Option<(&'a Header, &'a [u8])>, LoaderError> {
        let tarball = self.tarball;
        let Some(block) = tarball.get(self.offset..self.offset + BLOCK_SIZE) else {
            return Ok(None);
        };
        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let header = Header::from_byte_slice(block);
        let size = header.entry_size().map_err(|e| {
            self.done = true;
            format_error(header, format!("unreadable size field: {e}"))
        })?;

        let start = self.offset + BLOCK_SIZE;
        let data = usize::try_from(size)
            .ok()
            .and_then(|size| tarball.get(start..start.checked_add(size)?))
            .ok_or_else(|| {
                self.done = true;
                format_error(header, format!("entry data truncated ({size} bytes declared)"))
            })?;
        self.offset = start + data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        if !checksum_matches(block, header) {
            self.long_name = None;
            return Err(format_error(header, "header checksum mismatch".to_string()));
        }

        Ok(Some((header, data)))
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<RawEntry<'a>, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (header, data) = match self.next_block() {
                Ok(Some(block)) => block,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => return Some(Err(err)),
            };

            let tag = header.as_old().linkflag[0];
            match tag {
                GNU_LONG_NAME_TAG => {
                    let name = data.split(|b| *b == 0).next().unwrap_or_default();
                    match std::str::from_utf8(name) {
                        Ok(name) => self.long_name = Some(name.to_string()),
                        Err(_) => {
                            return Some(Err(format_error(header, "non-UTF-8 long name".into())));
                        }
                    }
                }
                PAX_HEADER_TAG => {
                    for ext in PaxExtensions::new(data).flatten() {
                        if ext.key() == Ok("path")
                            && let Ok(path) = ext.value()
                        {
                            self.long_name = Some(path.to_string());
                        }
                    }
                }
                _ => {
                    let path = match self.long_name.take() {
                        Some(path) => path,
                        None => match std::str::from_utf8(&header.path_bytes()) {
                            Ok(path) => path.to_string(),
                            Err(_) => {
                                return Some(Err(format_error(header, "non-UTF-8 path".into())));
                            }
                        },
                    };
                    return Some(Ok(RawEntry { path, tag, data }));
                }
            }
        }
        None
    }
}

fn checksum_matches(block: &[u8], header: &Header) -> bool {
    let Ok(expected) = header.cksum() else {
        return false;
    };
    let actual: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if CHECKSUM_FIELD.contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(*b)
            }
        })
        .sum();
    actual == expected
}

fn format_error(header: &Header, reason: String) -> LoaderError {
    LoaderError::ArchiveFormat {
        path: String::from_utf8_lossy(&header.path_bytes()).into_owned(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tar::{Builder, EntryType};

    use super::*;

    fn gzip(tarball: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tarball).unwrap();
        encoder.finish().unwrap()
    }

    fn file_header(size: usize) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size as u64);
        header.set_mode(0o644);
        header
    }

    fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = file_header(data.len());
        builder.append_data(&mut header, path, data).unwrap();
    }

    /// Append a header whose name is written raw, checksum fixed up
    /// afterwards unless `corrupt` is set.
    fn append_raw(
        builder: &mut Builder<Vec<u8>>,
        name: &[u8],
        tag: u8,
        data: &[u8],
        corrupt: bool,
    ) {
        let mut header = Header::new_old();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        let old = header.as_old_mut();
        old.name[..name.len()].copy_from_slice(name);
        old.linkflag = [tag];
        header.set_cksum();
        if corrupt {
            header.as_old_mut().name[0] ^= 0x20;
        }
        builder.append(&header, data).unwrap();
    }

    fn finish(builder: Builder<Vec<u8>>) -> Vec<u8> {
        gzip(&builder.into_inner().unwrap())
    }

    fn text(fs: &FileSystemMap, path: &str) -> String {
        fs.get(path).unwrap().content().to_text_lossy()
    }

    #[test]
    fn test_regular_files_are_extracted_with_absolute_paths() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "main.py", b"print('hi')");
        append_file(&mut builder, "lib/util.py", b"X = 1");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(fs.paths().collect::<Vec<_>>(), vec!["/lib/util.py", "/main.py"]);
        assert_eq!(text(&fs, "/main.py"), "print('hi')");
    }

    #[test]
    fn test_non_file_entries_are_skipped() {
        let mut builder = Builder::new(Vec::new());

        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "lib/", &[][..]).unwrap();

        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        builder.append_link(&mut link, "latest", "lib/a.txt").unwrap();

        append_file(&mut builder, "lib/a.txt", b"a");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(fs.len(), 1);
        assert!(fs.contains("/lib/a.txt"));
    }

    #[test]
    fn test_legacy_nul_type_tag_is_a_regular_file() {
        let mut builder = Builder::new(Vec::new());
        append_raw(&mut builder, b"old.txt", b'\0', b"legacy", false);
        append_raw(&mut builder, b"new.txt", b'0', b"posix", false);

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(text(&fs, "/old.txt"), "legacy");
        assert_eq!(text(&fs, "/new.txt"), "posix");
    }

    #[test]
    fn test_duplicate_paths_keep_last_entry() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "config.txt", b"first");
        append_file(&mut builder, "./config.txt", b"second");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(fs.len(), 1);
        assert_eq!(text(&fs, "/config.txt"), "second");
    }

    #[test]
    fn test_corrupt_entry_is_skipped() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.txt", b"alpha");
        append_raw(&mut builder, b"b.txt", b'0', b"this header has a bad checksum", true);
        append_file(&mut builder, "c.txt", b"gamma");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(fs.paths().collect::<Vec<_>>(), vec!["/a.txt", "/c.txt"]);
        assert_eq!(text(&fs, "/c.txt"), "gamma");
    }

    #[test]
    fn test_undecodable_path_is_skipped() {
        let mut builder = Builder::new(Vec::new());
        append_raw(&mut builder, b"bad\xff.txt", b'0', b"?", false);
        append_file(&mut builder, "good.txt", b"ok");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(fs.paths().collect::<Vec<_>>(), vec!["/good.txt"]);
    }

    #[test]
    fn test_long_gnu_names_are_preserved() {
        let long = format!("deep/{}/file.txt", "d".repeat(120));
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, &long, b"deep");

        let fs = extract_archive(&finish(builder)).unwrap();

        assert_eq!(text(&fs, &format!("/{long}")), "deep");
        assert_eq!(fs.len(), 1);
    }

    #[test]
    fn test_truncated_tarball_keeps_earlier_entries() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.txt", b"alpha");
        append_file(&mut builder, "b.txt", &[b'b'; 2048]);
        let mut tarball = builder.into_inner().unwrap();
        tarball.truncate(BLOCK_SIZE * 3);

        let fs = extract_archive(&gzip(&tarball)).unwrap();

        assert_eq!(fs.paths().collect::<Vec<_>>(), vec!["/a.txt"]);
    }

    #[test]
    fn test_empty_archive() {
        let builder = Builder::new(Vec::new());
        let fs = extract_archive(&finish(builder)).unwrap();
        assert!(fs.is_empty());
    }

    #[test]
    fn test_not_gzip_is_decompression_error() {
        let err = extract_archive(b"plain text, not an archive").unwrap_err();
        assert!(matches!(err, LoaderError::Decompression(_)));

        let err = extract_archive(&[]).unwrap_err();
        assert!(matches!(err, LoaderError::Decompression(_)));
    }

    #[test]
    fn test_corrupt_gzip_stream_is_decompression_error() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.txt", b"alpha");
        let mut bytes = finish(builder);
        let len = bytes.len();
        bytes.truncate(len / 2);

        let err = extract_archive(&bytes).unwrap_err();
        assert!(matches!(err, LoaderError::Decompression(_)));
    }
}
