//! Text file access for the transfer actor.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bandlink_core::{file_name, FileOffer, TextRange};
use tokio::sync::Mutex;

/// Chars between recorded byte offsets in `DecodedText`.
const MARK_STRIDE: usize = 1024;

/// Reads ranges of a file's decoded text.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// `range` is in chars; a range running past the end is clamped.
    async fn read_text(&self, path: &Path, range: TextRange) -> io::Result<String>;
}

/// Reads from the local filesystem, keeping the most recently read file decoded. The cached
/// text is reused only while the file's length and modification time are unchanged.
#[derive(Default)]
pub struct FsSource {
    cached: Mutex<Option<Cached>>,
}

struct Cached {
    path: PathBuf,
    stamp: Stamp,
    text: Arc<DecodedText>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    async fn of(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

impl FsSource {
    pub fn new() -> Self {
        Self::default()
    }

    async fn load(&self, path: &Path) -> io::Result<Arc<DecodedText>> {
        let mut cached = self.cached.lock().await;
        let stamp = Stamp::of(path).await?;
        if let Some(c) = cached.as_ref() {
            if c.path == path && c.stamp == stamp {
                return Ok(c.text.clone());
            }
        }
        let text = Arc::new(DecodedText::new(decode(tokio::fs::read(path).await?)));
        *cached = Some(Cached {
            path: path.to_path_buf(),
            stamp,
            text: text.clone(),
        });
        Ok(text)
    }
}

#[async_trait]
impl FileSource for FsSource {
    async fn read_text(&self, path: &Path, range: TextRange) -> io::Result<String> {
        let text = self.load(path).await?;
        Ok(text.slice(range).to_string())
    }
}

/// Size the file and decode it once to learn its text length.
pub async fn measure(path: impl AsRef<Path>) -> io::Result<FileOffer> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await?;
    let byte_size = bytes.len() as u64;
    let text_length = decode(bytes).chars().count() as u64;
    let display = path.to_string_lossy();
    Ok(FileOffer {
        filename: file_name(&display).to_string(),
        path: path.to_path_buf(),
        byte_size,
        text_length,
    })
}

fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Decoded text with sparse char-to-byte offsets, so slicing by char index does not
/// rescan from the start.
struct DecodedText {
    text: String,
    marks: Vec<usize>,
    chars: usize,
}

impl DecodedText {
    fn new(text: String) -> Self {
        let mut marks = Vec::new();
        let mut chars = 0;
        for (i, (byte, _)) in text.char_indices().enumerate() {
            if i % MARK_STRIDE == 0 {
                marks.push(byte);
            }
            chars = i + 1;
        }
        Self { text, marks, chars }
    }

    fn byte_offset(&self, char_index: usize) -> usize {
        if char_index >= self.chars {
            return self.text.len();
        }
        let start = self.marks[char_index / MARK_STRIDE];
        self.text[start..]
            .char_indices()
            .nth(char_index % MARK_STRIDE)
            .map_or(self.text.len(), |(b, _)| start + b)
    }

    fn slice(&self, range: TextRange) -> &str {
        let from = usize::try_from(range.offset).unwrap_or(usize::MAX);
        let to = from.saturating_add(usize::try_from(range.len).unwrap_or(usize::MAX));
        &self.text[self.byte_offset(from)..self.byte_offset(to)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn range(offset: u64, len: u64) -> TextRange {
        TextRange { offset, len }
    }

    #[tokio::test]
    async fn reads_char_ranges_and_clamps() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all("héllo wörld".as_bytes()).unwrap();
        let source = FsSource::new();
        assert_eq!(source.read_text(f.path(), range(0, 5)).await.unwrap(), "héllo");
        assert_eq!(source.read_text(f.path(), range(6, 100)).await.unwrap(), "wörld");
        assert_eq!(source.read_text(f.path(), range(50, 10)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn measure_counts_bytes_and_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.txt");
        std::fs::write(&path, "日本語abc").unwrap();
        let offer = measure(&path).await.unwrap();
        assert_eq!(offer.filename, "book.txt");
        assert_eq!(offer.byte_size, 12);
        assert_eq!(offer.text_length, 6);
        assert_eq!(offer.path, path);
    }

    #[tokio::test]
    async fn edited_file_is_read_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.txt");
        std::fs::write(&path, "first version").unwrap();
        let source = FsSource::new();
        assert_eq!(
            source.read_text(&path, range(0, 100)).await.unwrap(),
            "first version"
        );

        std::fs::write(&path, "SECOND edit").unwrap();
        assert_eq!(measure(&path).await.unwrap().text_length, 11);
        assert_eq!(
            source.read_text(&path, range(0, 100)).await.unwrap(),
            "SECOND edit"
        );
    }

    #[tokio::test]
    async fn unchanged_file_stays_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.txt");
        std::fs::write(&path, "abcdef").unwrap();
        let source = FsSource::new();
        source.read_text(&path, range(0, 1)).await.unwrap();
        let first = source.cached.lock().await.as_ref().unwrap().text.clone();
        assert_eq!(source.read_text(&path, range(2, 2)).await.unwrap(), "cd");
        let second = source.cached.lock().await.as_ref().unwrap().text.clone();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsSource::new();
        assert!(source
            .read_text(&dir.path().join("nope.txt"), range(0, 1))
            .await
            .is_err());
        assert!(measure(dir.path().join("nope.txt")).await.is_err());
    }

    #[test]
    fn slicing_across_mark_boundaries() {
        let text: String = (0..3000).map(|i| if i % 2 == 0 { 'a' } else { 'é' }).collect();
        let decoded = DecodedText::new(text.clone());
        let expected: String = text.chars().skip(1020).take(10).collect();
        assert_eq!(decoded.slice(range(1020, 10)), expected);
        let tail: String = text.chars().skip(2990).collect();
        assert_eq!(decoded.slice(range(2990, 1000)), tail);
    }

    #[test]
    fn empty_text() {
        let decoded = DecodedText::new(String::new());
        assert_eq!(decoded.slice(range(0, 10)), "");
    }
}
