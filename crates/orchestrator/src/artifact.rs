//! Result extraction: hand a completed job's file to the caller, then remove it.
//!
//! The artifact is single-use. Its temporary file is deleted as soon as the
//! reader reaches end of file, or when the reader is dropped before that.
//! Deletion failures are logged and never reported to the caller, who has
//! already received (or abandoned) the data.

use crate::error::JobError;
use crate::types::CompletedArtifact;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Name used when sanitization leaves nothing.
pub const FALLBACK_NAME: &str = "audio.mp3";

/// Reduce a filename to characters safe for filesystems and HTTP headers.
///
/// Keeps ASCII letters, digits, space, `.`, `-` and `_`; any whitespace
/// counts as a space, runs of spaces collapse to one, and the result is
/// trimmed. Everything else, including non-ASCII text, is removed.
///
/// # Examples
///
/// ```
/// use orchestrator::artifact::sanitize_filename;
///
/// assert_eq!(sanitize_filename("Café  del Mar: Live!.mp3"), "Caf del Mar Live.mp3");
/// assert_eq!(sanitize_filename("  a\t\tb  "), "a b");
/// assert_eq!(sanitize_filename("日本語"), "");
/// ```
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;

    for c in name.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }

    out
}

/// Display name for an artifact path: its sanitized final component, or
/// [`FALLBACK_NAME`] when nothing usable remains.
pub fn display_name(path: &Path) -> String {
    let raw = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();

    let clean = sanitize_filename(&raw);
    if clean.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        clean
    }
}

/// MIME type to advertise for an artifact.
pub fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("opus") | Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// An opened artifact ready to be streamed to the caller.
pub struct Artifact {
    /// Location of the file on disk
    pub path: PathBuf,
    /// Sanitized name to offer the caller
    pub display_name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type
    pub content_type: &'static str,
    reader: ArtifactReader,
}

impl Artifact {
    /// Take the byte stream. The file is removed once it has been fully read.
    pub fn into_reader(self) -> ArtifactReader {
        self.reader
    }

    /// Read the whole artifact into memory (removing the file).
    pub async fn into_bytes(self) -> Result<Vec<u8>, JobError> {
        let mut reader = self.reader;
        let mut bytes = Vec::with_capacity(self.size as usize);
        reader.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

/// Open the artifact of a completed job.
///
/// # Errors
///
/// Returns [`JobError::ArtifactMissing`] if the file no longer exists, and
/// [`JobError::Io`] for other failures to open it.
pub async fn extract(completed: &CompletedArtifact) -> Result<Artifact, JobError> {
    let path = completed.path.clone();

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "artifact missing at extraction time");
            return Err(JobError::ArtifactMissing(path));
        }
        Err(e) => return Err(JobError::Io(e)),
    };
    let size = file.metadata().await?.len();

    Ok(Artifact {
        display_name: display_name(&path),
        content_type: content_type(&path),
        size,
        reader: ArtifactReader {
            file: Some(file),
            path: path.clone(),
            removed: false,
        },
        path,
    })
}

/// Byte stream over an artifact that deletes the file when done.
pub struct ArtifactReader {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    removed: bool,
}

impl ArtifactReader {
    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&mut self, fully_read: bool) {
        if self.removed {
            return;
        }
        self.removed = true;
        // Close before removing
        self.file = None;

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), fully_read, "artifact removed")
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove artifact")
            }
        }
    }
}

impl AsyncRead for ArtifactReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            // Already at EOF and removed
            return Poll::Ready(Ok(()));
        };

        let before = buf.filled().len();
        match Pin::new(file).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before && buf.remaining() > 0 {
                    this.cleanup(true);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for ArtifactReader {
    fn drop(&mut self) {
        self.cleanup(false);
    }
}
