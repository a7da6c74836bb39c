//! `multipart/form-data` bodies built from text fields, in-memory parts and
//! files streamed from disk.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{AttachmentErrorKind, Error, ErrorKind};

const BOUNDARY_LEN: usize = 24;

#[derive(Clone, Debug)]
enum PartSource {
    Text(String),
    Bytes(Bytes),
    File(PathBuf),
}

#[derive(Clone, Debug)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    source: PartSource,
}

impl Part {
    fn header(&self, boundary: &str) -> Bytes {
        let mut header = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"",
            escape_quoted(&self.name)
        );
        if let Some(filename) = &self.filename {
            header.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        header.push_str("\r\n");
        if let Some(content_type) = &self.content_type {
            header.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        header.push_str("\r\n");
        Bytes::from(header)
    }
}

/// A multipart form. The boundary is chosen once, when the form is created,
/// and reused if the same form is encoded again on a retry.
#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        let boundary: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        Self::with_boundary(boundary)
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            source: PartSource::Text(value.into()),
        });
        self
    }

    /// Attaches a file by path. The file is opened only when its part is
    /// reached during encoding; the content type comes from the extension.
    pub fn file(self, name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = mime_for_path(path).to_owned();
        self.file_with(name, path, filename, content_type)
    }

    pub fn file_with(
        mut self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            source: PartSource::File(path.as_ref().to_path_buf()),
        });
        self
    }

    pub fn bytes_part(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            source: PartSource::Bytes(bytes.into()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Streams the encoded body. The stream ends after the first attachment
    /// error; dropping it closes whatever file is open.
    pub(crate) fn encode(&self) -> BoxStream<'static, Result<Bytes, Error>> {
        let state = EncodeState {
            boundary: self.boundary.clone(),
            pending: self.parts.iter().cloned().collect(),
            reading: None,
            finished: false,
        };
        stream::unfold(state, EncodeState::advance).boxed()
    }

    /// Encodes the whole form into memory.
    pub async fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut body = BytesMut::new();
        let mut encoded = self.encode();
        while let Some(chunk) = encoded.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }
}

struct EncodeState {
    boundary: String,
    pending: VecDeque<Part>,
    reading: Option<(PathBuf, ReaderStream<File>)>,
    finished: bool,
}

impl EncodeState {
    async fn advance(mut self) -> Option<(Result<Bytes, Error>, Self)> {
        if self.finished {
            return None;
        }

        if let Some((path, reader)) = &mut self.reading {
            return match reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), self)),
                Some(Err(source)) => {
                    let error = attachment_error(path.clone(), source);
                    self.reading = None;
                    self.finished = true;
                    Some((Err(error), self))
                }
                None => {
                    self.reading = None;
                    Some((Ok(Bytes::from_static(b"\r\n")), self))
                }
            };
        }

        let Some(part) = self.pending.pop_front() else {
            self.finished = true;
            let closing = Bytes::from(format!("--{}--\r\n", self.boundary));
            return Some((Ok(closing), self));
        };

        let header = part.header(&self.boundary);
        match part.source {
            PartSource::Text(value) => {
                let chunk = [&header[..], value.as_bytes(), &b"\r\n"[..]].concat();
                Some((Ok(Bytes::from(chunk)), self))
            }
            PartSource::Bytes(value) => {
                let chunk = [&header[..], &value[..], &b"\r\n"[..]].concat();
                Some((Ok(Bytes::from(chunk)), self))
            }
            PartSource::File(path) => match File::open(&path).await {
                Ok(file) => {
                    debug!(path = %path.display(), "streaming multipart attachment");
                    self.reading = Some((path, ReaderStream::new(file)));
                    Some((Ok(header), self))
                }
                Err(source) => {
                    self.finished = true;
                    Some((Err(attachment_error(path, source)), self))
                }
            },
        }
    }
}

fn attachment_error(path: PathBuf, source: std::io::Error) -> Error {
    Error::from(ErrorKind::Attachment {
        path,
        kind: AttachmentErrorKind::from(source.kind()),
        source,
    })
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

pub(crate) fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use super::{MultipartForm, mime_for_path};
    use crate::error::{AttachmentErrorKind, ErrorKind};

    #[test]
    fn boundary_is_random_alphanumeric_per_form() {
        let first = MultipartForm::new();
        let second = MultipartForm::new();
        assert_eq!(first.boundary().len(), 24);
        assert!(first.boundary().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.boundary(), second.boundary());
        assert_eq!(
            first.content_type(),
            format!("multipart/form-data; boundary={}", first.boundary())
        );
    }

    #[test]
    fn content_type_follows_extension_with_binary_fallback() {
        assert_eq!(mime_for_path(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("data.json")), "application/json");
        assert_eq!(
            mime_for_path(Path::new("archive.unknown")),
            "application/octet-stream"
        );
        assert_eq!(mime_for_path(Path::new("README")), "application/octet-stream");
    }

    #[tokio::test]
    async fn two_fields_and_a_file_encode_three_parts_and_one_closing_delimiter() {
        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("temp file should be created");
        file.write_all(b"file contents")
            .expect("temp file should be writable");

        let form = MultipartForm::with_boundary("BOUNDARY")
            .text("first", "one")
            .text("second", "two")
            .file("upload", file.path());
        let body = form.to_bytes().await.expect("form should encode");
        let body = String::from_utf8(body.to_vec()).expect("body is utf-8");

        let segments: Vec<&str> = body.split("--BOUNDARY").collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], "");
        assert_eq!(segments[4], "--\r\n");
        assert_eq!(body.matches("--BOUNDARY--").count(), 1);
        assert_eq!(
            segments[1],
            "\r\nContent-Disposition: form-data; name=\"first\"\r\n\r\none\r\n"
        );
        assert!(segments[3].contains("name=\"upload\"; filename=\""));
        assert!(segments[3].contains("Content-Type: text/plain\r\n\r\n"));
        assert!(segments[3].ends_with("file contents\r\n"));
    }

    #[tokio::test]
    async fn in_memory_part_carries_filename_and_type() {
        let body = MultipartForm::with_boundary("b")
            .bytes_part("blob", "a\"b.bin", "application/x-custom", vec![1u8, 2, 3])
            .to_bytes()
            .await
            .expect("form should encode");
        let expected = b"--b\r\nContent-Disposition: form-data; name=\"blob\"; filename=\"a%22b.bin\"\r\nContent-Type: application/x-custom\r\n\r\n\x01\x02\x03\r\n--b--\r\n";
        assert_eq!(body.as_ref(), &expected[..]);
    }

    #[tokio::test]
    async fn missing_file_surfaces_attachment_error_with_path() {
        let directory = tempfile::tempdir().expect("temp dir should be created");
        let missing = directory.path().join("absent.bin");
        let error = MultipartForm::new()
            .text("field", "value")
            .file("upload", &missing)
            .to_bytes()
            .await
            .expect_err("missing file should fail");

        match error.kind() {
            ErrorKind::Attachment { path, kind, .. } => {
                assert_eq!(path, &missing);
                assert_eq!(*kind, AttachmentErrorKind::NotFound);
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn empty_form_reports_no_parts() {
        let form = MultipartForm::new();
        assert!(form.is_empty());
        assert_eq!(form.text("a", "b").len(), 1);
    }
}
