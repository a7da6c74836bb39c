//! Streaming inflate for `gzip` and `deflate` response bodies.
//!
//! Input that simply stops early is accepted as the end of the body; only
//! input the decoder cannot make sense of is an error.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};
use tracing::debug;

use crate::transport::{ResponseStream, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
}

impl ContentCoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    /// The coding to undo, if it is one this adapter handles. `identity`,
    /// stacked codings and unknown names all mean "pass through".
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?;
        let mut codings = value
            .split(',')
            .map(str::trim)
            .filter(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"));
        let coding = codings.next()?;
        if codings.next().is_some() {
            debug!(content_encoding = value, "leaving stacked content-encoding untouched");
            return None;
        }
        match coding.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            other => {
                debug!(content_encoding = other, "leaving unsupported content-encoding untouched");
                None
            }
        }
    }
}

/// Responses that carry no body never go through a decoder.
pub(crate) fn should_decode(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    let declared_empty = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        == Some(0);
    !declared_empty
}

pub(crate) fn remove_content_encoding_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodeFailure {
    pub(crate) encoding: &'static str,
    pub(crate) message: String,
}

enum Inflater {
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(DeflateDecoder<Vec<u8>>),
    /// `deflate` before the first byte shows whether a zlib header is present.
    Unsniffed,
}

pub(crate) struct Decompressor {
    coding: ContentCoding,
    inflater: Inflater,
}

impl Decompressor {
    pub(crate) fn new(coding: ContentCoding) -> Self {
        let inflater = match coding {
            ContentCoding::Gzip => Inflater::Gzip(GzDecoder::new(Vec::new())),
            ContentCoding::Deflate => Inflater::Unsniffed,
        };
        Self { coding, inflater }
    }

    /// Feeds one chunk and returns whatever output it produced.
    pub(crate) fn push(&mut self, mut input: &[u8]) -> Result<Bytes, DecodeFailure> {
        if input.is_empty() {
            return Ok(Bytes::new());
        }
        if let Inflater::Unsniffed = self.inflater {
            self.inflater = if looks_like_zlib(input) {
                Inflater::Zlib(ZlibDecoder::new(Vec::new()))
            } else {
                Inflater::Raw(DeflateDecoder::new(Vec::new()))
            };
        }

        let encoding = self.coding.as_str();
        let corrupt = |error: std::io::Error| DecodeFailure {
            encoding,
            message: error.to_string(),
        };
        while !input.is_empty() {
            let written = match &mut self.inflater {
                Inflater::Gzip(decoder) => decoder.write(input),
                Inflater::Zlib(decoder) => decoder.write(input),
                Inflater::Raw(decoder) => decoder.write(input),
                Inflater::Unsniffed => Ok(0),
            }
            .map_err(corrupt)?;
            if written == 0 {
                // Trailing bytes after the end of the compressed stream.
                break;
            }
            input = &input[written..];
        }
        match &mut self.inflater {
            Inflater::Gzip(decoder) => decoder.flush(),
            Inflater::Zlib(decoder) => decoder.flush(),
            Inflater::Raw(decoder) => decoder.flush(),
            Inflater::Unsniffed => Ok(()),
        }
        .map_err(corrupt)?;
        Ok(self.take_output())
    }

    /// Flushes the decoder at end of input. A stream that ended early yields
    /// whatever was decoded so far.
    pub(crate) fn finish(mut self) -> Bytes {
        let finished = match &mut self.inflater {
            Inflater::Gzip(decoder) => decoder.try_finish(),
            Inflater::Zlib(decoder) => decoder.try_finish(),
            Inflater::Raw(decoder) => decoder.try_finish(),
            Inflater::Unsniffed => Ok(()),
        };
        if let Err(error) = finished {
            debug!(
                encoding = self.coding.as_str(),
                error = %error,
                "compressed body ended early; keeping decoded prefix"
            );
        }
        self.take_output()
    }

    fn take_output(&mut self) -> Bytes {
        let output = match &mut self.inflater {
            Inflater::Gzip(decoder) => decoder.get_mut(),
            Inflater::Zlib(decoder) => decoder.get_mut(),
            Inflater::Raw(decoder) => decoder.get_mut(),
            Inflater::Unsniffed => return Bytes::new(),
        };
        Bytes::from(std::mem::take(output))
    }
}

/// A zlib header is a CMF byte with compression method 8 whose 16-bit
/// big-endian value with the FLG byte is a multiple of 31.
fn looks_like_zlib(input: &[u8]) -> bool {
    match input {
        [cmf, flg, ..] => cmf & 0x0f == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0,
        [cmf] => cmf & 0x0f == 8,
        [] => false,
    }
}

#[derive(Debug)]
pub(crate) enum BodyError {
    Transport(TransportError),
    Decode(DecodeFailure),
}

struct InflateState {
    source: ResponseStream,
    decompressor: Option<Decompressor>,
}

/// Wraps `source` so every item is decoded output.
pub(crate) fn inflate_stream(
    source: ResponseStream,
    coding: ContentCoding,
) -> BoxStream<'static, Result<Bytes, BodyError>> {
    let state = InflateState {
        source,
        decompressor: Some(Decompressor::new(coding)),
    };
    stream::unfold(state, |mut state| async move {
        loop {
            let decompressor = state.decompressor.as_mut()?;
            match state.source.next().await {
                Some(Ok(chunk)) => match decompressor.push(&chunk) {
                    Ok(output) if output.is_empty() => continue,
                    Ok(output) => return Some((Ok(output), state)),
                    Err(failure) => {
                        state.decompressor = None;
                        return Some((Err(BodyError::Decode(failure)), state));
                    }
                },
                Some(Err(error)) => {
                    state.decompressor = None;
                    return Some((Err(BodyError::Transport(error)), state));
                }
                None => {
                    let output = state.decompressor.take()?.finish();
                    if output.is_empty() {
                        return None;
                    }
                    return Some((Ok(output), state));
                }
            }
        }
    })
    .boxed()
}
