//! Negotiated response compression.
//!
//! Brotli is preferred over gzip when the client advertises both. Every
//! upstream chunk is compressed and sync-flushed before it is yielded, so
//! SSE events leave the compressor immediately instead of pooling in its
//! window.

use std::io::Write;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures_util::StreamExt;
use futures_util::stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Gzip,
    Identity,
}

impl Encoding {
    fn header_value(self) -> Option<HeaderValue> {
        match self {
            Encoding::Brotli => Some(HeaderValue::from_static("br")),
            Encoding::Gzip => Some(HeaderValue::from_static("gzip")),
            Encoding::Identity => None,
        }
    }
}

/// Picks an encoding from an `Accept-Encoding` header value, preferring
/// brotli over gzip.
pub fn negotiate(accept_encoding: &str) -> Encoding {
    if accept_encoding.contains("br") {
        Encoding::Brotli
    } else if accept_encoding.contains("gzip") {
        Encoding::Gzip
    } else {
        Encoding::Identity
    }
}

/// Grows-only sink shared with the encoder; `take` drains whatever the
/// encoder has emitted since the last call.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Encoder {
    Brotli {
        writer: brotli::CompressorWriter<SharedBuf>,
        buf: SharedBuf,
    },
    Gzip {
        writer: flate2::write::GzEncoder<SharedBuf>,
        buf: SharedBuf,
    },
}

impl Encoder {
    fn new(encoding: Encoding) -> Option<Self> {
        match encoding {
            Encoding::Brotli => {
                let buf = SharedBuf::default();
                Some(Encoder::Brotli {
                    writer: brotli::CompressorWriter::new(buf.clone(), 4096, 5, 22),
                    buf,
                })
            }
            Encoding::Gzip => {
                let buf = SharedBuf::default();
                Some(Encoder::Gzip {
                    writer: flate2::write::GzEncoder::new(
                        buf.clone(),
                        flate2::Compression::default(),
                    ),
                    buf,
                })
            }
            Encoding::Identity => None,
        }
    }

    /// Compresses one chunk and emits a sync-flush boundary so the bytes
    /// actually leave the compressor.
    fn compress_chunk(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Brotli { writer, buf } => {
                writer.write_all(chunk)?;
                writer.flush()?;
                Ok(buf.take())
            }
            Encoder::Gzip { writer, buf } => {
                writer.write_all(chunk)?;
                writer.flush()?;
                Ok(buf.take())
            }
        }
    }

    /// Terminates the compressed stream, returning the trailing bytes.
    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Brotli { writer, buf } => {
                // The final block is written when the writer drops.
                drop(writer);
                Ok(buf.take())
            }
            Encoder::Gzip { mut writer, buf } => {
                writer.try_finish()?;
                drop(writer);
                Ok(buf.take())
            }
        }
    }
}

/// Axum middleware applying the negotiated encoding to every response with a
/// body. Sets `Content-Encoding` and drops any stale `Content-Length`.
pub async fn compression_middleware(request: Request, next: Next) -> Response {
    let encoding = request
        .headers()
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(negotiate)
        .unwrap_or(Encoding::Identity);

    let response = next.run(request).await;
    apply(encoding, response)
}

fn apply(encoding: Encoding, response: Response) -> Response {
    let Some(header_value) = encoding.header_value() else {
        return response;
    };
    if response.headers().contains_key(CONTENT_ENCODING) {
        return response;
    }
    // Bodiless statuses stay as-is.
    if matches!(
        response.status(),
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return response;
    }
    let Some(encoder) = Encoder::new(encoding) else {
        return response;
    };

    let (mut parts, body) = response.into_parts();
    parts.headers.insert(CONTENT_ENCODING, header_value);
    parts.headers.remove(CONTENT_LENGTH);

    let compressed = stream::unfold(
        Some((body.into_data_stream(), encoder)),
        |state| async move {
            let (mut inner, mut encoder) = state?;
            match inner.next().await {
                Some(Ok(chunk)) => match encoder.compress_chunk(&chunk) {
                    Ok(out) => Some((Ok(Bytes::from(out)), Some((inner, encoder)))),
                    Err(err) => Some((Err(axum::Error::new(err)), None)),
                },
                Some(Err(err)) => Some((Err(err), None)),
                None => match encoder.finish() {
                    Ok(out) => Some((Ok(Bytes::from(out)), None)),
                    Err(err) => Some((Err(axum::Error::new(err)), None)),
                },
            }
        },
    );

    Response::from_parts(parts, Body::from_stream(compressed))
}
