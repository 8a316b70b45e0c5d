//! Bounded reader for OpenAI-style Server-Sent-Events streams.
//!
//! Yields the `data:` payload of each event as one `String`; multi-line data
//! is joined with `\n`, other fields are ignored, and the stream terminates
//! cleanly on the `[DONE]` sentinel.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

use crate::{Result, RouterError};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(RouterError::InvalidStream(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

/// Reads until the next complete event, returning its joined data payload.
/// `None` means end of stream, which includes the `[DONE]` sentinel.
async fn read_next_data<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();

    loop {
        let has_line = read_line_limited(reader, line_bytes, limits.max_line_bytes).await?;
        if !has_line {
            if buffer.is_empty() || buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let line = std::str::from_utf8(line_bytes)
            .map_err(|err| RouterError::InvalidStream(format!("invalid SSE UTF-8: {err}")))?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator_bytes = usize::from(!buffer.is_empty());
            if buffer
                .len()
                .saturating_add(separator_bytes)
                .saturating_add(rest.len())
                > limits.max_event_bytes
            {
                return Err(RouterError::InvalidStream(format!(
                    "SSE event exceeds max_event_bytes={}",
                    limits.max_event_bytes
                )));
            }
            if separator_bytes == 1 {
                buffer.push('\n');
            }
            buffer.push_str(rest);
        }
    }
}

pub fn data_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new(), limits),
        |(mut reader, mut line_bytes, mut buffer, limits)| async move {
            match read_next_data(&mut reader, &mut line_bytes, &mut buffer, limits).await? {
                Some(data) => Ok(Some((data, (reader, line_bytes, buffer, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn data_stream_from_response(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    data_stream_from_reader_with_limits(tokio::io::BufReader::new(reader), SseLimits::default())
}
