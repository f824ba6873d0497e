use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{err, Error, ErrorKind};
use crate::pool::BufferPool;
use crate::reader::DelimitedReader;

const HEADER_BLOCK_MAX: usize = 8192;
const HEADER_DELIM: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 64;

/// Reads a part's header block (terminated by a blank line) and parses it
/// into a header map. Fails `LimitExceeded` if the block alone would exceed
/// [`HEADER_BLOCK_MAX`], mirroring the cap applied to the preamble.
pub async fn parse_part_headers<R>(
    reader: &mut DelimitedReader<R>,
) -> Result<HeaderMap<HeaderValue>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut scratch = Vec::with_capacity(HEADER_BLOCK_MAX);

    loop {
        scratch.clear();
        let n = reader.read_until_delimiter(HEADER_DELIM, &mut scratch).await?;
        if raw.len() + n > HEADER_BLOCK_MAX {
            return Err(err(ErrorKind::LimitExceeded));
        }
        raw.extend_from_slice(&scratch[..n]);
        if n < scratch.capacity() {
            break;
        }
    }

    reader.skip_delimiter(HEADER_DELIM).await?;
    raw.extend_from_slice(HEADER_DELIM);
    parse_header_block(&raw)
}

/// Tokenizes a raw `name: value\r\n...\r\n\r\n` block with `httparse` and
/// folds the result into an [`http::HeaderMap`]. Grounded on the sibling
/// `mime_multipart` crate's `httparse::parse_headers` usage.
fn parse_header_block(raw: &[u8]) -> Result<HeaderMap<HeaderValue>, Error> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(raw, &mut storage) {
        Ok(httparse::Status::Complete((_, raw_headers))) => {
            let mut map = HeaderMap::new();
            for h in raw_headers {
                let name = http::header::HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| err(ErrorKind::MalformedHeaders))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| err(ErrorKind::MalformedHeaders))?;
                map.append(name, value);
            }
            Ok(map)
        }
        Ok(httparse::Status::Partial) => Err(err(ErrorKind::UnexpectedEof)),
        Err(_) => Err(err(ErrorKind::MalformedHeaders)),
    }
}

/// Streams a part's body to `sender` by copying bytes until `boundary` is
/// found ahead of the read position, checking `cancel` between chunks so a
/// released part stops promptly instead of running to completion unread.
pub async fn copy_until_boundary<R>(
    reader: &mut DelimitedReader<R>,
    boundary: &[u8],
    limit: Option<u64>,
    pool: &BufferPool,
    sender: &mpsc::Sender<Result<Bytes, Error>>,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut sent: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(err(ErrorKind::Cancelled));
        }

        let mut chunk = pool.take();
        let n = reader.read_until_delimiter(boundary, &mut chunk).await?;

        if let Some(limit) = limit {
            sent += n as u64;
            if sent > limit {
                return Err(err(ErrorKind::LimitExceeded));
            }
        }

        if n > 0 {
            let bytes = Bytes::copy_from_slice(&chunk);
            if sender.send(Ok(bytes)).await.is_err() {
                // Consumer dropped the body stream without calling release();
                // the caller must still resynchronize with the boundary, so
                // report it exactly like an explicit cancellation.
                return Err(err(ErrorKind::Cancelled));
            }
        }

        if n < chunk.capacity() {
            return Ok(());
        }
    }
}

/// Streams exactly `len` bytes of a part's body declared by `Content-Length`,
/// chunked through the reader's packet primitive.
pub async fn copy_exact<R>(
    reader: &mut DelimitedReader<R>,
    len: u64,
    pool_chunk_size: usize,
    sender: &mpsc::Sender<Result<Bytes, Error>>,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(err(ErrorKind::Cancelled));
        }
        let want = remaining.min(pool_chunk_size as u64) as usize;
        let packet = reader.read_packet(want).await?;
        remaining -= want as u64;
        if sender.send(Ok(packet)).await.is_err() {
            return Err(err(ErrorKind::Cancelled));
        }
    }
    Ok(())
}

/// Dispatches a part's body to [`copy_exact`] when `Content-Length` is
/// present (validated against `limit` up front) or [`copy_until_boundary`]
/// otherwise.
pub async fn parse_part_body<R>(
    reader: &mut DelimitedReader<R>,
    headers: &HeaderMap<HeaderValue>,
    boundary: &[u8],
    limit: Option<u64>,
    pool: &BufferPool,
    chunk_size: usize,
    sender: &mpsc::Sender<Result<Bytes, Error>>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let declared_len = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    match declared_len {
        Some(len) => {
            if let Some(limit) = limit {
                if len > limit {
                    return Err(err(ErrorKind::LimitExceeded));
                }
            }
            copy_exact(reader, len, chunk_size, sender, cancel).await
        }
        None => copy_until_boundary(reader, boundary, limit, pool, sender, cancel).await,
    }
}
