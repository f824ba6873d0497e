//! Streaming parser for HTTP `multipart/*` message bodies: a lazy, ordered
//! sequence of preamble / part / epilogue events over an `AsyncRead`,
//! without materializing the whole body in memory.

mod boundary;
mod config;
mod error;
mod header_map;
mod parser;
mod part;
mod pool;
mod reader;

use tokio::io::AsyncRead;

pub use boundary::{parse_boundary, Boundary};
pub use config::{Config, Limits};
pub use error::{Error, ErrorKind};
pub use header_map::ContentTypeSource;
pub use parser::{EventStream, MultipartEvent, PartBody, PartHeaders};

/// True if `headers` carries a `Content-Type` whose top-level type is
/// `multipart`.
pub fn expect_multipart(headers: &impl ContentTypeSource) -> bool {
    headers
        .content_type()
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false)
}

/// Parses a multipart body read from `input`, extracting the boundary from
/// `content_type`. Fails immediately (before any bytes are read) if
/// `content_type` is not `multipart/*` or carries no `boundary` parameter.
///
/// `content_length`, when known (e.g. from an HTTP `Content-Length` header),
/// is the total byte length of `input`; it is required to emit an `Epilogue`
/// event at all, since without it there is no way to tell epilogue bytes
/// apart from trailing bytes a connection close happens to leave behind.
pub fn parse_multipart<R>(
    input: R,
    content_type: &str,
    content_length: Option<u64>,
) -> Result<EventStream, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    parse_multipart_with_config(input, content_type, content_length, Config::default())
}

/// Like [`parse_multipart`], with explicit size limits and channel
/// backpressure.
pub fn parse_multipart_with_config<R>(
    input: R,
    content_type: &str,
    content_length: Option<u64>,
    config: Config,
) -> Result<EventStream, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if !content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/")
    {
        return Err(error::err(ErrorKind::NotMultipart));
    }
    let boundary = parse_boundary(content_type)?;
    Ok(parse_multipart_boundary_with_config(
        input,
        boundary,
        content_length,
        config,
    ))
}

/// Parses a multipart body given an already-extracted [`Boundary`], skipping
/// the `Content-Type` check entirely. Useful when the boundary was resolved
/// by the caller ahead of time.
///
/// `total_length`, when known, is the total byte length of `input` — see
/// [`parse_multipart`] for why it gates the `Epilogue` event.
pub fn parse_multipart_boundary<R>(
    input: R,
    boundary: Boundary,
    total_length: Option<u64>,
) -> EventStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    parse_multipart_boundary_with_config(input, boundary, total_length, Config::default())
}

/// Like [`parse_multipart_boundary`], with an explicit [`Config`].
pub fn parse_multipart_boundary_with_config<R>(
    input: R,
    boundary: Boundary,
    total_length: Option<u64>,
    config: Config,
) -> EventStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    parser::spawn(input, boundary, total_length, config)
}
