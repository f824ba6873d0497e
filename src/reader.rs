use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{err, Error, ErrorKind};

const FILL_CHUNK: usize = 8192;

/// Wraps an [`AsyncRead`] with the handful of primitives the parser needs:
/// read-until-delimiter with a bounded sink, exact-delimiter skipping,
/// bounded lookahead, and a monotonic count of bytes pulled from the
/// underlying stream. These are the only points at which the parser
/// suspends.
pub struct DelimitedReader<R> {
    inner: R,
    buf: BytesMut,
    total_read: u64,
}

impl<R> DelimitedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        DelimitedReader {
            inner,
            buf: BytesMut::new(),
            total_read: 0,
        }
    }

    /// Bytes pulled from the underlying stream so far, independent of how
    /// much of that data has been handed to a caller yet.
    pub fn total_bytes_read(&self) -> u64 {
        self.total_read
    }

    /// Bytes actually consumed (advanced past) so far: bytes pulled from the
    /// stream minus whatever is still sitting in the lookahead buffer
    /// unconsumed. Used to compute how much of a caller-declared total
    /// length remains for the epilogue.
    pub fn position(&self) -> u64 {
        self.total_read - self.buf.len() as u64
    }

    async fn fill(&mut self) -> Result<usize, Error> {
        let mut chunk = [0u8; FILL_CHUNK];
        let n = self.inner.read(&mut chunk).await.map_err(Error::io)?;
        if n > 0 {
            self.buf.extend_from_slice(&chunk[..n]);
            self.total_read += n as u64;
        }
        Ok(n)
    }

    /// Ensures at least `min_bytes` are buffered, suspending on the
    /// underlying stream as needed. Fails with [`ErrorKind::UnexpectedEof`]
    /// if the stream ends first.
    pub async fn look_ahead(&mut self, min_bytes: usize) -> Result<(), Error> {
        while self.buf.len() < min_bytes {
            if self.fill().await? == 0 {
                return Err(err(ErrorKind::UnexpectedEof));
            }
        }
        Ok(())
    }

    /// A read-only view of the bytes currently buffered. Callers must have
    /// called [`Self::look_ahead`] for at least as many bytes as they read
    /// from this slice.
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Advances past `n` buffered bytes (clamped to what is buffered).
    pub fn consumed(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Consumes exactly `delim.len()` bytes, failing if they do not equal
    /// `delim`. Used once a caller has already established that `delim` is
    /// the very next thing in the stream (e.g. because a prior
    /// `read_until_delimiter` call returned 0).
    pub async fn skip_delimiter(&mut self, delim: &[u8]) -> Result<(), Error> {
        self.look_ahead(delim.len()).await?;
        if &self.buf[..delim.len()] != delim {
            return Err(err(ErrorKind::UnexpectedEof));
        }
        self.consumed(delim.len());
        Ok(())
    }

    /// Reads into `sink` (up to its capacity) until `delim` is found ahead
    /// of the current position, `sink` fills, or the stream ends. Does not
    /// consume `delim` itself. Returns the number of bytes written; the
    /// caller should pass a freshly-cleared `sink` each call — 0 then means
    /// unambiguously that `delim` (or EOF) is the very next thing.
    pub async fn read_until_delimiter(
        &mut self,
        delim: &[u8],
        sink: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        let mut written = 0;
        loop {
            if let Some(idx) = twoway::find_bytes(&self.buf, delim) {
                let room = sink.capacity().saturating_sub(sink.len());
                let take = idx.min(room);
                sink.extend_from_slice(&self.buf[..take]);
                self.buf.advance(take);
                written += take;
                return Ok(written);
            }

            // No full match yet. A prefix of `delim` might straddle the end
            // of the buffer, so keep the last `delim.len() - 1` bytes back
            // and flush everything before that.
            let tail = delim.len().saturating_sub(1);
            let safe_len = self.buf.len().saturating_sub(tail);
            if safe_len > 0 {
                let room = sink.capacity().saturating_sub(sink.len());
                if room == 0 {
                    return Ok(written);
                }
                let take = safe_len.min(room);
                sink.extend_from_slice(&self.buf[..take]);
                self.buf.advance(take);
                written += take;
                if sink.len() == sink.capacity() {
                    return Ok(written);
                }
            } else if sink.len() == sink.capacity() {
                return Ok(written);
            }

            if self.fill().await? == 0 {
                // EOF: nothing held back can be `delim` anymore (too short).
                let room = sink.capacity().saturating_sub(sink.len());
                let take = self.buf.len().min(room);
                sink.extend_from_slice(&self.buf[..take]);
                self.buf.advance(take);
                written += take;
                return Ok(written);
            }
        }
    }

    /// Allocates and fills a buffer of exactly `n` bytes, draining any
    /// already-buffered data first.
    pub async fn read_packet(&mut self, n: usize) -> Result<Bytes, Error> {
        let mut out = BytesMut::with_capacity(n);
        let take = self.buf.len().min(n);
        out.extend_from_slice(&self.buf[..take]);
        self.buf.advance(take);

        let mut remaining = n - take;
        let mut chunk = vec![0u8; FILL_CHUNK.min(n.max(1))];
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let read = self.inner.read(&mut chunk[..want]).await.map_err(Error::io)?;
            if read == 0 {
                return Err(err(ErrorKind::UnexpectedEof));
            }
            self.total_read += read as u64;
            out.extend_from_slice(&chunk[..read]);
            remaining -= read;
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &'static [u8]) -> DelimitedReader<Cursor<&'static [u8]>> {
        DelimitedReader::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn read_until_delimiter_stops_before_delim() {
        let mut r = reader(b"hello--WORLD--rest");
        let mut sink = Vec::with_capacity(64);
        let n = r.read_until_delimiter(b"--WORLD--", &mut sink).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&sink, b"hello");
    }

    #[tokio::test]
    async fn read_until_delimiter_returns_zero_when_delim_is_next() {
        let mut r = reader(b"--WORLD--rest");
        let mut sink = Vec::with_capacity(64);
        let n = r.read_until_delimiter(b"--WORLD--", &mut sink).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn read_until_delimiter_respects_sink_capacity() {
        let mut r = reader(b"abcdefghij--X");
        let mut sink = Vec::with_capacity(3);
        let n = r.read_until_delimiter(b"--X", &mut sink).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&sink, b"abc");
    }

    #[tokio::test]
    async fn skip_delimiter_consumes_exact_bytes() {
        let mut r = reader(b"\r\n--abc\r\nrest");
        r.skip_delimiter(b"\r\n--abc").await.unwrap();
        r.look_ahead(2).await.unwrap();
        assert_eq!(r.peek(), b"\r\nrest");
    }

    #[tokio::test]
    async fn skip_delimiter_fails_on_mismatch() {
        let mut r = reader(b"nope");
        let res = r.skip_delimiter(b"\r\n--abc").await;
        assert!(matches!(res.unwrap_err().kind(), ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn read_packet_drains_buffer_then_stream() {
        let mut r = reader(b"0123456789");
        let mut sink = Vec::with_capacity(3);
        r.read_until_delimiter(b"zzz", &mut sink).await.unwrap();
        assert_eq!(&sink, b"012");
        let packet = r.read_packet(5).await.unwrap();
        assert_eq!(&packet[..], b"34567");
    }

    #[tokio::test]
    async fn read_packet_fails_on_early_eof() {
        let mut r = reader(b"ab");
        let res = r.read_packet(5).await;
        assert!(matches!(res.unwrap_err().kind(), ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn total_bytes_read_is_monotonic() {
        let mut r = reader(b"abcdefgh");
        let mut sink = Vec::with_capacity(64);
        r.read_until_delimiter(b"zzz", &mut sink).await.unwrap();
        assert_eq!(r.total_bytes_read(), 8);
    }

    #[tokio::test]
    async fn position_excludes_unconsumed_lookahead() {
        let mut r = reader(b"abc--Xdef");
        let mut sink = Vec::with_capacity(64);
        r.read_until_delimiter(b"--X", &mut sink).await.unwrap();
        // "abc" was handed to the sink and "--X" is buffered as lookahead
        // but not yet consumed, so position only counts "abc".
        assert_eq!(r.position(), 3);
        r.consumed(3);
        assert_eq!(r.position(), 6);
    }
}
