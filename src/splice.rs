//! Bidirectional splice with per-direction byte counters
//!
//! Joins a user connection and a work connection. Counters are tracked while
//! copying so totals are accurate even when one side fails mid-stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes moved in each direction by [`join`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceResult {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
}

impl SpliceResult {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

pin_project! {
    /// Stream wrapper that counts bytes read from the inner stream
    struct CountedStream<S> {
        #[pin]
        inner: S,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> CountedStream<S> {
    fn new(inner: S, read_bytes: Arc<AtomicU64>) -> Self {
        Self { inner, read_bytes }
    }
}

impl<S: AsyncRead> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy both directions until both sides reach EOF or either errors, closing
/// the peer when one side finishes. Returns the bytes moved per direction;
/// on error the counts cover everything copied before the failure.
pub async fn join<A, B>(a: A, b: B) -> (SpliceResult, std::io::Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut a = CountedStream::new(a, Arc::clone(&a_to_b));
    let mut b = CountedStream::new(b, Arc::clone(&b_to_a));

    let result = tokio::io::copy_bidirectional(&mut a, &mut b)
        .await
        .map(|_| ());

    (
        SpliceResult {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
        },
        result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_join_counts_both_directions() {
        let (user_side, user_remote) = tokio::io::duplex(4096);
        let (work_side, work_remote) = tokio::io::duplex(4096);

        let splice = tokio::spawn(join(user_remote, work_remote));

        let mut user = user_side;
        let mut work = work_side;
        user.write_all(b"request bytes").await.unwrap();
        user.shutdown().await.unwrap();

        let mut got = [0u8; 13];
        work.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"request bytes");

        work.write_all(b"reply").await.unwrap();
        work.shutdown().await.unwrap();
        let mut reply = [0u8; 5];
        user.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        let (counts, result) = splice.await.unwrap();
        result.unwrap();
        assert_eq!(counts.a_to_b, 13);
        assert_eq!(counts.b_to_a, 5);
        assert_eq!(counts.total(), 18);
    }

    #[tokio::test]
    async fn test_join_zero_bytes() {
        let (a_local, a_remote) = tokio::io::duplex(64);
        let (b_local, b_remote) = tokio::io::duplex(64);
        drop(a_local);
        drop(b_local);
        let (counts, result) = join(a_remote, b_remote).await;
        result.unwrap();
        assert_eq!(counts, SpliceResult::default());
    }

    #[tokio::test]
    async fn test_counts_exactly_match_payload() {
        // Byte counter accuracy: sum of directions equals bytes pushed.
        let (mut user, user_remote) = tokio::io::duplex(1 << 16);
        let (mut service, work_remote) = tokio::io::duplex(1 << 16);

        let splice = tokio::spawn(join(user_remote, work_remote));

        let payload = vec![0xa5u8; 70_000];
        let expected = payload.len() as u64;
        let writer = tokio::spawn(async move {
            user.write_all(&payload).await.unwrap();
            user.shutdown().await.unwrap();
            user
        });

        let mut sink = Vec::new();
        service.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len() as u64, expected);
        service.shutdown().await.unwrap();
        drop(service);

        let mut user = writer.await.unwrap();
        let mut tail = Vec::new();
        user.read_to_end(&mut tail).await.unwrap();

        let (counts, result) = splice.await.unwrap();
        result.unwrap();
        assert_eq!(counts.a_to_b, expected);
        assert_eq!(counts.b_to_a, 0);
    }
}
