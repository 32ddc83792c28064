//! Response bodies and the fan-out copy that feeds the client and the cache
//! from a single read of the origin body.

use crate::cache::CacheWriter;
use crate::error::ProxyError;
use bytes::Bytes;
use futures::Stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use log::{debug, error, warn};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

const CHANNEL_CAPACITY: usize = 16;

pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    full(Bytes::new())
}

/// Streams a cached file without reading it into memory.
pub struct StreamingFileBody {
    stream: ReaderStream<File>,
}

impl StreamingFileBody {
    pub fn new(file: File) -> Self {
        Self {
            stream: ReaderStream::new(file),
        }
    }
}

impl Body for StreamingFileBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client half of the fan-out: whatever the copy task sends, in order.
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

/// Writes every chunk to the client channel and, while it stays healthy, to
/// a cache entry.
///
/// A cache-side failure only drops the cache branch; the client keeps
/// receiving. A client-side failure is returned to the caller, which must
/// then abort.
pub struct Tee {
    client: mpsc::Sender<io::Result<Bytes>>,
    cache: Option<CacheWriter>,
}

impl Tee {
    pub fn new(cache: Option<CacheWriter>) -> (Self, ChannelBody) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { client: tx, cache }, ChannelBody { rx })
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        if let Some(writer) = self.cache.as_mut() {
            if let Err(e) = writer.write_chunk(&chunk).await {
                warn!("Cache write failed, continuing without cache: {}", e);
                if let Some(writer) = self.cache.take() {
                    writer.abort().await;
                }
            }
        }

        self.client
            .send(Ok(chunk))
            .await
            .map_err(|_| ProxyError::StreamIo("client went away".to_string()))
    }

    /// Origin read failed: truncate the client body with an error and drop
    /// the cache entry.
    pub async fn fail(mut self, err: io::Error) {
        if let Some(writer) = self.cache.take() {
            writer.abort().await;
        }
        let _ = self.client.send(Err(err)).await;
    }

    pub async fn abort(mut self) {
        if let Some(writer) = self.cache.take() {
            writer.abort().await;
        }
    }

    /// Commits the cache entry, runs `on_commit`, then ends the client body.
    /// Returns the number of bytes committed when a cache entry was written.
    pub async fn finish<F: FnOnce(u64)>(mut self, on_commit: F) -> Option<u64> {
        let committed = match self.cache.take() {
            Some(writer) => match writer.commit().await {
                Ok(written) => {
                    on_commit(written);
                    Some(written)
                }
                Err(e) => {
                    error!("{}", e);
                    None
                }
            },
            None => None,
        };
        drop(self.client);
        committed
    }
}

/// Single read of `body`, fanned out through `tee`. `on_commit` runs after
/// the cache entry is renamed into place and before the client sees the end
/// of the body.
pub async fn copy_body<B, F>(mut body: B, mut tee: Tee, on_commit: F) -> Option<u64>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
    F: FnOnce(u64),
{
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(chunk) = frame.into_data() else {
                    continue;
                };
                if let Err(e) = tee.write(chunk).await {
                    debug!("Stopping copy: {}", e);
                    tee.abort().await;
                    return None;
                }
            }
            Err(e) => {
                error!("io copy err: {}", e);
                tee.fail(io::Error::other(e.to_string())).await;
                return None;
            }
        }
    }

    tee.finish(on_commit).await
}
