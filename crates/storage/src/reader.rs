//! Random-access reads over remote objects.

use crate::error::StorageResult;
use crate::provider::ReaderAt;
use crate::traits::{ByteStream, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;

/// [`ReaderAt`] over a stored object.
///
/// Sequential reads keep using the stream opened by the previous call; a
/// read at any other offset reopens the object at that offset.
pub struct RemoteReaderAt {
    store: Arc<dyn ObjectStore>,
    key: String,
    size: u64,
    current: Option<OpenStream>,
}

struct OpenStream {
    /// Offset of the next byte the stream will yield.
    offset: u64,
    stream: ByteStream,
    pending: Bytes,
}

impl RemoteReaderAt {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>, size: u64) -> Self {
        Self {
            store,
            key: key.into(),
            size,
            current: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl ReaderAt for RemoteReaderAt {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let mut open = match self.current.take() {
            Some(open) if open.offset == offset => open,
            _ => {
                tracing::trace!(key = %self.key, offset, "opening object stream");
                OpenStream {
                    offset,
                    stream: self.store.get(&self.key, offset).await?,
                    pending: Bytes::new(),
                }
            }
        };

        let mut written = 0;
        while written < buf.len() {
            if open.pending.is_empty() {
                match open.stream.next().await {
                    Some(chunk) => open.pending = chunk?,
                    None => break,
                }
                continue;
            }
            let n = open.pending.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&open.pending[..n]);
            open.pending = open.pending.slice(n..);
            written += n;
        }

        open.offset += written as u64;
        if written > 0 {
            self.current = Some(open);
        }
        Ok(written)
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
