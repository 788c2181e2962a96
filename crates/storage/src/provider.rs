//! Random-access byte providers.
//!
//! A [`Provider`] resolves a [`Descriptor`] to a sized [`ReaderAt`]. The remote
//! cache implements it on top of the object store for import, and the build
//! system supplies its own local provider for export.

use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use stowage_core::{Descriptor, Digest};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default chunk size for sequential reads (1 MiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024 * 1024;

/// A sized source of bytes that can be read at arbitrary offsets.
#[async_trait]
pub trait ReaderAt: Send {
    /// Total size of the content in bytes.
    fn size(&self) -> u64;

    /// Read into `buf` starting at `offset`, returning the number of bytes
    /// read. Returns 0 at or past the end of the content.
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Release any underlying connection or file handle.
    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

/// Resolves descriptors to readable content.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a reader over the content identified by `desc`.
    async fn reader_at(&self, desc: &Descriptor) -> StorageResult<Box<dyn ReaderAt>>;
}

/// Stream the whole content of a reader, `[0, size)`, in chunks.
///
/// The reader is closed once the last byte was read. A reader that runs dry
/// before `size` bytes yields [`StorageError::ShortRead`].
pub fn section_stream(reader: Box<dyn ReaderAt>, label: String, chunk_size: usize) -> ByteStream {
    let size = reader.size();
    let chunk_size = chunk_size.max(1) as u64;

    let stream = futures::stream::try_unfold((reader, 0u64), move |(mut reader, offset)| {
        let label = label.clone();
        async move {
            if offset >= size {
                reader.close().await?;
                return Ok(None);
            }

            let want = (size - offset).min(chunk_size) as usize;
            let mut buf = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = reader
                    .read_at(offset + filled as u64, &mut buf[filled..])
                    .await?;
                if n == 0 {
                    return Err(StorageError::ShortRead {
                        key: label,
                        expected: size,
                        actual: offset + filled as u64,
                    });
                }
                filled += n;
            }

            Ok(Some((Bytes::from(buf), (reader, offset + want as u64))))
        }
    });

    Box::pin(stream)
}

/// [`ReaderAt`] over an in-memory buffer.
pub struct BytesReaderAt {
    data: Bytes,
}

impl BytesReaderAt {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ReaderAt for BytesReaderAt {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Provider serving blobs held in memory, keyed by digest.
#[derive(Default)]
pub struct MemoryProvider {
    blobs: RwLock<HashMap<Digest, Bytes>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return a descriptor for it.
    pub fn add(&self, media_type: &str, data: impl Into<Bytes>) -> Descriptor {
        let data = data.into();
        let digest = Digest::sha256(&data);
        let desc = Descriptor::new(media_type, digest.clone(), data.len() as u64);
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest, data);
        desc
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn reader_at(&self, desc: &Descriptor) -> StorageResult<Box<dyn ReaderAt>> {
        let data = self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(desc.digest.to_string()))?;
        Ok(Box::new(BytesReaderAt::new(data)))
    }
}

/// Provider serving blobs from a local directory laid out as
/// `<root>/<algorithm>/<hex>`, the layout of an OCI image layout's `blobs/`.
#[derive(Clone, Debug)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of the blob for a digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    /// Size of a stored blob.
    pub async fn blob_size(&self, digest: &Digest) -> StorageResult<u64> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(digest.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl Provider for DirectoryProvider {
    async fn reader_at(&self, desc: &Descriptor) -> StorageResult<Box<dyn ReaderAt>> {
        let path = self.blob_path(&desc.digest);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(desc.digest.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let len = file.metadata().await?.len();
        if len != desc.size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "blob {} has {} bytes on disk, descriptor says {}",
                    desc.digest, len, desc.size
                ),
            )));
        }

        Ok(Box::new(FileReaderAt {
            file,
            size: len,
            position: 0,
        }))
    }
}

/// [`ReaderAt`] over a local file, seeking only for non-sequential reads.
struct FileReaderAt {
    file: tokio::fs::File,
    size: u64,
    position: u64,
}

#[async_trait]
impl ReaderAt for FileReaderAt {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        if offset != self.position {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.position = offset;
        }
        let n = self.file.read(buf).await?;
        self.position += n as u64;
        Ok(n)
    }
}
