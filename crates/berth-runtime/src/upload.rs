//! Streaming single files into a container's filesystem.
//!
//! The payload is wrapped in a one-entry tar archive. A blocking task writes
//! the archive into a bounded channel while the engine call consumes the
//! other end, so the archive is never held in memory twice. Whichever side
//! fails first closes the channel and the other side stops.

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use berth_common::constants::UPLOAD_FILE_MODE;
use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_engine::ContainerEngine;
use berth_engine::engine::ArchiveStream;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Archive bytes sent to the engine per chunk.
const CHUNK_SIZE: usize = 32 * 1024;

/// Chunks buffered between the archive writer and the engine call.
const CHANNEL_DEPTH: usize = 4;

/// Uploads files into containers.
#[derive(Clone)]
pub struct FileInjector {
    engine: Arc<dyn ContainerEngine>,
}

impl FileInjector {
    /// Creates an injector over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Writes `content` to the absolute `path` inside the container, with
    /// mode `0644`. Missing parent directories are created by the engine.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a path that cannot name a file, an `Operation`
    /// error naming `upload` if the engine call fails, or `Io` if the
    /// archive could not be written.
    pub async fn upload(&self, id: &ContainerId, path: &str, content: Bytes) -> Result<()> {
        let entry = entry_path(path)?;
        let size = content.len();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let writer = tokio::task::spawn_blocking(move || {
            let abort = tx.clone();
            let result = write_archive(&entry, &content, ChannelWriter::new(tx));
            if let Err(e) = &result {
                let _ = abort.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
            }
            result
        });

        let archive: ArchiveStream = Box::pin(ReceiverStream::new(rx));
        let uploaded = self
            .engine
            .upload_archive(id, "/", archive)
            .await
            .map_err(|e| BerthError::operation("upload", id.as_str(), e));

        let written = writer.await.map_err(|e| BerthError::Task {
            message: format!("archive writer for {path}: {e}"),
        })?;

        uploaded?;
        written.map_err(|source| BerthError::Io {
            path: PathBuf::from(path),
            source,
        })?;
        tracing::info!(id = %id, path, size, "file uploaded");
        Ok(())
    }

    /// Copies a host file into the container at the same path.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the host file cannot be read, otherwise as
    /// [`upload`](Self::upload).
    pub async fn upload_from_host(&self, id: &ContainerId, host_path: &Path) -> Result<()> {
        let content = tokio::fs::read(host_path)
            .await
            .map_err(|source| BerthError::Io {
                path: host_path.to_path_buf(),
                source,
            })?;
        let path = host_path.to_string_lossy();
        self.upload(id, &path, Bytes::from(content)).await
    }
}

impl std::fmt::Debug for FileInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInjector").finish_non_exhaustive()
    }
}

/// The archive entry name for `path`: relative to `/`, no `..`, not a
/// directory.
fn entry_path(path: &str) -> Result<PathBuf> {
    let invalid = |reason: &str| BerthError::Config {
        message: format!("cannot upload to {path:?}: {reason}"),
    };
    if path.ends_with('/') {
        return Err(invalid("path names a directory"));
    }
    let mut entry = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => entry.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(invalid("path must not leave the root"));
            }
        }
    }
    if entry.as_os_str().is_empty() {
        return Err(invalid("path names no file"));
    }
    Ok(entry)
}

fn write_archive(entry: &Path, content: &[u8], writer: ChannelWriter) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(UPLOAD_FILE_MODE);
    header.set_size(content.len() as u64);

    let mut builder = tar::Builder::new(writer);
    builder.append_data(&mut header, entry, content)?;
    builder.into_inner()?.flush()
}

/// Blocking writer feeding archive chunks into the engine call's stream.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away")
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use berth_engine::params::CreateParams;
    use berth_engine::testing::StubEngine;

    use super::*;

    fn unpack(archive: &[u8]) -> Vec<(PathBuf, u32, Vec<u8>)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .expect("entries")
            .map(|entry| {
                let mut entry = entry.expect("entry");
                let path = entry.path().expect("path").into_owned();
                let mode = entry.header().mode().expect("mode");
                let mut data = Vec::new();
                let _ = entry.read_to_end(&mut data).expect("data");
                (path, mode, data)
            })
            .collect()
    }

    async fn container(engine: &Arc<StubEngine>) -> ContainerId {
        engine
            .create_container(&CreateParams::default())
            .await
            .expect("create")
    }

    #[test]
    fn entry_paths_are_relative_to_root() {
        assert_eq!(
            entry_path("/usr/local/bin/entrypoint.sh").expect("path"),
            PathBuf::from("usr/local/bin/entrypoint.sh")
        );
        assert_eq!(entry_path("etc/motd").expect("path"), PathBuf::from("etc/motd"));
        for bad in ["", "/", "/etc/", "/etc/../../passwd"] {
            assert!(entry_path(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn upload_sends_single_entry_archive() {
        let engine = Arc::new(StubEngine::default());
        let id = container(&engine).await;
        let injector = FileInjector::new(engine.clone());

        injector
            .upload(&id, "/entrypoint.sh", Bytes::from_static(b"#!/bin/sh\nexec \"$@\"\n"))
            .await
            .expect("upload");

        let uploads = engine.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].destination, "/");
        let entries = unpack(&uploads[0].archive);
        assert_eq!(
            entries,
            vec![(
                PathBuf::from("entrypoint.sh"),
                0o644,
                b"#!/bin/sh\nexec \"$@\"\n".to_vec()
            )]
        );
    }

    #[tokio::test]
    async fn large_payload_spans_many_chunks() {
        let engine = Arc::new(StubEngine::default());
        let id = container(&engine).await;
        let payload: Vec<u8> = (0..=250_u8).cycle().take(200_000).collect();

        FileInjector::new(engine.clone())
            .upload(&id, "/data/blob.bin", Bytes::from(payload.clone()))
            .await
            .expect("upload");

        let entries = unpack(&engine.uploads()[0].archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2, payload);
    }

    #[tokio::test]
    async fn engine_failure_stops_the_writer() {
        let engine = Arc::new(StubEngine::default());
        let payload = Bytes::from(vec![0_u8; 1 << 20]);

        let err = FileInjector::new(engine.clone())
            .upload(&ContainerId::new("missing"), "/big", payload)
            .await
            .expect_err("unknown container");

        assert!(matches!(err, BerthError::Operation { operation: "upload", .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn bad_path_makes_no_engine_call() {
        let engine = Arc::new(StubEngine::default());
        let id = container(&engine).await;

        let err = FileInjector::new(engine.clone())
            .upload(&id, "/tmp/", Bytes::new())
            .await
            .expect_err("directory path");

        assert!(matches!(err, BerthError::Config { .. }));
        assert_eq!(engine.count("upload_archive"), 0);
    }

    #[tokio::test]
    async fn host_file_lands_at_same_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "-----BEGIN CERTIFICATE-----\n").expect("write");
        let engine = Arc::new(StubEngine::default());
        let id = container(&engine).await;

        FileInjector::new(engine.clone())
            .upload_from_host(&id, &ca)
            .await
            .expect("upload");

        let entries = unpack(&engine.uploads()[0].archive);
        let expected = ca.strip_prefix("/").expect("absolute tempdir");
        assert_eq!(entries[0].0, expected);
    }
}
