//! Blob storage for action outputs.
//!
//! Content is streamed through a tee that hashes every byte with SHA-256
//! and keeps the first 512 KiB for content-type sniffing. Blobs land under
//! `playbooks/{run_id}/{declared_path}` below the connection root. Writes go
//! to a `.partial` sibling that is renamed into place only once the content
//! is fully flushed, so a failed write never leaves a listed blob behind.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use remedy_types::Artifact;

use crate::error::{EngineError, Result};

/// Bytes retained for MIME sniffing.
const SNIFF_LIMIT: usize = 512 * 1024;
const CHUNK_SIZE: usize = 64 * 1024;

/// A `file://` blob store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    connection: String,
}

impl ArtifactStore {
    /// Open the store named by a connection URL. Only `file://` is supported.
    pub fn from_url(connection: &str) -> Result<Self> {
        let url = Url::parse(connection)
            .map_err(|e| EngineError::Validation(format!("artifact connection '{connection}': {e}")))?;
        if url.scheme() != "file" {
            return Err(EngineError::Validation(format!(
                "artifact connection scheme '{}' is not supported",
                url.scheme()
            )));
        }
        let root = url.to_file_path().map_err(|_| {
            EngineError::Validation(format!("artifact connection '{connection}' is not a local path"))
        })?;
        Ok(Self {
            root,
            connection: connection.to_string(),
        })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let connection = format!("file://{}", root.display());
        Self { root, connection }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Stream `reader` into a new blob for an action of `run_id`.
    ///
    /// The returned row is not persisted; callers store it alongside the
    /// action's completion.
    pub async fn save<R>(
        &self,
        run_id: Uuid,
        run_action_id: Uuid,
        declared_path: &str,
        reader: R,
    ) -> Result<Artifact>
    where
        R: AsyncRead + Unpin,
    {
        let relative = blob_path(run_id, declared_path)?;
        let mut artifact = Artifact::new(run_action_id, relative);
        let written = self.write_blob(&artifact.path, reader, None).await?;
        artifact.size = written.size;
        artifact.checksum = written.checksum;
        artifact.content_type = written.content_type;
        artifact.connection = Some(self.connection.clone());
        debug!(
            artifact_id = %artifact.id,
            path = %artifact.path,
            size = artifact.size,
            "Saved artifact"
        );
        Ok(artifact)
    }

    pub async fn save_bytes(
        &self,
        run_id: Uuid,
        run_action_id: Uuid,
        declared_path: &str,
        bytes: &[u8],
    ) -> Result<Artifact> {
        self.save(run_id, run_action_id, declared_path, bytes).await
    }

    pub async fn save_file(
        &self,
        run_id: Uuid,
        run_action_id: Uuid,
        declared_path: &str,
        source: &Path,
    ) -> Result<Artifact> {
        let file = tokio::fs::File::open(source).await?;
        self.save(run_id, run_action_id, declared_path, file).await
    }

    /// Receive the content of an already-recorded artifact, e.g. one uploaded
    /// by an agent. The content must hash to the recorded checksum.
    pub async fn receive<R>(&self, artifact: &Artifact, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        check_relative(&artifact.path)?;
        let expected = Some(artifact.checksum.as_str()).filter(|c| !c.is_empty());
        let written = self.write_blob(&artifact.path, reader, expected).await?;
        Ok(written.size)
    }

    /// Open an artifact's content for reading.
    pub async fn open(&self, artifact: &Artifact) -> Result<tokio::fs::File> {
        check_relative(&artifact.path)?;
        tokio::fs::File::open(self.root.join(&artifact.path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EngineError::NotFound(format!("artifact content {}", artifact.id))
                }
                _ => EngineError::Io(e),
            })
    }

    async fn write_blob<R>(
        &self,
        relative: &str,
        mut reader: R,
        expected_checksum: Option<&str>,
    ) -> Result<Written>
    where
        R: AsyncRead + Unpin,
    {
        let dest = self.root.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension(partial_extension(&dest));

        let outcome = tee_into(&mut reader, &partial).await.and_then(|written| {
            match expected_checksum {
                Some(expected) if expected != written.checksum => Err(EngineError::Validation(
                    format!("checksum mismatch for '{relative}'"),
                )),
                _ => Ok(written),
            }
        });

        match outcome {
            Ok(mut written) => {
                tokio::fs::rename(&partial, &dest).await?;
                written.content_type = sniff(&written.head, relative);
                Ok(written)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial artifact");
                }
                Err(e)
            }
        }
    }
}

#[derive(Debug, Default)]
struct Written {
    size: u64,
    checksum: String,
    content_type: String,
    head: Vec<u8>,
}

async fn tee_into<R>(reader: &mut R, path: &Path) -> Result<Written>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut written = Written::default();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        hasher.update(chunk);
        if written.head.len() < SNIFF_LIMIT {
            let take = (SNIFF_LIMIT - written.head.len()).min(n);
            written.head.extend_from_slice(&chunk[..take]);
        }
        file.write_all(chunk).await?;
        written.size += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    written.checksum = hex::encode(hasher.finalize());
    Ok(written)
}

fn sniff(head: &[u8], path: &str) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if path.ends_with(".json") {
        return "application/json".to_string();
    }
    if std::str::from_utf8(head).is_ok() {
        "text/plain".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

fn partial_extension(dest: &Path) -> String {
    match dest.extension() {
        Some(ext) => format!("{}.partial", ext.to_string_lossy()),
        None => "partial".to_string(),
    }
}

/// `playbooks/{run_id}/{declared_path}`, rejecting paths that escape.
fn blob_path(run_id: Uuid, declared_path: &str) -> Result<String> {
    let declared = declared_path.trim_start_matches("./").trim_start_matches('/');
    let relative = format!("playbooks/{run_id}/{declared}");
    check_relative(&relative)?;
    Ok(relative)
}

fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(EngineError::Validation(format!("invalid artifact path '{path}'")))
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_open() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::at(dir.path());
        let run_id = Uuid::new_v4();

        let a = store
            .save_bytes(run_id, Uuid::new_v4(), "out/report.txt", b"hello artifacts")
            .await
            .unwrap();
        assert_eq!(a.path, format!("playbooks/{run_id}/out/report.txt"));
        assert_eq!(a.size, 15);
        assert_eq!(a.checksum, checksum(b"hello artifacts"));
        assert_eq!(a.content_type, "text/plain");

        let mut content = String::new();
        store
            .open(&a)
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "hello artifacts");
        assert!(!dir.path().join(format!("{}.partial", a.path)).exists());
    }

    #[tokio::test]
    async fn test_sniffs_binary_types() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::at(dir.path());
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let a = store
            .save_bytes(Uuid::new_v4(), Uuid::new_v4(), "image", &png)
            .await
            .unwrap();
        assert_eq!(a.content_type, "image/png");

        let j = store
            .save_bytes(Uuid::new_v4(), Uuid::new_v4(), "result.json", b"{\"a\":1}")
            .await
            .unwrap();
        assert_eq!(j.content_type, "application/json");
    }

    #[tokio::test]
    async fn test_receive_verifies_checksum() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let agent_side = ArtifactStore::at(src.path());
        let host_side = ArtifactStore::at(dst.path());

        let a = agent_side
            .save_bytes(Uuid::new_v4(), Uuid::new_v4(), "log.txt", b"line one\n")
            .await
            .unwrap();
        let size = host_side.receive(&a, &b"line one\n"[..]).await.unwrap();
        assert_eq!(size, 9);

        let err = host_side.receive(&a, &b"tampered\n"[..]).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut content = String::new();
        host_side
            .open(&a)
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "line one\n");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        assert!(blob_path(Uuid::new_v4(), "../../etc/passwd").is_err());
        assert!(blob_path(Uuid::new_v4(), "/abs/ok.txt").is_ok());
        assert!(check_relative("playbooks/x/../../y").is_err());
    }

    #[test]
    fn test_from_url() {
        let s = ArtifactStore::from_url("file:///var/lib/remedy/artifacts").unwrap();
        assert_eq!(s.root(), Path::new("/var/lib/remedy/artifacts"));
        assert!(ArtifactStore::from_url("s3://bucket").is_err());
        assert!(ArtifactStore::from_url("not a url").is_err());
    }
}
