//! Chunked file transfer over the ratchet path.
//!
//! Files are split into 1 MiB chunks; each chunk carries its own SHA-256
//! and its index, and the whole file is pinned by a top-level checksum.
//! Up to three chunks are in flight at once. Chunks that are not
//! acknowledged in time are resent; once the retry budget is spent the
//! upload parks in `Failed` and can be resumed. Chunk payloads ride the
//! normal encrypt path under the `file` envelope kind.

use crate::error::{Error, Result};
use crate::protocol::{FileAck, FileChunk, MessageBody};
use crate::{CHUNK_SIZE, MAX_CONCURRENT_CHUNKS};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Send attempts per chunk before the upload parks in `Failed`.
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Transfer identifier.
pub type TransferId = [u8; 16];

/// Metadata describing one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Transfer identifier.
    pub id: TransferId,
    /// Original filename.
    pub filename: String,
    /// File size in bytes.
    pub size: u64,
    /// SHA-256 of the whole file.
    pub checksum: [u8; 32],
    /// Number of chunks.
    pub total_chunks: u32,
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Registered, nothing sent yet.
    Pending,
    /// Chunks moving.
    Active,
    /// All chunks acknowledged (outbound) or assembled (inbound).
    Completed,
    /// Retries exhausted or checksum mismatch; resumable if outbound.
    Failed,
    /// Cancelled by the host.
    Cancelled,
}

/// Progress and completion notifications.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// An upload was registered.
    Started {
        /// Transfer metadata.
        metadata: FileMetadata,
    },
    /// Bytes moved in either direction.
    Progress {
        /// Transfer identifier.
        id: TransferId,
        /// Bytes acknowledged or received so far.
        bytes: u64,
        /// Whole-file size.
        total: u64,
    },
    /// An upload finished; every chunk acknowledged.
    Completed {
        /// Transfer identifier.
        id: TransferId,
    },
    /// A transfer gave up.
    Failed {
        /// Transfer identifier.
        id: TransferId,
        /// What went wrong.
        error: String,
    },
    /// An inbound file was assembled and verified.
    Received {
        /// Transfer identifier.
        id: TransferId,
        /// Where the file was written.
        path: PathBuf,
    },
}

struct OutgoingTransfer {
    metadata: FileMetadata,
    path: PathBuf,
    state: TransferState,
    acked: HashSet<u32>,
    sink: mpsc::Sender<MessageBody>,
}

struct IncomingTransfer {
    metadata: FileMetadata,
    chunks: BTreeMap<u32, Vec<u8>>,
    state: TransferState,
}

/// Bookkeeping for all transfers of one session controller.
pub struct FileTransferManager {
    outgoing: Arc<RwLock<HashMap<TransferId, OutgoingTransfer>>>,
    incoming: Arc<RwLock<HashMap<TransferId, IncomingTransfer>>>,
    event_tx: mpsc::Sender<TransferEvent>,
    ack_timeout: Duration,
    download_dir: PathBuf,
}

impl FileTransferManager {
    /// Create a manager reporting on `event_tx` and writing inbound files
    /// under `download_dir`.
    pub fn new(
        event_tx: mpsc::Sender<TransferEvent>,
        ack_timeout: Duration,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            outgoing: Arc::new(RwLock::new(HashMap::new())),
            incoming: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            ack_timeout,
            download_dir,
        }
    }

    /// Register a file for upload and start sending chunks into `sink`.
    pub async fn upload(
        &self,
        path: PathBuf,
        sink: mpsc::Sender<MessageBody>,
    ) -> Result<FileMetadata> {
        let size = File::open(&path).await?.metadata().await?.len();
        if size == 0 {
            return Err(Error::Usage("cannot transfer an empty file".into()));
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let checksum = hash_file(&path).await?;
        let total_chunks = size.div_ceil(CHUNK_SIZE as u64) as u32;

        let metadata = FileMetadata {
            id: crate::crypto::random_bytes(),
            filename,
            size,
            checksum,
            total_chunks,
        };

        {
            let mut outgoing = self.outgoing.write().await;
            outgoing.insert(
                metadata.id,
                OutgoingTransfer {
                    metadata: metadata.clone(),
                    path: path.clone(),
                    state: TransferState::Pending,
                    acked: HashSet::new(),
                    sink: sink.clone(),
                },
            );
        }

        let _ = self
            .event_tx
            .send(TransferEvent::Started {
                metadata: metadata.clone(),
            })
            .await;

        info!(
            id = %hex::encode(&metadata.id[..4]),
            size,
            chunks = total_chunks,
            "file transfer initiated"
        );

        self.spawn_upload(metadata.id);
        Ok(metadata)
    }

    /// Cancel a transfer in either direction.
    pub async fn cancel(&self, id: &TransferId) -> Result<()> {
        if let Some(transfer) = self.outgoing.write().await.get_mut(id) {
            transfer.state = TransferState::Cancelled;
            return Ok(());
        }
        if let Some(transfer) = self.incoming.write().await.get_mut(id) {
            transfer.state = TransferState::Cancelled;
            return Ok(());
        }
        Err(Error::Usage("unknown transfer".into()))
    }

    /// Resume a failed upload; unacknowledged chunks are sent again.
    pub async fn resume(&self, id: &TransferId) -> Result<()> {
        {
            let mut outgoing = self.outgoing.write().await;
            let transfer = outgoing
                .get_mut(id)
                .ok_or_else(|| Error::Usage("unknown transfer".into()))?;
            if transfer.state != TransferState::Failed {
                return Err(Error::Usage("only failed uploads can resume".into()));
            }
            transfer.state = TransferState::Active;
        }
        self.spawn_upload(*id);
        Ok(())
    }

    /// Current state and progress of a transfer.
    pub async fn status(&self, id: &TransferId) -> Option<(TransferState, u64, u64)> {
        if let Some(t) = self.outgoing.read().await.get(id) {
            let bytes = acked_bytes(&t.metadata, t.acked.len() as u32);
            return Some((t.state, bytes, t.metadata.size));
        }
        if let Some(t) = self.incoming.read().await.get(id) {
            let bytes = t.chunks.values().map(|c| c.len() as u64).sum();
            return Some((t.state, bytes, t.metadata.size));
        }
        None
    }

    /// Process an inbound chunk; returns the receipt to send back.
    pub async fn handle_chunk(&self, chunk: FileChunk) -> Result<Option<FileAck>> {
        let digest: [u8; 32] = Sha256::digest(&chunk.data).into();
        if digest != chunk.checksum {
            // No receipt; the sender will retry this chunk.
            return Err(Error::Auth("chunk checksum mismatch".into()));
        }
        if chunk.total == 0 || chunk.index >= chunk.total {
            return Err(Error::Codec("chunk index out of range".into()));
        }

        let ack = FileAck {
            transfer_id: chunk.transfer_id,
            index: chunk.index,
        };

        let complete = {
            let mut incoming = self.incoming.write().await;
            let transfer = incoming
                .entry(chunk.transfer_id)
                .or_insert_with(|| IncomingTransfer {
                    metadata: FileMetadata {
                        id: chunk.transfer_id,
                        filename: chunk.filename.clone(),
                        size: chunk.file_size,
                        checksum: chunk.file_checksum,
                        total_chunks: chunk.total,
                    },
                    chunks: BTreeMap::new(),
                    state: TransferState::Active,
                });

            if transfer.state == TransferState::Cancelled {
                return Ok(None);
            }

            transfer.chunks.insert(chunk.index, chunk.data);
            let bytes: u64 = transfer.chunks.values().map(|c| c.len() as u64).sum();
            let _ = self
                .event_tx
                .send(TransferEvent::Progress {
                    id: chunk.transfer_id,
                    bytes,
                    total: transfer.metadata.size,
                })
                .await;

            transfer.chunks.len() as u32 == transfer.metadata.total_chunks
        };

        if complete {
            self.assemble(&chunk.transfer_id).await?;
        }

        Ok(Some(ack))
    }

    /// Process a receipt for one of our chunks.
    pub async fn handle_ack(&self, ack: FileAck) -> Result<()> {
        let done = {
            let mut outgoing = self.outgoing.write().await;
            let Some(transfer) = outgoing.get_mut(&ack.transfer_id) else {
                debug!("receipt for unknown transfer");
                return Ok(());
            };
            transfer.acked.insert(ack.index);
            let bytes = acked_bytes(&transfer.metadata, transfer.acked.len() as u32);
            let _ = self
                .event_tx
                .send(TransferEvent::Progress {
                    id: ack.transfer_id,
                    bytes,
                    total: transfer.metadata.size,
                })
                .await;
            transfer.acked.len() as u32 == transfer.metadata.total_chunks
        };

        if done {
            self.finalize(&ack.transfer_id).await;
        }
        Ok(())
    }

    /// Mark an upload complete once every chunk is acknowledged.
    async fn finalize(&self, id: &TransferId) {
        let mut outgoing = self.outgoing.write().await;
        if let Some(transfer) = outgoing.get_mut(id) {
            if transfer.state != TransferState::Completed {
                transfer.state = TransferState::Completed;
                info!(id = %hex::encode(&id[..4]), "file transfer completed");
                let _ = self.event_tx.send(TransferEvent::Completed { id: *id }).await;
            }
        }
    }

    /// Write out a fully received file after verifying the whole-file hash.
    async fn assemble(&self, id: &TransferId) -> Result<()> {
        let (filename, expected, data) = {
            let incoming = self.incoming.read().await;
            let transfer = incoming
                .get(id)
                .ok_or_else(|| Error::Usage("unknown transfer".into()))?;
            let mut data = Vec::with_capacity(transfer.metadata.size as usize);
            for chunk in transfer.chunks.values() {
                data.extend_from_slice(chunk);
            }
            (
                transfer.metadata.filename.clone(),
                transfer.metadata.checksum,
                data,
            )
        };

        let digest: [u8; 32] = Sha256::digest(&data).into();
        if digest != expected {
            let mut incoming = self.incoming.write().await;
            if let Some(transfer) = incoming.get_mut(id) {
                transfer.state = TransferState::Failed;
            }
            let _ = self
                .event_tx
                .send(TransferEvent::Failed {
                    id: *id,
                    error: "file checksum mismatch".into(),
                })
                .await;
            return Err(Error::Auth("file checksum mismatch".into()));
        }

        // Strip any path components a hostile sender smuggled in.
        let safe_name = Path::new(&filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let output = self.download_dir.join(safe_name);
        tokio::fs::write(&output, &data).await?;

        {
            let mut incoming = self.incoming.write().await;
            if let Some(transfer) = incoming.get_mut(id) {
                transfer.state = TransferState::Completed;
            }
        }
        info!(id = %hex::encode(&id[..4]), path = %output.display(), "file received");
        let _ = self
            .event_tx
            .send(TransferEvent::Received {
                id: *id,
                path: output,
            })
            .await;
        Ok(())
    }

    fn spawn_upload(&self, id: TransferId) {
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        let ack_timeout = self.ack_timeout;

        tokio::spawn(async move {
            if let Err(e) = run_upload(id, outgoing, event_tx.clone(), ack_timeout).await {
                warn!(error = %e, "upload task failed");
                let _ = event_tx
                    .send(TransferEvent::Failed {
                        id,
                        error: e.kind().to_string(),
                    })
                    .await;
            }
        });
    }
}

/// Drive one upload: rounds of send-then-wait until acknowledged, failed,
/// or cancelled.
async fn run_upload(
    id: TransferId,
    outgoing: Arc<RwLock<HashMap<TransferId, OutgoingTransfer>>>,
    event_tx: mpsc::Sender<TransferEvent>,
    ack_timeout: Duration,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_CHUNKS));

    for _attempt in 0..MAX_CHUNK_ATTEMPTS {
        let (metadata, path, sink, pending) = {
            let mut guard = outgoing.write().await;
            let Some(transfer) = guard.get_mut(&id) else {
                return Ok(());
            };
            match transfer.state {
                TransferState::Cancelled | TransferState::Completed => return Ok(()),
                _ => transfer.state = TransferState::Active,
            }
            let pending: Vec<u32> = (0..transfer.metadata.total_chunks)
                .filter(|i| !transfer.acked.contains(i))
                .collect();
            (
                transfer.metadata.clone(),
                transfer.path.clone(),
                transfer.sink.clone(),
                pending,
            )
        };

        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            id = %hex::encode(&id[..4]),
            pending = pending.len(),
            "sending chunk round"
        );

        let mut round = tokio::task::JoinSet::new();
        for index in pending {
            let permits = permits.clone();
            let sink = sink.clone();
            let path = path.clone();
            let metadata = metadata.clone();
            round.spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                match read_chunk(&path, &metadata, index).await {
                    Ok(body) => {
                        let _ = sink.send(body).await;
                    }
                    Err(e) => warn!(index, error = %e, "chunk read failed"),
                }
            });
        }
        while round.join_next().await.is_some() {}

        // Give receipts a chance to come back before resending.
        let deadline = tokio::time::Instant::now() + ack_timeout;
        loop {
            let guard = outgoing.read().await;
            let Some(transfer) = guard.get(&id) else {
                return Ok(());
            };
            match transfer.state {
                TransferState::Cancelled | TransferState::Completed => return Ok(()),
                _ => {}
            }
            if transfer.acked.len() as u32 == transfer.metadata.total_chunks {
                return Ok(());
            }
            drop(guard);
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    let mut guard = outgoing.write().await;
    if let Some(transfer) = guard.get_mut(&id) {
        if transfer.state == TransferState::Active {
            transfer.state = TransferState::Failed;
            let _ = event_tx
                .send(TransferEvent::Failed {
                    id,
                    error: "chunk receipts missing after retries".into(),
                })
                .await;
        }
    }
    Ok(())
}

/// Read one chunk from disk and wrap it as a message body.
async fn read_chunk(path: &Path, metadata: &FileMetadata, index: u32) -> Result<MessageBody> {
    let mut file = File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(u64::from(index) * CHUNK_SIZE as u64))
        .await?;

    let mut data = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);

    let checksum: [u8; 32] = Sha256::digest(&data).into();
    Ok(MessageBody::FileChunk(FileChunk {
        transfer_id: metadata.id,
        filename: metadata.filename.clone(),
        file_size: metadata.size,
        file_checksum: metadata.checksum,
        index,
        total: metadata.total_chunks,
        checksum,
        data,
    }))
}

/// SHA-256 over a whole file, streamed.
async fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

fn acked_bytes(metadata: &FileMetadata, acked: u32) -> u64 {
    (u64::from(acked) * CHUNK_SIZE as u64).min(metadata.size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(
        tmp: &tempfile::TempDir,
    ) -> (FileTransferManager, mpsc::Receiver<TransferEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let manager = FileTransferManager::new(
            event_tx,
            Duration::from_millis(200),
            tmp.path().to_path_buf(),
        );
        (manager, event_rx)
    }

    fn chunk_for(data: &[u8], id: TransferId, index: u32, total: u32) -> FileChunk {
        let file_checksum: [u8; 32] = Sha256::digest(data).into();
        let start = index as usize * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(data.len());
        let piece = &data[start..end];
        FileChunk {
            transfer_id: id,
            filename: "blob.bin".into(),
            file_size: data.len() as u64,
            file_checksum,
            index,
            total,
            checksum: Sha256::digest(piece).into(),
            data: piece.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_upload_registers_and_sends_chunks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, mut events) = manager(&tmp);

        let path = tmp.path().join("payload.bin");
        tokio::fs::write(&path, vec![7u8; 1000]).await.expect("write");

        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let metadata = manager.upload(path, sink_tx).await.expect("upload");
        assert_eq!(metadata.total_chunks, 1);
        assert_eq!(metadata.size, 1000);

        match events.recv().await.expect("event") {
            TransferEvent::Started { metadata: m } => assert_eq!(m.id, metadata.id),
            other => panic!("unexpected event: {:?}", other),
        }

        let body = sink_rx.recv().await.expect("chunk");
        let MessageBody::FileChunk(chunk) = body else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.data.len(), 1000);
        assert_eq!(chunk.file_checksum, metadata.checksum);

        // Acknowledge and watch the upload complete.
        manager
            .handle_ack(FileAck {
                transfer_id: metadata.id,
                index: 0,
            })
            .await
            .expect("ack");

        let mut completed = false;
        while let Some(event) = events.recv().await {
            if matches!(event, TransferEvent::Completed { id } if id == metadata.id) {
                completed = true;
                break;
            }
        }
        assert!(completed);
        let (state, bytes, total) = manager.status(&metadata.id).await.expect("status");
        assert_eq!(state, TransferState::Completed);
        assert_eq!(bytes, total);
    }

    #[tokio::test]
    async fn test_unacked_upload_fails_then_resumes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, mut events) = manager(&tmp);

        let path = tmp.path().join("payload.bin");
        tokio::fs::write(&path, vec![1u8; 64]).await.expect("write");

        let (sink_tx, mut sink_rx) = mpsc::channel(32);
        let metadata = manager.upload(path, sink_tx).await.expect("upload");

        // Swallow the chunk sends without ever acking.
        let drain = tokio::spawn(async move { while sink_rx.recv().await.is_some() {} });

        let mut failed = false;
        while let Some(event) = events.recv().await {
            if matches!(event, TransferEvent::Failed { id, .. } if id == metadata.id) {
                failed = true;
                break;
            }
        }
        assert!(failed);
        let (state, _, _) = manager.status(&metadata.id).await.expect("status");
        assert_eq!(state, TransferState::Failed);

        // A failed upload can resume; a completed one cannot.
        manager.resume(&metadata.id).await.expect("resume");
        manager
            .handle_ack(FileAck {
                transfer_id: metadata.id,
                index: 0,
            })
            .await
            .expect("ack");
        assert!(manager.resume(&metadata.id).await.is_err());
        drain.abort();
    }

    #[tokio::test]
    async fn test_inbound_chunks_assemble_and_verify() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, mut events) = manager(&tmp);

        let data = vec![9u8; 300];
        let id = [3u8; 16];
        let chunk = chunk_for(&data, id, 0, 1);

        let ack = manager
            .handle_chunk(chunk)
            .await
            .expect("handle")
            .expect("ack");
        assert_eq!(ack.index, 0);

        let mut received_path = None;
        while let Some(event) = events.recv().await {
            if let TransferEvent::Received { id: got, path } = event {
                assert_eq!(got, id);
                received_path = Some(path);
                break;
            }
        }
        let path = received_path.expect("received event");
        let written = tokio::fs::read(&path).await.expect("read back");
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_rejected_without_ack() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, _events) = manager(&tmp);

        let data = vec![9u8; 100];
        let mut chunk = chunk_for(&data, [4u8; 16], 0, 1);
        chunk.data[0] ^= 0xFF;

        let result = manager.handle_chunk(chunk).await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_hostile_filename_is_sanitized() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, mut events) = manager(&tmp);

        let data = vec![2u8; 10];
        let mut chunk = chunk_for(&data, [5u8; 16], 0, 1);
        chunk.filename = "../../etc/shadow".into();

        manager.handle_chunk(chunk).await.expect("handle");
        while let Some(event) = events.recv().await {
            if let TransferEvent::Received { path, .. } = event {
                assert!(path.starts_with(tmp.path()));
                assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("shadow"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_transfer_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, _events) = manager(&tmp);
        assert!(manager.cancel(&[0u8; 16]).await.is_err());
    }
}
