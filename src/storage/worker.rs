//! The disk I/O actor: a background task owning a [`Storage`] and serving
//! read/write/verify requests off bounded channels, so the session loop
//! never blocks on file I/O. Modelled on the disk-actor/command-channel
//! split used by mainstream torrent engines, adapted to `tokio::sync::mpsc`
//! and `spawn_blocking` for the actual syscalls.
//!
//! Writes and reads run on *separate* queues: reads also serve upload
//! requests from other peers, so a backlog of inbound `Request`s must not
//! be able to stall the write path that advances our own download (and vice
//! versa, a burst of incoming blocks mustn't starve seeding).
use super::{Storage, StorageError, StorageResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

pub enum WriteCommand {
    WriteBlock {
        piece_index: u32,
        block_offset: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    Shutdown,
}

pub enum ReadCommand {
    ReadBlock {
        piece_index: u32,
        block_offset: u32,
        length: u32,
        reply: oneshot::Sender<StorageResult<Vec<u8>>>,
    },
    VerifyPiece {
        piece_index: u32,
        reply: oneshot::Sender<StorageResult<bool>>,
    },
    Shutdown,
}

/// A cheaply-cloneable handle to a running storage worker.
#[derive(Clone)]
pub struct StorageHandle {
    writes: mpsc::Sender<WriteCommand>,
    reads: mpsc::Sender<ReadCommand>,
}

fn worker_gone<T>(_: T) -> StorageError {
    StorageError::WorkerGone
}

impl StorageHandle {
    /// Spawns the write and read workers and returns a handle to both.
    /// `write_queue_capacity`/`read_queue_capacity` bound how many
    /// outstanding commands of each kind may be queued before `send` starts
    /// applying backpressure, independently of one another.
    pub fn spawn(storage: Storage, write_queue_capacity: usize, read_queue_capacity: usize) -> Self {
        let (write_tx, write_rx) = mpsc::channel(write_queue_capacity);
        let (read_tx, read_rx) = mpsc::channel(read_queue_capacity);
        let storage = Arc::new(storage);
        tokio::spawn(run_writes(Arc::clone(&storage), write_rx));
        tokio::spawn(run_reads(storage, read_rx));
        Self { writes: write_tx, reads: read_tx }
    }

    pub async fn write_block(&self, piece_index: u32, block_offset: u32, data: Vec<u8>) -> StorageResult<()> {
        let (reply, recv) = oneshot::channel();
        self.writes
            .send(WriteCommand::WriteBlock { piece_index, block_offset, data, reply })
            .await
            .map_err(worker_gone)?;
        recv.await.map_err(worker_gone)?
    }

    pub async fn read_block(&self, piece_index: u32, block_offset: u32, length: u32) -> StorageResult<Vec<u8>> {
        let (reply, recv) = oneshot::channel();
        self.reads
            .send(ReadCommand::ReadBlock { piece_index, block_offset, length, reply })
            .await
            .map_err(worker_gone)?;
        recv.await.map_err(worker_gone)?
    }

    pub async fn verify_piece(&self, piece_index: u32) -> StorageResult<bool> {
        let (reply, recv) = oneshot::channel();
        self.reads.send(ReadCommand::VerifyPiece { piece_index, reply }).await.map_err(worker_gone)?;
        recv.await.map_err(worker_gone)?
    }

    pub async fn shutdown(&self) {
        let _ = self.writes.send(WriteCommand::Shutdown).await;
        let _ = self.reads.send(ReadCommand::Shutdown).await;
    }
}

#[instrument(skip_all)]
async fn run_writes(storage: Arc<Storage>, mut commands: mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriteCommand::WriteBlock { piece_index, block_offset, data, reply } => {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let result =
                        tokio::task::spawn_blocking(move || storage.write_block(piece_index, block_offset, &data))
                            .await
                            .expect("storage worker thread panicked");
                    if reply.send(result).is_err() {
                        warn!(piece_index, block_offset, "write_block reply dropped");
                    }
                });
            }
            WriteCommand::Shutdown => break,
        }
    }
}

#[instrument(skip_all)]
async fn run_reads(storage: Arc<Storage>, mut commands: mpsc::Receiver<ReadCommand>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            ReadCommand::ReadBlock { piece_index, block_offset, length, reply } => {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let result =
                        tokio::task::spawn_blocking(move || storage.read_block(piece_index, block_offset, length))
                            .await
                            .expect("storage worker thread panicked");
                    if reply.send(result).is_err() {
                        warn!(piece_index, block_offset, "read_block reply dropped");
                    }
                });
            }
            ReadCommand::VerifyPiece { piece_index, reply } => {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || storage.verify_piece(piece_index))
                        .await
                        .expect("storage worker thread panicked");
                    if reply.send(result).is_err() {
                        warn!(piece_index, "verify_piece reply dropped");
                    }
                });
            }
            ReadCommand::Shutdown => break,
        }
    }
}
