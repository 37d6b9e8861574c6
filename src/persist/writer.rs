//! Append-only persistence writer for delivered payloads.
//!
//! Records are submitted in delivery order through an unbounded channel and
//! written by a single logger task; each record is durable (synced) before
//! the written-callback runs. A failure of the backing file is fatal to the
//! process, never silently swallowed.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::multicast::{NodeId, SubgroupId};
use crate::utils::ShardcastError;

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One delivered payload queued for durable append.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct PersistRecord {
    pub subgroup: SubgroupId,
    pub vid: i32,
    pub sender: NodeId,
    pub index: i64,
    pub cooked: bool,
    pub payload: Vec<u8>,
}

/// Callback run after each record becomes durable.
pub(crate) type WrittenCallback = Box<dyn Fn(&PersistRecord) + Send>;

/// Single-task append-only persistence writer.
pub(crate) struct PersistWriter {
    tx_record: mpsc::UnboundedSender<PersistRecord>,

    /// Swappable written-upcall; the logger task holds this lock while
    /// invoking the callback, so holders of the guard serialize against
    /// in-flight acknowledgements.
    written_cb: Arc<Mutex<Option<WrittenCallback>>>,

    _writer_handle: JoinHandle<()>,
}

impl PersistWriter {
    /// Creates the writer and spawns its logger task on the given backing
    /// file (created if absent, appended to otherwise).
    pub(crate) async fn new_and_setup(
        path: &Path,
    ) -> Result<Self, ShardcastError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created persistence file '{}'", path.display());
        } else {
            pf_info!(
                "persistence file '{}' already exists",
                path.display()
            );
        }
        let mut backer_file =
            OpenOptions::new().read(true).write(true).open(path).await?;
        backer_file.seek(SeekFrom::End(0)).await?; // seek to EOF

        let (tx_record, rx_record) = mpsc::unbounded_channel();
        let written_cb: Arc<Mutex<Option<WrittenCallback>>> =
            Arc::new(Mutex::new(None));

        let cb_ref = written_cb.clone();
        let writer_handle = tokio::spawn(async move {
            Self::writer_task(backer_file, rx_record, cb_ref).await;
        });

        Ok(PersistWriter {
            tx_record,
            written_cb,
            _writer_handle: writer_handle,
        })
    }

    /// Installs (or replaces) the written-upcall.
    pub(crate) fn set_written_callback(&self, cb: WrittenCallback) {
        *self.written_cb.lock().unwrap() = Some(cb);
    }

    /// Takes the callback lock, blocking in-flight acknowledgements while
    /// held. Used when moving queued state between groups; the new callback
    /// is installed through the returned guard.
    pub(crate) fn lock_callback(
        &self,
    ) -> MutexGuard<'_, Option<WrittenCallback>> {
        self.written_cb.lock().unwrap()
    }

    /// Queues a record for durable append.
    pub(crate) fn submit(
        &self,
        record: PersistRecord,
    ) -> Result<(), ShardcastError> {
        self.tx_record.send(record).map_err(ShardcastError::msg)
    }

    /// Appends one length-headed record and syncs it down.
    async fn append_record(
        backer: &mut File,
        record: &PersistRecord,
    ) -> Result<(), ShardcastError> {
        let record_bytes = rmp_serde::encode::to_vec(record)?;
        backer.write_u64(record_bytes.len() as u64).await?;
        backer.write_all(&record_bytes[..]).await?;
        backer.sync_data().await?;
        Ok(())
    }

    /// Logger task: appends records in submission order; each record is
    /// durable before its acknowledgement callback runs.
    async fn writer_task(
        mut backer_file: File,
        mut rx_record: mpsc::UnboundedReceiver<PersistRecord>,
        written_cb: Arc<Mutex<Option<WrittenCallback>>>,
    ) {
        pf_debug!("persistence writer task spawned");

        while let Some(record) = rx_record.recv().await {
            if let Err(e) =
                Self::append_record(&mut backer_file, &record).await
            {
                // losing a record that delivery already reported durable-in-
                // progress cannot be recovered from
                pf_error!("fatal persistence writer error: {}", e);
                std::process::abort();
            }

            let guard = written_cb.lock().unwrap();
            if let Some(cb) = guard.as_ref() {
                cb(&record);
            }
        }

        pf_debug!("persistence writer task exited");
    }

    /// Reads every record back from a persistence file, in append order.
    pub(crate) async fn read_all(
        path: &Path,
    ) -> Result<Vec<PersistRecord>, ShardcastError> {
        let mut file = OpenOptions::new().read(true).open(path).await?;
        let file_size = file.metadata().await?.len() as usize;
        let mut records = Vec::new();
        let mut offset = 0;

        while offset + 8 <= file_size {
            file.seek(SeekFrom::Start(offset as u64)).await?;
            let record_len = file.read_u64().await? as usize;
            if offset + 8 + record_len > file_size {
                pf_warn!(
                    "truncated record at offset {} of '{}'",
                    offset,
                    path.display()
                );
                break;
            }
            let mut record_buf: Vec<u8> = vec![0; record_len];
            file.read_exact(&mut record_buf[..]).await?;
            records.push(rmp_serde::decode::from_slice(&record_buf)?);
            offset += 8 + record_len;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod writer_tests {
    use super::*;

    fn test_record(index: i64) -> PersistRecord {
        PersistRecord {
            subgroup: 0,
            vid: 0,
            sender: 2,
            index,
            cooked: false,
            payload: format!("record-{}", index).into_bytes(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acks_in_submission_order() -> Result<(), ShardcastError> {
        let path = Path::new("/tmp/test-shardcast-persist-0.log");
        let _ = std::fs::remove_file(path);
        let writer = PersistWriter::new_and_setup(path).await?;

        let (tx_ack, mut rx_ack) = mpsc::unbounded_channel();
        writer.set_written_callback(Box::new(move |record| {
            tx_ack.send(record.index).unwrap();
        }));

        for index in 0..5 {
            writer.submit(test_record(index))?;
        }
        for expected in 0..5 {
            assert_eq!(rx_ack.recv().await, Some(expected));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn records_read_back() -> Result<(), ShardcastError> {
        let path = Path::new("/tmp/test-shardcast-persist-1.log");
        let _ = std::fs::remove_file(path);
        let writer = PersistWriter::new_and_setup(path).await?;

        let (tx_ack, mut rx_ack) = mpsc::unbounded_channel();
        writer.set_written_callback(Box::new(move |record| {
            tx_ack.send(record.clone()).unwrap();
        }));

        writer.submit(test_record(0))?;
        writer.submit(test_record(1))?;
        rx_ack.recv().await.unwrap();
        rx_ack.recv().await.unwrap();

        let records = PersistWriter::read_all(path).await?;
        assert_eq!(records, vec![test_record(0), test_record(1)]);
        Ok(())
    }
}
