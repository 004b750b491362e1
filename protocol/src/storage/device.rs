//! # DeviceDb: Field Device Persistence
//!
//! Each field device keeps its own sled database. Nothing in it is shared.
//!
//! | Tree       | Key                          | Value                   |
//! |------------|------------------------------|-------------------------|
//! | `queue`    | `sequence` (8B BE)           | `bincode(QueueEntry)`   |
//! | `settled`  | `idempotency_key` (16B)      | `bincode(SettledEntry)` |
//! | `metadata` | key (UTF-8)                  | value (bytes)           |
//!
//! Big-endian sequence keys make sled's iteration order the enqueue order,
//! which is the order transactions must reach the authority in.

use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;

use super::db::{decode, encode, DbError, DbResult};
use crate::device::cursor::SyncCursor;
use crate::device::queue::{QueueEntry, SettledEntry};
use crate::transaction::types::IdempotencyKey;
use crate::wallet::{PinVerifier, WalletSnapshot};

const META_CURSOR: &[u8] = b"cursor";
const META_SNAPSHOT: &[u8] = b"snapshot";
const META_NEXT_SEQ: &[u8] = b"next_sequence";
const META_PIN: &[u8] = b"pin_verifier";

/// Persistent storage for one device's queue, settled history and cached
/// authority state.
#[derive(Debug, Clone)]
pub struct DeviceDb {
    db: Db,
    queue: Tree,
    settled: Tree,
    metadata: Tree,
}

impl DeviceDb {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            queue: db.open_tree("queue")?,
            settled: db.open_tree("settled")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- Queue --------------------------------------------------------------

    /// Next local sequence number to assign. Sequences start at 1.
    pub fn next_sequence(&self) -> DbResult<u64> {
        match self.metadata.get(META_NEXT_SEQ)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| DbError::Corrupt {
                    tree: "metadata",
                    detail: "next_sequence is not 8 bytes".into(),
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(1),
        }
    }

    /// Append an entry and advance the sequence counter in one transaction.
    pub fn append(&self, entry: &QueueEntry) -> DbResult<()> {
        let seq = entry.transaction.sequence;
        let key = seq.to_be_bytes();
        let next = (seq + 1).to_be_bytes();
        let bytes = encode(entry)?;

        (&self.queue, &self.metadata)
            .transaction(|(queue, metadata)| -> ConflictableTransactionResult<()> {
                queue.insert(&key[..], &bytes[..])?;
                metadata.insert(META_NEXT_SEQ, &next[..])?;
                Ok(())
            })
            .map_err(storage_error)?;
        self.db.flush()?;
        Ok(())
    }

    /// All queued entries in sequence order.
    pub fn entries(&self) -> DbResult<Vec<QueueEntry>> {
        let mut entries = Vec::with_capacity(self.queue.len());
        for item in self.queue.iter() {
            let (_key, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    /// Overwrite the stored state of existing entries (status changes).
    pub fn update_entries(&self, entries: &[QueueEntry]) -> DbResult<()> {
        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(entry.transaction.sequence.to_be_bytes().to_vec(), encode(entry)?);
        }
        self.queue.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // -- Reconciliation -----------------------------------------------------

    /// Move acknowledged entries from the queue into settled history and
    /// store the new cursor and snapshot, all in one transaction.
    pub fn reconcile(
        &self,
        settled: &[SettledEntry],
        cursor: &SyncCursor,
        snapshot: Option<&WalletSnapshot>,
    ) -> DbResult<()> {
        let mut rows = Vec::with_capacity(settled.len());
        for s in settled {
            rows.push((
                s.transaction.sequence.to_be_bytes(),
                s.transaction.key.as_bytes().to_vec(),
                encode(s)?,
            ));
        }
        let cursor_bytes = encode(cursor)?;
        let snapshot_bytes = snapshot.map(encode).transpose()?;

        (&self.queue, &self.settled, &self.metadata)
            .transaction(|(queue, settled, metadata)| -> ConflictableTransactionResult<()> {
                for (seq, key, bytes) in &rows {
                    queue.remove(&seq[..])?;
                    settled.insert(&key[..], &bytes[..])?;
                }
                metadata.insert(META_CURSOR, &cursor_bytes[..])?;
                if let Some(bytes) = &snapshot_bytes {
                    metadata.insert(META_SNAPSHOT, &bytes[..])?;
                }
                Ok(())
            })
            .map_err(storage_error)?;
        self.db.flush()?;
        Ok(())
    }

    // -- Settled history ----------------------------------------------------

    pub fn settled(&self, key: &IdempotencyKey) -> DbResult<Option<SettledEntry>> {
        self.settled
            .get(key.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Every settled entry, oldest sequence first.
    pub fn settled_all(&self) -> DbResult<Vec<SettledEntry>> {
        let mut all: Vec<SettledEntry> = Vec::with_capacity(self.settled.len());
        for item in self.settled.iter() {
            let (_key, value) = item?;
            all.push(decode(&value)?);
        }
        all.sort_by_key(|s| s.transaction.sequence);
        Ok(all)
    }

    // -- Metadata -----------------------------------------------------------

    pub fn cursor(&self) -> DbResult<Option<SyncCursor>> {
        self.get_meta(META_CURSOR)
    }

    pub fn snapshot(&self) -> DbResult<Option<WalletSnapshot>> {
        self.get_meta(META_SNAPSHOT)
    }

    pub fn put_snapshot(&self, snapshot: &WalletSnapshot) -> DbResult<()> {
        self.metadata.insert(META_SNAPSHOT, encode(snapshot)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn pin_verifier(&self) -> DbResult<Option<PinVerifier>> {
        self.get_meta(META_PIN)
    }

    pub fn put_pin_verifier(&self, verifier: &PinVerifier) -> DbResult<()> {
        self.metadata.insert(META_PIN, encode(verifier)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> DbResult<Option<T>> {
        self.metadata
            .get(key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

fn storage_error(err: TransactionError<()>) -> DbError {
    match err {
        TransactionError::Storage(e) => DbError::Sled(e),
        // No closure above aborts.
        TransactionError::Abort(()) => DbError::Serialization("transaction aborted".into()),
    }
}
