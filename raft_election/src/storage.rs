use crate::common::{PersistentStorage, PersistentStorageError, ServerId, TermIndex};

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::Path;

use bincode::Options;
use fault_injection::maybe;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ElectionRecord {
    current_term: TermIndex,
    voted_for: Option<(TermIndex, ServerId)>,
}

/// Fixed size of the on-disk election record slot. Comfortably above the
/// largest varint encoding of [`ElectionRecord`].
const ELECTION_RECORD_MAX_BYTES: u64 = 64;

type ElectionBincodeOptions = bincode::config::WithOtherEndian<
    bincode::config::WithOtherIntEncoding<
        bincode::config::WithOtherTrailing<
            bincode::config::WithOtherLimit<
                bincode::config::DefaultOptions,
                bincode::config::Bounded,
            >,
            bincode::config::RejectTrailing,
        >,
        bincode::config::VarintEncoding,
    >,
    bincode::config::LittleEndian,
>;

#[inline]
fn election_bincode() -> ElectionBincodeOptions {
    bincode::DefaultOptions::new()
        .with_limit(ELECTION_RECORD_MAX_BYTES)
        .reject_trailing_bytes()
        .with_varint_encoding()
        .with_little_endian()
}

/// Durable `(term, vote)` record backed by a single small file that is
/// rewritten in place on every `sync`. Should only be used from one thread.
#[derive(Debug)]
pub struct FilePersistentStorage {
    record: ElectionRecord,
    writer: BufWriter<File>,
}

impl FilePersistentStorage {
    /// Opens (or creates) the election record under `dir`. A missing or
    /// never-written record reads as a fresh peer: term 0, no vote.
    pub fn open(dir: &Path) -> Result<Self, PersistentStorageError> {
        maybe!(fs::create_dir_all(dir)).map_err(|_| PersistentStorageError::Io)?;

        let record_path = dir.join("election");
        let record_exists = record_path.exists();

        let file = maybe!(File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&record_path))
        .map_err(|_| PersistentStorageError::Io)?;
        maybe!(file.set_len(ELECTION_RECORD_MAX_BYTES)).map_err(|_| PersistentStorageError::Io)?;
        let reader_file = maybe!(file.try_clone()).map_err(|_| PersistentStorageError::Io)?;

        if record_exists {
            let record = election_bincode()
                .deserialize_from(BufReader::new(reader_file))
                .map_err(|_| PersistentStorageError::Encoding)?;
            Ok(FilePersistentStorage {
                record,
                writer: BufWriter::new(file),
            })
        } else {
            let mut storage = FilePersistentStorage {
                record: ElectionRecord::default(),
                writer: BufWriter::new(file),
            };
            storage.sync()?;
            Ok(storage)
        }
    }
}

impl PersistentStorage for FilePersistentStorage {
    fn current_term(&self) -> TermIndex {
        self.record.current_term
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.record
            .voted_for
            .and_then(|(vote_term, server_id)| {
                if vote_term == self.record.current_term {
                    Some(server_id)
                } else {
                    None
                }
            })
    }

    fn update_term(&mut self, term: TermIndex) -> &mut Self {
        self.record.current_term = term;
        self
    }

    fn record_vote(&mut self, voted_for: ServerId) -> &mut Self {
        self.record.voted_for = Some((self.record.current_term, voted_for));
        self
    }

    fn sync(&mut self) -> Result<(), PersistentStorageError> {
        maybe!(self.writer.rewind()).map_err(|_| PersistentStorageError::Io)?;
        election_bincode()
            .serialize_into(&mut self.writer, &self.record)
            .map_err(|_| PersistentStorageError::Encoding)?;
        maybe!(self.writer.flush()).map_err(|_| PersistentStorageError::Io)?;
        Ok(())
    }
}

/// Election record held in memory only. Useful for tests and for peers whose
/// environment makes durability someone else's problem.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    record: ElectionRecord,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }
}

impl PersistentStorage for InMemoryStorage {
    fn current_term(&self) -> TermIndex {
        self.record.current_term
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.record
            .voted_for
            .and_then(|(vote_term, server_id)| {
                if vote_term == self.record.current_term {
                    Some(server_id)
                } else {
                    None
                }
            })
    }

    fn update_term(&mut self, term: TermIndex) -> &mut Self {
        self.record.current_term = term;
        self
    }

    fn record_vote(&mut self, voted_for: ServerId) -> &mut Self {
        self.record.voted_for = Some((self.record.current_term, voted_for));
        self
    }

    fn sync(&mut self) -> Result<(), PersistentStorageError> {
        Ok(())
    }
}
