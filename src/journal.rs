//! Durable ledger backed by an append-only journal.
//!
//! Each committed batch is one line of JSON:
//!
//! ```text
//! {"seq":1,"writes":[{"key":"header","cell":{"header":{...}}},{"key":{"node":1},"cell":{...}}]}
//! ```
//!
//! A line is committed once its trailing newline is on disk. On open, a final
//! line without one (or that does not parse) is a torn write and is cut off.
//! [`JournalLedger::compact`] replaces the history with a single snapshot
//! record.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ledger::{Batch, Cell, CellKey, CellWrite, Ledger, Seq};

#[derive(Serialize)]
struct RecordRef<'a> {
    seq: Seq,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    snapshot: bool,
    writes: &'a [CellWrite],
}

#[derive(Deserialize)]
struct Record {
    seq: Seq,
    #[serde(default)]
    snapshot: bool,
    writes: Vec<CellWrite>,
}

pub struct JournalLedger {
    path: PathBuf,
    file: File,
    /// Length of the journal up to the end of the last committed record.
    len: u64,
    cells: BTreeMap<CellKey, Cell>,
    seq: Seq,
    sync: bool,
}

impl JournalLedger {
    /// Open the journal at `path`, creating it if needed, and replay it.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut cells = BTreeMap::new();
        let mut seq: Seq = 0;
        let mut len = 0usize;
        let mut line_no = 0usize;
        let mut rest = contents.as_slice();
        while !rest.is_empty() {
            line_no += 1;
            let (line, complete) = match rest.iter().position(|&b| b == b'\n') {
                Some(end) => (&rest[..end], true),
                None => (rest, false),
            };
            let consumed = line.len() + usize::from(complete);
            let is_last = consumed == rest.len();

            match serde_json::from_slice::<Record>(line) {
                Ok(record) if complete => {
                    if record.snapshot {
                        if record.seq < seq {
                            return Err(Error::Journal {
                                line: line_no,
                                reason: format!(
                                    "snapshot at seq {} follows seq {}",
                                    record.seq, seq
                                ),
                            });
                        }
                        cells.clear();
                    } else if record.seq != seq + 1 {
                        return Err(Error::Journal {
                            line: line_no,
                            reason: format!("expected seq {}, found {}", seq + 1, record.seq),
                        });
                    }
                    Batch::from(record.writes).apply_to(&mut cells);
                    seq = record.seq;
                    len += consumed;
                }
                Err(err) if !is_last => {
                    return Err(Error::Journal {
                        line: line_no,
                        reason: err.to_string(),
                    });
                }
                _ => {
                    warn!(
                        path = %path.display(),
                        line = line_no,
                        bytes = consumed,
                        "discarding torn journal record"
                    );
                    file.set_len(len as u64)?;
                    break;
                }
            }
            rest = &rest[consumed..];
        }

        info!(path = %path.display(), seq, cells = cells.len(), "opened journal");
        Ok(Self {
            path,
            file,
            len: len as u64,
            cells,
            seq,
            sync: config.sync_on_commit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal as one snapshot record holding the current cells.
    ///
    /// The snapshot is written beside the journal and renamed over it, so a
    /// crash leaves either the old history or the new snapshot.
    pub fn compact(&mut self) -> Result<()> {
        let writes: Vec<CellWrite> = self
            .cells
            .iter()
            .map(|(key, cell)| CellWrite {
                key: *key,
                cell: Some(*cell),
            })
            .collect();
        let mut line = serde_json::to_vec(&RecordRef {
            seq: self.seq,
            snapshot: true,
            writes: &writes,
        })?;
        line.push(b'\n');

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&line)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let before = self.len;
        self.len = line.len() as u64;
        debug!(
            path = %self.path.display(),
            seq = self.seq,
            before,
            after = self.len,
            "compacted journal"
        );
        Ok(())
    }

    fn append(&mut self, line: &[u8]) -> Result<()> {
        self.file.write_all(line)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl Ledger for JournalLedger {
    fn load(&self, key: &CellKey) -> Result<Option<Cell>> {
        Ok(self.cells.get(key).copied())
    }

    fn commit(&mut self, batch: Batch) -> Result<Seq> {
        if batch.is_empty() {
            return Ok(self.seq);
        }
        let seq = self.seq + 1;
        let mut line = serde_json::to_vec(&RecordRef {
            seq,
            snapshot: false,
            writes: batch.writes(),
        })?;
        line.push(b'\n');

        if let Err(err) = self.append(&line) {
            // Cut off whatever part of the record made it out.
            if let Err(truncate_err) = self.file.set_len(self.len) {
                warn!(error = %truncate_err, "failed to roll back partial journal record");
            }
            return Err(err);
        }

        self.len += line.len() as u64;
        batch.apply_to(&mut self.cells);
        self.seq = seq;
        Ok(seq)
    }

    fn seq(&self) -> Seq {
        self.seq
    }

    fn node_cells(&self) -> usize {
        self.cells.len() - usize::from(self.cells.contains_key(&CellKey::Header))
    }
}
