//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::{debug, warn};

use crate::event::{EventRecord, NewEvent};
use crate::{PersistenceError, Result};

/// Format version written into the log header.
pub const EVENT_LOG_VERSION: u16 = 1;

/// Event log file header stored as the first line in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl EventLogHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        let hash = format!(
            "{:x}",
            sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
        );
        Self {
            version: EVENT_LOG_VERSION,
            created_at,
            hash,
        }
    }

    fn check(line: &str) -> Result<()> {
        let header: EventLogHeader = serde_json::from_str(line.trim_end())
            .map_err(|err| PersistenceError::Header(err.to_string()))?;
        if header.version != EVENT_LOG_VERSION {
            return Err(PersistenceError::Header(format!(
                "version {} (expected {EVENT_LOG_VERSION})",
                header.version
            )));
        }
        Ok(())
    }
}

/// Append-only JSONL writer for the event log.
///
/// Keeps the byte position of every record so readers can seek straight to a
/// cursor instead of scanning the file.
pub struct EventLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    positions: Vec<u64>,
    length: u64,
    sync: bool,
}

impl EventLogWriter {
    /// Open an event log for appending, writing a header if the file is new.
    ///
    /// A torn final line left by a crash mid-append is truncated away.
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists() && fs::metadata(path)?.len() > 0;
        let (positions, length) = if exists {
            scan(path)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if exists && file.metadata()?.len() > length {
            warn!(path = %path.display(), valid_bytes = length, "truncating torn event log tail");
            file.set_len(length)?;
        }
        let mut writer = BufWriter::new(file);

        let mut length = length;
        if !exists {
            let line = serde_json::to_string(&EventLogHeader::new())?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            length = line.len() as u64 + 1;
        }
        debug!(path = %path.display(), records = positions.len(), "event log opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            positions,
            length,
            sync,
        })
    }

    /// Append `event` at the next offset. Returns the stored record and the
    /// number of bytes written.
    pub fn append(&mut self, event: &NewEvent) -> Result<(EventRecord, usize)> {
        let offset = self.positions.len() as u64 + 1;
        let record = event.to_record(offset)?;
        let line = serde_json::to_string(&record)?;
        let bytes = line.len() + 1; // newline delimiter
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        self.positions.push(self.length);
        self.length += bytes as u64;
        Ok((record, bytes))
    }

    /// Offset of the last record, 0 for an empty log.
    pub fn last_offset(&self) -> u64 {
        self.positions.len() as u64
    }

    /// Byte position of the record after `cursor`, if any.
    pub fn position_after(&self, cursor: u64) -> Option<u64> {
        self.positions.get(cursor as usize).copied()
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Access the current path on disk (useful for tests).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for EventLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogWriter")
            .field("path", &self.path)
            .field("records", &self.positions.len())
            .finish_non_exhaustive()
    }
}

/// Validate the header and index every complete record. Returns the record
/// positions and the length of the valid prefix.
fn scan(path: &Path) -> Result<(Vec<u64>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = String::new();
    let mut length = reader.read_line(&mut header)? as u64;
    EventLogHeader::check(&header)?;

    let mut positions = Vec::new();
    let mut line = String::new();
    let mut line_no = 1usize;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if !line.ends_with('\n') {
            break;
        }
        match serde_json::from_str::<EventRecord>(line.trim_end()) {
            Ok(record) => {
                if record.offset != positions.len() as u64 + 1 {
                    return Err(PersistenceError::Corrupt {
                        line: line_no,
                        reason: format!(
                            "offset {} out of order (expected {})",
                            record.offset,
                            positions.len() + 1
                        ),
                    });
                }
                positions.push(length);
                length += read as u64;
            }
            // an undecodable last line is a torn write; anything after it is corruption
            Err(_) if reader.fill_buf()?.is_empty() => break,
            Err(err) => {
                return Err(PersistenceError::Corrupt {
                    line: line_no,
                    reason: err.to_string(),
                })
            }
        }
    }
    Ok((positions, length))
}

/// Replay the log in order, invoking the callback for each record.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(EventRecord) -> Result<()>,
{
    let mut count = 0usize;
    for record in EventLogReader::open(path)? {
        handler(record?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over the log records.
pub struct EventLogReader {
    reader: BufReader<File>,
    line: String,
}

impl EventLogReader {
    /// Open the log for sequential reading from the first record.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        EventLogHeader::check(&header)?;
        Ok(Self {
            reader,
            line: String::new(),
        })
    }

    /// Open the log positioned at the byte offset of a known record.
    pub fn open_at(path: &Path, position: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(position))?;
        Ok(Self {
            reader: BufReader::new(file),
            line: String::new(),
        })
    }
}

impl Iterator for EventLogReader {
    type Item = Result<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                // partially written tail; the writer has not finished it yet
                Ok(_) if !self.line.ends_with('\n') => return None,
                Ok(_) if self.line.trim().is_empty() => continue,
                Ok(_) => {
                    return Some(
                        serde_json::from_str(self.line.trim_end()).map_err(PersistenceError::from),
                    )
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, LineSpeedChanged};
    use r_mes_common::LineId;
    use tempfile::tempdir;

    fn speed(sequence: u64, setpoint: f64) -> NewEvent {
        NewEvent::new(
            sequence,
            DomainEvent::LineSpeedChanged(LineSpeedChanged {
                line: LineId::from("C1"),
                setpoint,
            }),
        )
    }

    #[test]
    fn append_and_replay_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut writer = EventLogWriter::open(&path, false).unwrap();

        let (first, bytes) = writer.append(&speed(1, 1.0)).unwrap();
        assert!(bytes > 0);
        let (second, _) = writer.append(&speed(2, 1.5)).unwrap();
        assert_eq!((first.offset, second.offset), (1, 2));

        let mut setpoints = Vec::new();
        replay(&path, |record| {
            setpoints.push(record.payload["setpoint"].clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(setpoints, vec![serde_json::json!(1.0), serde_json::json!(1.5)]);
    }

    #[test]
    fn reopening_continues_offsets_and_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let mut writer = EventLogWriter::open(&path, true).unwrap();
            writer.append(&speed(1, 1.0)).unwrap();
            writer.append(&speed(2, 2.0)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"offset\":3,\"event_id\":\"li").unwrap();
        }

        let mut writer = EventLogWriter::open(&path, true).unwrap();
        assert_eq!(writer.last_offset(), 2);
        let (record, _) = writer.append(&speed(3, 3.0)).unwrap();
        assert_eq!(record.offset, 3);

        let position = writer.position_after(1).unwrap();
        let offsets: Vec<u64> = EventLogReader::open_at(&path, position)
            .unwrap()
            .map(|record| record.unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[test]
    fn corruption_in_the_middle_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let mut writer = EventLogWriter::open(&path, false).unwrap();
            writer.append(&speed(1, 1.0)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"garbage\n{}\n").unwrap();
        }
        assert!(matches!(
            EventLogWriter::open(&path, false),
            Err(PersistenceError::Corrupt { line: 3, .. })
        ));
    }
}
