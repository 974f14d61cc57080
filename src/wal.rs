use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a frame may declare. Real events are a few KiB at most;
/// a bigger length prefix can only come from a corrupt tail.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Frame: `[u32 le: payload len][bincode payload][u32 le: crc32 of payload]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact event, or `None` at end of log. A torn or corrupt tail
/// ends the log; it is what a crash mid-write leaves behind.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        tracing::warn!("WAL record claims {len} bytes; ignoring the rest of the log");
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        tracing::warn!("WAL ends in a torn record; discarding it");
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        tracing::warn!("WAL checksum mismatch; ignoring the rest of the log");
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// Append-only log of venue events.
///
/// Writes are buffered; `flush_sync` makes everything buffered so far durable.
/// Compaction writes a sibling `.wal.tmp` and renames it over the log.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn compact_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; not durable until the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `events` to the temporary compaction file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compaction file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, ReservationStatus, Table};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tablebook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn table(number: u32) -> Table {
        Table { id: Ulid::new(), number, capacity: 4 }
    }

    fn reservation(table_id: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            table_id,
            name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: "555".into(),
            start: 1_750_000_000_000,
            guests: 2,
            duration_minutes: 120,
            status: ReservationStatus::Pending,
            notes: None,
            created_at: 1_749_000_000_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let t = table(1);
        let r = reservation(t.id);
        let events = vec![
            Event::TableCreated { table: t.clone() },
            Event::ReservationCreated { reservation: r.clone() },
            Event::ReservationDeleted { id: r.id, table_id: t.id },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = Event::TableCreated { table: table(1) };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn oversized_length_prefix_stops_replay() {
        let path = tmp_path("huge_len.wal");
        let event = Event::TableCreated { table: table(1) };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 64]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::TableCreated { table: table(1) };
        let bad = Event::TableCreated { table: table(2) };
        {
            let mut f = File::create(&path).unwrap();
            write_frame(&mut f, &good).unwrap();
            let payload = bincode::serialize(&bad).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
            write_frame(&mut f, &good).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_keeps_appending() {
        let path = tmp_path("compaction.wal");
        let t = table(1);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::TableCreated { table: t.clone() }).unwrap();
        // Churn: book and delete twenty times.
        for _ in 0..20 {
            let r = reservation(t.id);
            wal.append(&Event::ReservationCreated { reservation: r.clone() }).unwrap();
            wal.append(&Event::ReservationDeleted { id: r.id, table_id: t.id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        let minimal = vec![Event::TableCreated { table: t.clone() }];
        wal.compact(&minimal).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);
        assert!(!compact_path(&path).exists());

        let kept = reservation(t.id);
        wal.append(&Event::ReservationCreated { reservation: kept.clone() }).unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(
            replayed,
            vec![
                Event::TableCreated { table: t },
                Event::ReservationCreated { reservation: kept },
            ]
        );
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(|n| Event::TableCreated { table: table(n) }).collect();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
