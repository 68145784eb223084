use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::error::{Error, Result};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Size of the fixed record header: checksum, timestamp, key and value lengths.
pub(crate) const RECORD_HEADER_SIZE: u64 = 16;

/// Size of the fixed hint entry header: timestamp, lengths and value offset.
pub(crate) const HINT_HEADER_SIZE: u64 = 20;

/// Reserved value marking a deletion. Rejected as a user value on `put`.
pub(crate) const TOMBSTONE: &[u8] = b"bitcask_tombstone";

const DATA_FILE_SUFFIX: &str = ".bitcask.data";

const HINT_FILE_SUFFIX: &str = ".bitcask.hint";

const MERGING_HINT_FILE_SUFFIX: &str = ".bitcask.hint.merging";

pub(crate) fn data_file_name(file_id: u64) -> String {
    format!("{}{}", file_id, DATA_FILE_SUFFIX)
}

pub(crate) fn data_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(data_file_name(file_id))
}

pub(crate) fn hint_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{}{}", file_id, HINT_FILE_SUFFIX))
}

pub(crate) fn merging_hint_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{}{}", file_id, MERGING_HINT_FILE_SUFFIX))
}

/// Parse the file ID out of a data file name, e.g. `17.bitcask.data` -> 17.
pub(crate) fn parse_data_file_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(DATA_FILE_SUFFIX)
        .and_then(|stem| stem.parse().ok())
}

pub(crate) fn parse_hint_file_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(HINT_FILE_SUFFIX)
        .and_then(|stem| stem.parse().ok())
}

pub(crate) fn is_merging_hint(file_name: &str) -> bool {
    file_name
        .strip_suffix(MERGING_HINT_FILE_SUFFIX)
        .is_some_and(|stem| stem.parse::<u64>().is_ok())
}

/// Current wall-clock time as a whole-second timestamp.
pub(crate) fn timestamp_now() -> Result<u32> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32)
}

/// On-disk size of a record holding `key` and `value`.
pub(crate) fn record_size(key: &[u8], value: &[u8]) -> u64 {
    RECORD_HEADER_SIZE + key.len() as u64 + value.len() as u64
}

/// One record read back from a data file.
// Fixed-width header            Variable-length body
//+=====+=====+=====+====== - - +============== - - +
//| u32 | u32 | u32 | u32       | [u8] | [u8] |
//+=====+=====+=====+====== - - +============== - - +
// checksum (4 bytes, covers everything after itself)
// timestamp (4 bytes)
// key_len (4 bytes)
// val_len (4 bytes)
// key (key_len bytes)
// value (val_len bytes)
#[derive(Debug)]
pub(crate) struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tstamp: u32,
    pub value_offset: u64,
    pub total_size: u64,
}

/// The data file currently open for appending, by the writer or the merger.
///
/// The underlying handle is opened readable as well, so a rotated-away file
/// can move straight into the read set without reopening (and without
/// flushing the OS page cache for it).
pub(crate) struct ActiveFile {
    file_id: u64,
    writer: BufWriter<File>,
    pos: u64,
}

impl ActiveFile {
    /// Create a fresh, empty data file in `dir`.
    ///
    /// The file ID starts at the current wall-clock second, raised to
    /// `floor` if the clock lags files the caller already knows about, and
    /// is busy-bumped past any name that already exists. IDs handed out for
    /// one directory are therefore strictly increasing.
    pub fn create(dir: &Path, floor: u64) -> Result<ActiveFile> {
        let mut file_id = (timestamp_now()? as u64).max(floor);
        loop {
            match std::fs::OpenOptions::new()
                .read(true)
                .append(true)
                .create_new(true)
                .open(data_path(dir, file_id))
            {
                Ok(file) => {
                    return Ok(ActiveFile {
                        file_id,
                        writer: BufWriter::new(file),
                        pos: 0,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => file_id += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn file_name(&self) -> String {
        data_file_name(self.file_id)
    }

    /// Bytes appended so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Append one record and return the absolute offset of its value bytes
    /// together with the total record size.
    pub fn append(&mut self, key: &[u8], value: &[u8], tstamp: u32) -> Result<(u64, u64)> {
        let mut body = Vec::<u8>::with_capacity(12 + key.len() + value.len());
        body.write_u32::<BigEndian>(tstamp)?;
        body.write_u32::<BigEndian>(key.len() as u32)?;
        body.write_u32::<BigEndian>(value.len() as u32)?;
        body.write_all(key)?;
        body.write_all(value)?;

        self.writer.write_u32::<BigEndian>(CRC32.checksum(&body))?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;

        let value_offset = self.pos + RECORD_HEADER_SIZE + key.len() as u64;
        self.pos += record_size(key, value);
        Ok((value_offset, record_size(key, value)))
    }

    /// Whether appending this record would push the file past `max_file_size`.
    ///
    /// An empty file never wraps on its first record, so an oversize value
    /// can always be written somewhere.
    pub fn would_wrap(&self, key: &[u8], value: &[u8], max_file_size: u64) -> bool {
        self.pos > 0 && self.pos + record_size(key, value) > max_file_size
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Give up the append role and hand the still-open handle to the read set.
    pub fn into_read_file(mut self) -> Result<(u64, File)> {
        self.writer.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| Error::Unexpected(format!("flushing retired data file: {}", e)))?;
        Ok((self.file_id, file))
    }
}

/// Read the next record of a sequential scan starting at `pos`.
///
/// Returns `None` at end of file, and also when the trailing record is
/// truncated: a partial tail is the footprint of a writer killed
/// mid-append, and the file is valid up to that boundary. A complete record
/// whose checksum does not match is damage, not a crash, and fails the scan.
pub(crate) fn read_next_record<R: Read>(
    reader: &mut R,
    pos: u64,
    file_len: u64,
) -> Result<Option<Record>> {
    if pos >= file_len {
        return Ok(None);
    }
    if pos + RECORD_HEADER_SIZE > file_len {
        warn!(pos, file_len, "truncated record header at end of file");
        return Ok(None);
    }

    let stored_checksum = reader.read_u32::<BigEndian>()?;
    let tstamp = reader.read_u32::<BigEndian>()?;
    let key_len = reader.read_u32::<BigEndian>()?;
    let value_len = reader.read_u32::<BigEndian>()?;

    let total_size = RECORD_HEADER_SIZE + key_len as u64 + value_len as u64;
    if pos + total_size > file_len {
        warn!(pos, file_len, "truncated record body at end of file");
        return Ok(None);
    }

    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;
    let mut value = vec![0; value_len as usize];
    reader.read_exact(&mut value)?;

    let mut body = Vec::<u8>::with_capacity(12 + key.len() + value.len());
    body.write_u32::<BigEndian>(tstamp)?;
    body.write_u32::<BigEndian>(key_len)?;
    body.write_u32::<BigEndian>(value_len)?;
    body.write_all(&key)?;
    body.write_all(&value)?;

    let checksum = CRC32.checksum(&body);
    if checksum != stored_checksum {
        return Err(Error::Corruption(stored_checksum, checksum));
    }

    Ok(Some(Record {
        key,
        value,
        tstamp,
        value_offset: pos + RECORD_HEADER_SIZE + key_len as u64,
        total_size,
    }))
}

/// Read and validate the record of `total_size` bytes starting at
/// `record_offset`. This is the random-access read behind `get`, so a short
/// read here is an error rather than an end-of-scan.
pub(crate) fn read_record_at<R: Read + Seek>(
    reader: &mut R,
    record_offset: u64,
    total_size: u64,
) -> Result<Record> {
    if total_size < RECORD_HEADER_SIZE {
        return Err(Error::Unexpected(format!(
            "indexed record size {} is smaller than a record header",
            total_size
        )));
    }
    reader.seek(SeekFrom::Start(record_offset))?;

    let mut buf = vec![0; total_size as usize];
    if let Err(e) = reader.read_exact(&mut buf) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::TruncatedRecord);
        }
        return Err(e.into());
    }

    let mut header = &buf[..];
    let stored_checksum = header.read_u32::<BigEndian>()?;
    let checksum = CRC32.checksum(&buf[4..]);
    if checksum != stored_checksum {
        return Err(Error::Corruption(stored_checksum, checksum));
    }

    let tstamp = header.read_u32::<BigEndian>()?;
    let key_len = header.read_u32::<BigEndian>()? as u64;
    let value_len = header.read_u32::<BigEndian>()? as u64;
    if RECORD_HEADER_SIZE + key_len + value_len != total_size {
        return Err(Error::Unexpected(format!(
            "record lengths {}+{} disagree with indexed size {}",
            key_len, value_len, total_size
        )));
    }

    let key_end = (RECORD_HEADER_SIZE + key_len) as usize;
    Ok(Record {
        key: buf[RECORD_HEADER_SIZE as usize..key_end].to_vec(),
        value: buf[key_end..].to_vec(),
        tstamp,
        value_offset: record_offset + RECORD_HEADER_SIZE + key_len,
        total_size,
    })
}

/// One hint file entry: where a live record sits in its data file.
// Fixed-width header            Variable-length body
//+=====+=====+=====+====== - - +======== - - +
//| u32 | u32 | u32 | u64       | [u8] |
//+=====+=====+=====+====== - - +======== - - +
// timestamp (4 bytes)
// key_len (4 bytes)
// val_len (4 bytes)
// val_offset (8 bytes)
// key (key_len bytes)
#[derive(Debug)]
pub(crate) struct Hint {
    pub key: Vec<u8>,
    pub tstamp: u32,
    pub value_len: u64,
    pub value_offset: u64,
}

pub(crate) fn write_hint<W: Write>(
    writer: &mut W,
    key: &[u8],
    tstamp: u32,
    value_len: u32,
    value_offset: u64,
) -> Result<()> {
    writer.write_u32::<BigEndian>(tstamp)?;
    writer.write_u32::<BigEndian>(key.len() as u32)?;
    writer.write_u32::<BigEndian>(value_len)?;
    writer.write_u64::<BigEndian>(value_offset)?;
    writer.write_all(key)?;
    Ok(())
}

/// Read the next hint entry of a sequential scan starting at `pos`.
///
/// Hints are a best-effort accelerator, so a truncated tail just ends the
/// scan the same way it does for a data file.
pub(crate) fn read_next_hint<R: Read>(
    reader: &mut R,
    pos: u64,
    file_len: u64,
) -> Result<Option<Hint>> {
    if pos >= file_len {
        return Ok(None);
    }
    if pos + HINT_HEADER_SIZE > file_len {
        warn!(pos, file_len, "truncated hint header at end of file");
        return Ok(None);
    }

    let tstamp = reader.read_u32::<BigEndian>()?;
    let key_len = reader.read_u32::<BigEndian>()?;
    let value_len = reader.read_u32::<BigEndian>()?;
    let value_offset = reader.read_u64::<BigEndian>()?;

    if pos + HINT_HEADER_SIZE + key_len as u64 > file_len {
        warn!(pos, file_len, "truncated hint key at end of file");
        return Ok(None);
    }
    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;

    Ok(Some(Hint {
        key,
        tstamp,
        value_len: value_len as u64,
        value_offset,
    }))
}
