//! Wire protocol
//!
//! Simple binary framing: [1 byte: command] [4 bytes: length] [payload].
//! Blobs are addressed by byte-stream resource names:
//!
//! - reads:  `[instance/]blobs/{hash}/{size}`
//! - writes: `[instance/]uploads/{uuid}/blobs/{hash}/{size}`

use crate::blobstore::{StorageError, StorageResult};
use crate::digest::Digest;
use std::io::{self, Read, Write};

/// Upper bound on a single frame, to keep a malicious length prefix from
/// ballooning memory.
const MAXIMUM_FRAME_SIZE: usize = 4 * 1024 * 1024 + 16;

/// Chunk size used when streaming blob data to a client.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fetch a CAS blob; payload is a read resource name
    Read = 0x01,
    /// Open an upload; payload is a write resource name
    Write = 0x02,
    /// One chunk of an upload: [8B offset][1B finish_write][data]
    WriteChunk = 0x03,
    /// Probe for absent blobs; payload is newline-separated read names
    FindMissing = 0x04,
    /// Fetch an action result; payload is a read resource name
    ActionGet = 0x05,
    /// Store an action result: [2B name length][name][payload]
    ActionPut = 0x06,
    /// Keepalive
    Ping = 0x07,
    /// Response: one chunk of data
    Data = 0x81,
    /// Response: end of stream; for uploads carries the committed size
    End = 0x82,
    /// Response: error message
    Error = 0xFF,
}

impl TryFrom<u8> for Command {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, io::Error> {
        match value {
            0x01 => Ok(Command::Read),
            0x02 => Ok(Command::Write),
            0x03 => Ok(Command::WriteChunk),
            0x04 => Ok(Command::FindMissing),
            0x05 => Ok(Command::ActionGet),
            0x06 => Ok(Command::ActionPut),
            0x07 => Ok(Command::Ping),
            0x81 => Ok(Command::Data),
            0x82 => Ok(Command::End),
            0xFF => Ok(Command::Error),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown command: {:#04x}", value),
            )),
        }
    }
}

/// Read a frame from the stream
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(Command, Vec<u8>)> {
    let mut command_buf = [0u8; 1];
    reader.read_exact(&mut command_buf)?;
    let command = Command::try_from(command_buf[0])?;

    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf)?;
    let length = u32::from_le_bytes(length_buf) as usize;
    if length > MAXIMUM_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the protocol limit", length),
        ));
    }

    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload)?;
    }
    Ok((command, payload))
}

/// Write a frame to the stream
pub fn write_frame<W: Write>(writer: &mut W, command: Command, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&[command as u8])?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()
}

fn split_fields(resource_name: &str) -> Vec<&str> {
    resource_name.split('/').filter(|f| !f.is_empty()).collect()
}

/// Parse `[instance/]blobs/{hash}/{size}`.
pub fn parse_resource_name_read(resource_name: &str) -> StorageResult<Digest> {
    let fields = split_fields(resource_name);
    let l = fields.len();
    if (l != 3 && l != 4) || fields[l - 3] != "blobs" {
        return Err(StorageError::InvalidArgument(
            "invalid resource naming scheme".to_string(),
        ));
    }
    let size_bytes: u64 = fields[l - 1].parse().map_err(|_| {
        StorageError::InvalidArgument("invalid resource naming scheme".to_string())
    })?;
    let instance = if l == 4 { fields[0] } else { "" };
    Digest::new(instance, fields[l - 2], size_bytes)
}

/// Parse `[instance/]uploads/{uuid}/blobs/{hash}/{size}`.
pub fn parse_resource_name_write(resource_name: &str) -> StorageResult<Digest> {
    let fields = split_fields(resource_name);
    let l = fields.len();
    if (l != 5 && l != 6) || fields[l - 5] != "uploads" || fields[l - 3] != "blobs" {
        return Err(StorageError::InvalidArgument(
            "invalid resource naming scheme".to_string(),
        ));
    }
    let size_bytes: u64 = fields[l - 1].parse().map_err(|_| {
        StorageError::InvalidArgument("invalid resource naming scheme".to_string())
    })?;
    let instance = if l == 6 { fields[0] } else { "" };
    Digest::new(instance, fields[l - 2], size_bytes)
}

/// Read resource name for a digest, used to echo find_missing results.
pub fn format_resource_name_read(digest: &Digest) -> String {
    if digest.instance().is_empty() {
        format!("blobs/{}/{}", digest.hash(), digest.size_bytes())
    } else {
        format!(
            "{}/blobs/{}/{}",
            digest.instance(),
            digest.hash(),
            digest.size_bytes()
        )
    }
}

/// Byte-stream upload state machine: offsets must be contiguous from
/// zero, and the stream must be finished exactly once.
pub struct WriteSession {
    next_offset: u64,
    finished: bool,
}

impl WriteSession {
    pub fn new() -> Self {
        Self {
            next_offset: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Account for one incoming chunk.
    pub fn append(
        &mut self,
        write_offset: u64,
        data_length: usize,
        finish_write: bool,
    ) -> StorageResult<()> {
        if self.finished {
            return Err(StorageError::InvalidArgument(
                "client closed stream twice".to_string(),
            ));
        }
        if write_offset != self.next_offset {
            return Err(StorageError::InvalidArgument(format!(
                "attempted to write at offset {}, while {} was expected",
                write_offset, self.next_offset
            )));
        }
        self.next_offset += data_length as u64;
        if finish_write {
            self.finished = true;
        }
        Ok(())
    }

    /// Total size of a finished stream.
    pub fn committed_size(&self) -> StorageResult<u64> {
        if !self.finished {
            return Err(StorageError::InvalidArgument(
                "client closed stream without finishing write".to_string(),
            ));
        }
        Ok(self.next_offset)
    }
}

impl Default for WriteSession {
    fn default() -> Self {
        Self::new()
    }
}
