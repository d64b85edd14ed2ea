//! Blob cache TCP server
//!
//! Accepts client connections and serves the content-addressable storage
//! and action cache trees over the framed protocol. One thread per
//! connection; uploads stream straight from the socket into the backend.

pub mod protocol;

use crate::blobstore::{BlobAccess, StorageError, StorageResult};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use self::protocol::{
    format_resource_name_read, parse_resource_name_read, parse_resource_name_write, read_frame,
    write_frame, Command, WriteSession, READ_CHUNK_SIZE,
};
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Server configuration
pub struct BlobServerConfig {
    pub bind_addr: String,
}

/// TCP front-end over the two backend trees.
pub struct BlobServer {
    config: BlobServerConfig,
    content_addressable_storage: Arc<dyn BlobAccess>,
    action_cache: Arc<dyn BlobAccess>,
}

impl BlobServer {
    pub fn new(
        config: BlobServerConfig,
        content_addressable_storage: Arc<dyn BlobAccess>,
        action_cache: Arc<dyn BlobAccess>,
    ) -> Self {
        Self {
            config,
            content_addressable_storage,
            action_cache,
        }
    }

    /// Run the server
    pub fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)?;
        log::info!("blob cache listening on {}", self.config.bind_addr);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let cas = Arc::clone(&self.content_addressable_storage);
                    let ac = Arc::clone(&self.action_cache);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, cas, ac) {
                            log::warn!("client handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("connection error: {}", e);
                }
            }
        }

        Ok(())
    }
}

fn handle_client(
    mut stream: TcpStream,
    cas: Arc<dyn BlobAccess>,
    ac: Arc<dyn BlobAccess>,
) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    log::info!("new connection from {}", peer);
    let ctx = Context::background();

    loop {
        let (command, payload) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::info!("client {} disconnected", peer);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match command {
            Command::Read => {
                if let Err(e) = serve_blob(&mut stream, &ctx, &cas, &payload) {
                    write_frame(&mut stream, Command::Error, e.to_string().as_bytes())?;
                }
            }
            Command::ActionGet => {
                if let Err(e) = serve_blob(&mut stream, &ctx, &ac, &payload) {
                    write_frame(&mut stream, Command::Error, e.to_string().as_bytes())?;
                }
            }
            Command::Write => {
                // A failed upload desynchronizes the chunk stream, so the
                // connection is dropped rather than resynchronized.
                match receive_blob(&mut stream, &ctx, &cas, &payload) {
                    Ok(committed_size) => {
                        write_frame(&mut stream, Command::End, &committed_size.to_le_bytes())?;
                    }
                    Err(e) => {
                        write_frame(&mut stream, Command::Error, e.to_string().as_bytes())?;
                        return Ok(());
                    }
                }
            }
            Command::FindMissing => {
                match serve_find_missing(&ctx, &cas, &payload) {
                    Ok(missing) => {
                        write_frame(&mut stream, Command::Data, missing.as_bytes())?;
                        write_frame(&mut stream, Command::End, &[])?;
                    }
                    Err(e) => {
                        write_frame(&mut stream, Command::Error, e.to_string().as_bytes())?;
                    }
                }
            }
            Command::ActionPut => {
                match receive_action_result(&ctx, &ac, &payload) {
                    Ok(committed_size) => {
                        write_frame(&mut stream, Command::End, &committed_size.to_le_bytes())?;
                    }
                    Err(e) => {
                        write_frame(&mut stream, Command::Error, e.to_string().as_bytes())?;
                    }
                }
            }
            Command::Ping => {
                write_frame(&mut stream, Command::End, &[])?;
            }
            Command::Data | Command::End | Command::Error | Command::WriteChunk => {
                write_frame(
                    &mut stream,
                    Command::Error,
                    b"unexpected frame outside of an upload",
                )?;
            }
        }
    }
}

/// Stream a blob to the client as data frames followed by an end frame.
fn serve_blob(
    stream: &mut TcpStream,
    ctx: &Context,
    backend: &Arc<dyn BlobAccess>,
    payload: &[u8],
) -> StorageResult<()> {
    let resource_name = String::from_utf8(payload.to_vec())
        .map_err(|_| StorageError::InvalidArgument("resource name is not UTF-8".to_string()))?;
    let digest = parse_resource_name_read(&resource_name)?;
    let mut reader = backend.get(ctx, &digest)?.into_chunk_reader(0, READ_CHUNK_SIZE);
    while let Some(chunk) = reader.read_chunk()? {
        write_frame(stream, Command::Data, &chunk)?;
    }
    write_frame(stream, Command::End, &[])?;
    Ok(())
}

/// Receive an upload, streaming chunk frames straight into the backend.
fn receive_blob(
    stream: &mut TcpStream,
    ctx: &Context,
    backend: &Arc<dyn BlobAccess>,
    payload: &[u8],
) -> StorageResult<u64> {
    let resource_name = String::from_utf8(payload.to_vec())
        .map_err(|_| StorageError::InvalidArgument("resource name is not UTF-8".to_string()))?;
    let digest = parse_resource_name_write(&resource_name)?;
    let reader = WriteStreamReader {
        stream: stream.try_clone()?,
        session: WriteSession::new(),
        pending: Vec::new(),
        pending_position: 0,
    };
    backend.put(
        ctx,
        &digest,
        Buffer::cas_from_reader(&digest, Box::new(reader), None),
    )?;
    Ok(digest.size_bytes())
}

fn serve_find_missing(
    ctx: &Context,
    backend: &Arc<dyn BlobAccess>,
    payload: &[u8],
) -> StorageResult<String> {
    let request = String::from_utf8(payload.to_vec())
        .map_err(|_| StorageError::InvalidArgument("resource names are not UTF-8".to_string()))?;
    let digests = request
        .lines()
        .filter(|line| !line.is_empty())
        .map(parse_resource_name_read)
        .collect::<StorageResult<Vec<Digest>>>()?;
    let missing = backend.find_missing(ctx, &digests)?;
    Ok(missing
        .iter()
        .map(format_resource_name_read)
        .collect::<Vec<String>>()
        .join("\n"))
}

fn receive_action_result(
    ctx: &Context,
    backend: &Arc<dyn BlobAccess>,
    payload: &[u8],
) -> StorageResult<u64> {
    if payload.len() < 2 {
        return Err(StorageError::InvalidArgument(
            "truncated action result frame".to_string(),
        ));
    }
    let name_length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + name_length {
        return Err(StorageError::InvalidArgument(
            "truncated action result frame".to_string(),
        ));
    }
    let resource_name = std::str::from_utf8(&payload[2..2 + name_length])
        .map_err(|_| StorageError::InvalidArgument("resource name is not UTF-8".to_string()))?;
    let digest = parse_resource_name_read(resource_name)?;
    let record = payload[2 + name_length..].to_vec();
    let record_length = record.len() as u64;
    backend.put(ctx, &digest, Buffer::from_validated_bytes(record))?;
    Ok(record_length)
}

/// Pull-based reader over incoming chunk frames. Enforces the write
/// session rules as the backend consumes the stream.
struct WriteStreamReader {
    stream: TcpStream,
    session: WriteSession,
    pending: Vec<u8>,
    pending_position: usize,
}

impl Read for WriteStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pending_position < self.pending.len() {
                let n = (self.pending.len() - self.pending_position).min(buf.len());
                buf[..n].copy_from_slice(
                    &self.pending[self.pending_position..self.pending_position + n],
                );
                self.pending_position += n;
                return Ok(n);
            }
            if self.session.is_finished() {
                return Ok(0);
            }
            let (command, payload) = read_frame(&mut self.stream).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    StorageError::InvalidArgument(
                        "client closed stream without finishing write".to_string(),
                    )
                    .into_io()
                } else {
                    e
                }
            })?;
            if command != Command::WriteChunk {
                return Err(StorageError::InvalidArgument(format!(
                    "expected a write chunk, got {:?}",
                    command
                ))
                .into_io());
            }
            if payload.len() < 9 {
                return Err(
                    StorageError::InvalidArgument("truncated write chunk".to_string()).into_io(),
                );
            }
            let mut offset_bytes = [0u8; 8];
            offset_bytes.copy_from_slice(&payload[0..8]);
            let write_offset = u64::from_le_bytes(offset_bytes);
            let finish_write = payload[8] != 0;
            let data = &payload[9..];
            self.session
                .append(write_offset, data.len(), finish_write)
                .map_err(StorageError::into_io)?;
            self.pending = data.to_vec();
            self.pending_position = 0;
        }
    }
}
