//! Shared wire-format constants and message codecs.
//!
//! All integers are little-endian. Strings travel as NUL-terminated
//! UTF-8 (the controller side of the protocol predates length prefixes).

use crate::error::{Result, TransportError};

/// Reserved frame length meaning "no payload - liveness probe only".
/// Chosen to be distinct from any legitimate length.
pub const KEEPALIVE_SENTINEL: i32 = -12345;

/// Size of the frame length prefix on the TCP channel.
pub const FRAME_HEADER_LEN: usize = 4;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
// from a bogus declared length.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on declared file sizes in a chunk datagram (1GiB).
/// Anything larger is a protocol violation, not an allocation request.
pub const MAX_FILE_SIZE: u32 = 1024 * 1024 * 1024;

/// Default chunk payload size on the connectionless channel. MTU-safe
/// together with the datagram header and a filename. Both sides of a
/// session must agree on the chunk size in use.
pub const CHUNK_PAYLOAD_BYTES: usize = 1024;

/// Maximum (file_id, chunk_index) pairs in one CHUNK_ACK message.
pub const MAX_ACKS_PER_MESSAGE: usize = 128;

// Packet kind IDs for control messages on the TCP channel
// (keep numeric values stable for wire compat).
pub mod packet {
    pub const FILE_REQUEST: u8 = 1;
    pub const FILE_RESPONSE: u8 = 2;
    pub const CHUNK_ACK: u8 = 3;
}

/// Build the 4-byte frame length prefix.
pub fn frame_header(payload_len: usize) -> [u8; 4] {
    (payload_len as i32).to_le_bytes()
}

/// Build the keepalive frame (header only, sentinel length).
pub fn keepalive_frame() -> [u8; 4] {
    KEEPALIVE_SENTINEL.to_le_bytes()
}

/// Parse the frame length prefix. Returns `None` for the keepalive
/// sentinel, the payload length otherwise.
pub fn parse_frame_header(header: [u8; 4], max_frame_size: usize) -> Result<Option<usize>> {
    let len = i32::from_le_bytes(header);
    if len == KEEPALIVE_SENTINEL {
        return Ok(None);
    }
    if len < 0 {
        return Err(TransportError::Protocol(format!(
            "negative frame length {len}"
        )));
    }
    let len = len as usize;
    if len > max_frame_size {
        return Err(TransportError::Protocol(format!(
            "frame payload too large: {len} bytes (max: {max_frame_size})"
        )));
    }
    Ok(Some(len))
}

/// Number of `chunk_bytes`-sized chunks a compressed buffer splits into.
/// May exceed the wire format's `u16` chunk count for large files; the
/// receiver rejects such declarations rather than truncating.
pub fn chunk_count_for(compressed_size: u32, chunk_bytes: usize) -> usize {
    (compressed_size as usize).div_ceil(chunk_bytes).max(1)
}

/// Expected payload length of one chunk: full size except a short tail.
pub fn chunk_payload_len(
    compressed_size: u32,
    chunk_index: u16,
    chunk_count: u16,
    chunk_bytes: usize,
) -> usize {
    if chunk_index + 1 == chunk_count {
        compressed_size as usize - (chunk_count as usize - 1) * chunk_bytes
    } else {
        chunk_bytes
    }
}

/// Byte offset of a chunk within the compressed buffer.
pub fn chunk_offset(chunk_index: u16, chunk_bytes: usize) -> usize {
    chunk_index as usize * chunk_bytes
}

/// Worker -> controller: "does this file exist, and what is its id?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub request_id: u32,
    pub filename: String,
    pub path_id: String,
}

impl FileRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + self.filename.len() + self.path_id.len() + 2);
        buf.push(packet::FILE_REQUEST);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        put_cstr(&mut buf, &self.filename);
        put_cstr(&mut buf, &self.path_id);
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        r.expect_kind(packet::FILE_REQUEST)?;
        let request_id = r.take_u32()?;
        let filename = r.take_cstr()?;
        let path_id = r.take_cstr()?;
        r.finish()?;
        Ok(FileRequest {
            request_id,
            filename,
            path_id,
        })
    }
}

/// File id meaning "not found" in a [`FileResponse`].
pub const FILE_ID_NOT_FOUND: i32 = -1;

/// Controller -> worker reply, correlated by request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileResponse {
    pub request_id: u32,
    /// Session-scoped file id, or [`FILE_ID_NOT_FOUND`].
    pub file_id: i32,
    /// Found but empty: no chunks will ever be broadcast for it.
    pub zero_length: bool,
}

impl FileResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + 4 + 1);
        buf.push(packet::FILE_RESPONSE);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.push(self.zero_length as u8);
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        r.expect_kind(packet::FILE_RESPONSE)?;
        let request_id = r.take_u32()?;
        let file_id = r.take_i32()?;
        let zero_length = r.take_u8()? != 0;
        r.finish()?;
        Ok(FileResponse {
            request_id,
            file_id,
            zero_length,
        })
    }
}

/// One acknowledged chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub file_id: u16,
    pub chunk_index: u16,
}

/// Encode a batch of acks into one CHUNK_ACK message.
pub fn encode_chunk_acks(acks: &[ChunkAck]) -> Vec<u8> {
    debug_assert!(acks.len() <= MAX_ACKS_PER_MESSAGE);
    let mut buf = Vec::with_capacity(1 + 2 + acks.len() * 4);
    buf.push(packet::CHUNK_ACK);
    buf.extend_from_slice(&(acks.len() as u16).to_le_bytes());
    for ack in acks {
        buf.extend_from_slice(&ack.file_id.to_le_bytes());
        buf.extend_from_slice(&ack.chunk_index.to_le_bytes());
    }
    buf
}

/// Parse a CHUNK_ACK message body.
pub fn parse_chunk_acks(payload: &[u8]) -> Result<Vec<ChunkAck>> {
    let mut r = Reader::new(payload);
    r.expect_kind(packet::CHUNK_ACK)?;
    let count = r.take_u16()? as usize;
    if count > MAX_ACKS_PER_MESSAGE {
        return Err(TransportError::Protocol(format!(
            "ack batch of {count} exceeds {MAX_ACKS_PER_MESSAGE}"
        )));
    }
    let mut acks = Vec::with_capacity(count);
    for _ in 0..count {
        let file_id = r.take_u16()?;
        let chunk_index = r.take_u16()?;
        acks.push(ChunkAck {
            file_id,
            chunk_index,
        });
    }
    r.finish()?;
    Ok(acks)
}

/// One datagram on the connectionless channel: metadata plus a slice of
/// the file's compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDatagram {
    pub file_id: u16,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub chunk_count: u16,
    pub chunk_index: u16,
    pub filename: String,
    pub payload: Vec<u8>,
}

impl ChunkDatagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.filename.len() + 1 + self.payload.len());
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        buf.extend_from_slice(&self.chunk_count.to_le_bytes());
        buf.extend_from_slice(&self.chunk_index.to_le_bytes());
        put_cstr(&mut buf, &self.filename);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let mut r = Reader::new(datagram);
        let file_id = r.take_u16()?;
        let compressed_size = r.take_u32()?;
        let uncompressed_size = r.take_u32()?;
        let chunk_count = r.take_u16()?;
        let chunk_index = r.take_u16()?;
        let filename = r.take_cstr()?;
        let payload = r.take_rest().to_vec();
        Ok(ChunkDatagram {
            file_id,
            compressed_size,
            uncompressed_size,
            chunk_count,
            chunk_index,
            filename,
            payload,
        })
    }
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Bounds-checked cursor over a received message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn short(&self, what: &str) -> TransportError {
        TransportError::Protocol(format!(
            "truncated message: {what} at offset {} of {}",
            self.pos,
            self.buf.len()
        ))
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(self.short(what));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i32(&mut self) -> Result<i32> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.short("unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| TransportError::Protocol("non-UTF8 string".into()))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn expect_kind(&mut self, kind: u8) -> Result<()> {
        let got = self.take_u8()?;
        if got != kind {
            return Err(TransportError::Protocol(format!(
                "unexpected packet kind {got} (wanted {kind})"
            )));
        }
        Ok(())
    }

    /// Reject trailing garbage on fixed-shape messages.
    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(TransportError::Protocol(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
