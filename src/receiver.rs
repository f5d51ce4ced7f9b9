//! Chunked file reception over a connectionless channel.
//!
//! Chunks arrive unordered, lossy and possibly duplicated on a multicast
//! or broadcast socket; receipt is tracked per file in a [`ChunkBitmap`]
//! and acknowledged in batches over the reliable [`Endpoint`]. Delivery
//! is completion-driven (the controller keeps re-broadcasting whatever
//! is unacknowledged), so there is no retransmission logic here at all.
//!
//! The whole receive path is single-threaded: one [`ChunkReceiver`] is
//! owned and pumped by one thread, so the bitmaps and the ack batch
//! need no locking.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::protocol::{
    chunk_count_for, chunk_offset, chunk_payload_len, encode_chunk_acks, ChunkAck, ChunkDatagram,
    CHUNK_PAYLOAD_BYTES, MAX_ACKS_PER_MESSAGE, MAX_FILE_SIZE,
};

/// How long a UDP source blocks per receive attempt before reporting
/// "nothing yet", so the pump loop can run its periodic work.
const RECV_POLL: Duration = Duration::from_millis(20);

/// Largest datagram the pump loop will accept.
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// The connectionless channel, injected so the chunk algorithm stays
/// transport-agnostic (multicast, broadcast, or an in-memory test feed).
pub trait DatagramSource {
    /// Receive one datagram into `buf` if one arrives within the
    /// source's poll interval. `Ok(None)` means nothing yet.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// UDP implementation of [`DatagramSource`], in either multicast or
/// broadcast mode.
pub struct UdpDatagramSource {
    socket: UdpSocket,
}

impl UdpDatagramSource {
    /// Join `group` and listen for chunk datagrams on `port`.
    pub fn multicast(group: Ipv4Addr, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(Self { socket })
    }

    /// Listen for broadcast chunk datagrams on `port`.
    pub fn broadcast(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(Self { socket })
    }
}

impl DatagramSource for UdpDatagramSource {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.recv_from(buf) {
            Ok((n, _peer)) => Ok(Some(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(TransportError::Socket(e)),
        }
    }
}

/// Bit-per-chunk receipt record. Doubles as the idempotence check
/// (test-before-set) and the completion detector.
pub struct ChunkBitmap {
    words: Vec<u64>,
    bits: usize,
}

impl ChunkBitmap {
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(64)],
            bits,
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Set a bit. Returns false if it was already set.
    pub fn set(&mut self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        true
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Receiver-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Sanity bound on declared file sizes; larger declarations are a
    /// protocol violation, not an allocation request.
    pub max_file_size: u32,
    /// Chunk payload size the session's sender splits files with.
    pub chunk_payload_bytes: usize,
    /// Acks accumulated before a batch is flushed regardless of timing.
    pub ack_batch_capacity: usize,
    /// Flush any pending acks at least this often.
    pub ack_flush_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
            chunk_payload_bytes: CHUNK_PAYLOAD_BYTES,
            ack_batch_capacity: MAX_ACKS_PER_MESSAGE,
            ack_flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Receiving,
    Complete,
}

/// Per-file reconstruction state. Created on the first chunk seen for a
/// file id, mutated only by the receive loop, immutable once complete.
pub struct FileTransfer {
    filename: String,
    compressed_size: u32,
    uncompressed_size: u32,
    chunk_count: u16,
    bitmap: ChunkBitmap,
    chunks_remaining: u32,
    compressed: Vec<u8>,
    decompressed: Option<Vec<u8>>,
    state: TransferState,
}

impl FileTransfer {
    fn start(dgram: &ChunkDatagram, config: &ReceiverConfig) -> Result<Self> {
        if dgram.compressed_size > config.max_file_size
            || dgram.uncompressed_size > config.max_file_size
        {
            return Err(TransportError::Protocol(format!(
                "file {} declares insane size (compressed {}, uncompressed {})",
                dgram.filename, dgram.compressed_size, dgram.uncompressed_size
            )));
        }
        let expected = chunk_count_for(dgram.compressed_size, config.chunk_payload_bytes);
        if expected > u16::MAX as usize || dgram.chunk_count as usize != expected {
            return Err(TransportError::Protocol(format!(
                "file {} declares {} chunks for {} compressed bytes (expected {expected})",
                dgram.filename, dgram.chunk_count, dgram.compressed_size,
            )));
        }
        debug!(
            "first chunk for file {} ({}): {} chunks, {} compressed bytes",
            dgram.file_id, dgram.filename, dgram.chunk_count, dgram.compressed_size
        );
        Ok(FileTransfer {
            filename: dgram.filename.clone(),
            compressed_size: dgram.compressed_size,
            uncompressed_size: dgram.uncompressed_size,
            chunk_count: dgram.chunk_count,
            bitmap: ChunkBitmap::new(dgram.chunk_count as usize),
            chunks_remaining: dgram.chunk_count as u32,
            compressed: vec![0u8; dgram.compressed_size as usize],
            decompressed: None,
            state: TransferState::Receiving,
        })
    }

    /// Every chunk after the first must agree with the metadata the
    /// transfer was created from; disagreement means the sender and
    /// receiver have desynchronized and is fatal.
    fn check_consistent(&self, dgram: &ChunkDatagram) -> Result<()> {
        if dgram.compressed_size != self.compressed_size
            || dgram.uncompressed_size != self.uncompressed_size
            || dgram.chunk_count != self.chunk_count
            || dgram.filename != self.filename
        {
            return Err(TransportError::Protocol(format!(
                "chunk metadata mismatch for file id {}: got {}/{} bytes x{} ({}), transfer has {}/{} bytes x{} ({})",
                dgram.file_id,
                dgram.compressed_size,
                dgram.uncompressed_size,
                dgram.chunk_count,
                dgram.filename,
                self.compressed_size,
                self.uncompressed_size,
                self.chunk_count,
                self.filename,
            )));
        }
        Ok(())
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Complete
    }

    pub fn chunks_remaining(&self) -> u32 {
        self.chunks_remaining
    }
}

/// Fixed-capacity acknowledgment batch. Produces encoded CHUNK_ACK
/// messages when full or when the flush interval elapses, whichever
/// comes first.
struct AckBatcher {
    pending: Vec<ChunkAck>,
    capacity: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl AckBatcher {
    fn new(capacity: usize, flush_interval: Duration) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Queue one ack; returns an encoded message when the batch filled.
    fn push(&mut self, ack: ChunkAck) -> Option<Vec<u8>> {
        self.pending.push(ack);
        if self.pending.len() >= self.capacity {
            return self.drain();
        }
        None
    }

    /// An encoded message if the interval elapsed with acks pending.
    fn take_if_due(&mut self) -> Option<Vec<u8>> {
        if !self.pending.is_empty() && self.last_flush.elapsed() >= self.flush_interval {
            return self.drain();
        }
        None
    }

    fn drain(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            self.last_flush = Instant::now();
            return None;
        }
        let message = encode_chunk_acks(&self.pending);
        self.pending.clear();
        self.last_flush = Instant::now();
        Some(message)
    }
}

/// Reconstructs files out of the chunk stream. Many files may be in
/// flight at once; the pump loop applies chunks for all of them and
/// returns when the file the caller is waiting on completes.
pub struct ChunkReceiver<S: DatagramSource> {
    source: S,
    endpoint: Arc<Endpoint>,
    config: ReceiverConfig,
    transfers: HashMap<u16, FileTransfer>,
    acks: AckBatcher,
    recv_buf: Vec<u8>,
}

impl<S: DatagramSource> ChunkReceiver<S> {
    pub fn new(source: S, endpoint: Arc<Endpoint>, config: ReceiverConfig) -> Self {
        let acks = AckBatcher::new(config.ack_batch_capacity, config.ack_flush_interval);
        Self {
            source,
            endpoint,
            config,
            transfers: HashMap::new(),
            acks,
            recv_buf: vec![0u8; MAX_DATAGRAM_BYTES],
        }
    }

    /// Keep receiving and applying chunks (for every in-flight file)
    /// until `file_id` is complete, then hand out its decompressed
    /// bytes. Acks are flushed on the configured interval even while
    /// the channel is idle.
    pub fn pump_until_complete(&mut self, file_id: u16) -> Result<Vec<u8>> {
        loop {
            if self.is_complete(file_id) {
                // Ack the tail of the transfer before handing it out.
                self.flush_acks()?;
                if let Some(bytes) = self.take_completed(file_id) {
                    return Ok(bytes);
                }
            }
            if !self.endpoint.is_alive() {
                return Err(TransportError::EndpointClosed);
            }
            let n = self.source.recv_datagram(&mut self.recv_buf)?;
            if let Some(n) = n {
                let dgram = ChunkDatagram::parse(&self.recv_buf[..n])?;
                self.apply_chunk(dgram)?;
            }
            if let Some(message) = self.acks.take_if_due() {
                self.endpoint.send(&message)?;
            }
        }
    }

    /// Apply one parsed chunk datagram. Duplicates are ignored (and not
    /// re-acknowledged); malformed chunks are fatal.
    pub fn apply_chunk(&mut self, dgram: ChunkDatagram) -> Result<()> {
        let file_id = dgram.file_id;
        let transfer = match self.transfers.entry(file_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(FileTransfer::start(&dgram, &self.config)?),
        };

        if transfer.is_complete() {
            trace!("chunk for already-complete file {file_id}, ignoring");
            return Ok(());
        }
        transfer.check_consistent(&dgram)?;

        if dgram.chunk_index >= transfer.chunk_count {
            return Err(TransportError::Protocol(format!(
                "chunk index {} out of range for file {} ({} chunks)",
                dgram.chunk_index, file_id, transfer.chunk_count
            )));
        }
        let expected_len = chunk_payload_len(
            transfer.compressed_size,
            dgram.chunk_index,
            transfer.chunk_count,
            self.config.chunk_payload_bytes,
        );
        if dgram.payload.len() != expected_len {
            return Err(TransportError::Protocol(format!(
                "chunk {} of file {} carries {} bytes, expected {}",
                dgram.chunk_index,
                file_id,
                dgram.payload.len(),
                expected_len
            )));
        }

        if !transfer.bitmap.set(dgram.chunk_index as usize) {
            // Lossy channel, duplicates are normal. Never double-count,
            // never re-ack.
            trace!("duplicate chunk {} for file {}", dgram.chunk_index, file_id);
            return Ok(());
        }
        let offset = chunk_offset(dgram.chunk_index, self.config.chunk_payload_bytes);
        transfer.compressed[offset..offset + expected_len].copy_from_slice(&dgram.payload);
        transfer.chunks_remaining -= 1;
        trace!(
            "applied chunk {}/{} for file {}, {} remaining",
            dgram.chunk_index,
            transfer.chunk_count,
            file_id,
            transfer.chunks_remaining
        );

        if let Some(message) = self.acks.push(ChunkAck {
            file_id,
            chunk_index: dgram.chunk_index,
        }) {
            self.endpoint.send(&message)?;
        }

        if transfer.chunks_remaining == 0 {
            let compressed = std::mem::take(&mut transfer.compressed);
            let bytes = decompress(&compressed, transfer.uncompressed_size as usize)?;
            transfer.decompressed = Some(bytes);
            transfer.state = TransferState::Complete;
            debug!(
                "file {} ({}) complete: {} bytes",
                file_id, transfer.filename, transfer.uncompressed_size
            );
        }
        Ok(())
    }

    /// Send any pending acks immediately.
    pub fn flush_acks(&mut self) -> Result<()> {
        if let Some(message) = self.acks.drain() {
            self.endpoint.send(&message)?;
        }
        Ok(())
    }

    pub fn is_complete(&self, file_id: u16) -> bool {
        self.transfers
            .get(&file_id)
            .is_some_and(FileTransfer::is_complete)
    }

    pub fn transfer(&self, file_id: u16) -> Option<&FileTransfer> {
        self.transfers.get(&file_id)
    }

    /// Remove a completed transfer and hand out its decompressed bytes.
    /// Each completed file can be taken exactly once.
    pub fn take_completed(&mut self, file_id: u16) -> Option<Vec<u8>> {
        if !self.is_complete(file_id) {
            return None;
        }
        let transfer = self.transfers.remove(&file_id)?;
        transfer.decompressed
    }
}

/// Inflate the assembled buffer. Anything short of an exact-length
/// success is data corruption.
fn decompress(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut decoder = ZlibDecoder::new(compressed);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TransportError::Decompression(e.to_string()))?;
    if out.len() != expected_len {
        warn!(
            "decompressed to {} bytes, expected {expected_len}",
            out.len()
        );
        return Err(TransportError::Decompression(format!(
            "decompressed length {} does not match declared {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
