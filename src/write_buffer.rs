//! Write-behind buffering for partial sends
//!
//! When a send would block, the unsent bytes are copied into a per-channel
//! [`WriteBuffer`]: a FIFO chain of fixed-capacity chunks, appended at the
//! tail and drained from the head. Fully drained chunks go back to a shared
//! [`ChunkPool`] so that a busy engine does not allocate a fresh chunk for
//! every blocked write.
//!
//! The chain never holds an empty chunk: `chunk_count() > 0` implies
//! `len() > 0`.
//!
//! # Examples
//!
//! ```rust
//! use horizon_mnet::write_buffer::{ChunkPool, WriteBuffer};
//!
//! let mut pool = ChunkPool::new(4, 8);
//! let mut wb = WriteBuffer::new();
//! wb.push(b"hello world", &mut pool);
//! assert_eq!((wb.len(), wb.chunk_count()), (11, 2));
//!
//! assert_eq!(wb.front(), Some(&b"hello wo"[..]));
//! wb.consume(8, &mut pool);
//! assert_eq!(wb.front(), Some(&b"rld"[..]));
//! ```

use std::collections::VecDeque;

/// Recycles drained write-buffer chunks
///
/// The pool is owned by one engine and shared by all of its channels. It
/// keeps at most `max_chunks` spare chunks; extra ones are dropped.
#[derive(Debug)]
pub struct ChunkPool {
    /// Spare chunks, cleared but with capacity preserved
    chunks: Vec<Vec<u8>>,
    /// Capacity of every chunk handed out
    chunk_size: usize,
    /// Maximum number of spare chunks to keep
    max_chunks: usize,
}

impl ChunkPool {
    /// Creates an empty pool handing out chunks of `chunk_size` bytes
    pub fn new(max_chunks: usize, chunk_size: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(max_chunks),
            chunk_size: chunk_size.max(1),
            max_chunks,
        }
    }

    /// Takes a spare chunk, allocating when none is left
    pub fn acquire(&mut self) -> Vec<u8> {
        self.chunks
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.chunk_size))
    }

    /// Returns a chunk for reuse, or drops it when the pool is full
    pub fn release(&mut self, mut chunk: Vec<u8>) {
        if self.chunks.len() < self.max_chunks {
            chunk.clear();
            self.chunks.push(chunk);
        }
    }

    /// Spare chunks currently held
    pub fn available_count(&self) -> usize {
        self.chunks.len()
    }

    /// Capacity of one chunk in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[derive(Debug)]
struct Chunk {
    /// Written bytes; `buf.len()` is the write cursor
    buf: Vec<u8>,
    /// Read cursor
    read: usize,
}

impl Chunk {
    fn buffered(&self) -> usize {
        self.buf.len() - self.read
    }
}

/// FIFO of bytes a channel could not send yet
#[derive(Debug, Default)]
pub struct WriteBuffer {
    chunks: VecDeque<Chunk>,
    buffered: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` at the tail, filling the last chunk first
    pub fn push(&mut self, mut data: &[u8], pool: &mut ChunkPool) {
        let cap = pool.chunk_size();
        self.buffered += data.len();
        while !data.is_empty() {
            let spare = match self.chunks.back() {
                Some(tail) => cap.saturating_sub(tail.buf.len()),
                None => 0,
            };
            if spare == 0 {
                self.chunks.push_back(Chunk { buf: pool.acquire(), read: 0 });
                continue;
            }
            let n = spare.min(data.len());
            if let Some(tail) = self.chunks.back_mut() {
                tail.buf.extend_from_slice(&data[..n]);
            }
            data = &data[n..];
        }
    }

    /// Unsent bytes of the head chunk
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c.buf[c.read..])
    }

    /// Marks `n` bytes as sent, releasing every chunk that becomes empty
    pub fn consume(&mut self, mut n: usize, pool: &mut ChunkPool) {
        while n > 0 {
            let Some(head) = self.chunks.front_mut() else { break };
            let step = n.min(head.buffered());
            head.read += step;
            self.buffered -= step;
            n -= step;
            if head.buffered() == 0 {
                if let Some(done) = self.chunks.pop_front() {
                    pool.release(done.buf);
                }
            }
        }
    }

    /// Moves every chunk of `other` behind the ones already queued
    pub fn append(&mut self, other: &mut WriteBuffer) {
        self.buffered += other.buffered;
        other.buffered = 0;
        self.chunks.append(&mut other.chunks);
    }

    /// Drops every queued byte
    pub fn clear(&mut self, pool: &mut ChunkPool) {
        for chunk in self.chunks.drain(..) {
            pool.release(chunk.buf);
        }
        self.buffered = 0;
    }

    /// Total queued bytes
    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Chunks currently in the chain
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
