//! Size-bucketed free list for packet and segment buffers. Buffers come back
//! to the pool when the `PoolBuf` handed to a handler is dropped.

use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use std::ops::{Deref, DerefMut};

const BUCKET_SIZES: [usize; 4] = [256, 1024, 4096, 16384];
const BUCKET_DEPTH: usize = 128;

static POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// Takes a zeroed buffer of exactly `len` bytes from the pool.
pub(crate) fn take(len: usize) -> PoolBuf {
    POOL.take(len)
}

struct Bucket {
    size: usize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

struct BufferPool {
    buckets: Vec<Bucket>,
}

impl BufferPool {
    fn new() -> Self {
        let buckets = BUCKET_SIZES
            .iter()
            .map(|&size| {
                let (free_tx, free_rx) = bounded(BUCKET_DEPTH);
                Bucket {
                    size,
                    free_tx,
                    free_rx,
                }
            })
            .collect();
        Self { buckets }
    }

    fn take(&self, len: usize) -> PoolBuf {
        let Some(bucket) = self.buckets.iter().find(|bucket| bucket.size >= len) else {
            // Oversized requests are served from the heap and never recycled.
            return PoolBuf {
                data: vec![0; len],
                home: None,
            };
        };
        let mut data = match bucket.free_rx.try_recv() {
            Ok(buf) => buf,
            Err(_) => Vec::with_capacity(bucket.size),
        };
        data.clear();
        data.resize(len, 0);
        PoolBuf {
            data,
            home: Some(bucket.free_tx.clone()),
        }
    }
}

/// An owned buffer leased from the pool.
pub struct PoolBuf {
    data: Vec<u8>,
    home: Option<Sender<Vec<u8>>>,
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            // A full bucket simply lets the buffer fall to the allocator.
            let _ = home.try_send(std::mem::take(&mut self.data));
        }
    }
}
