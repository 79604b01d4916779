use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;
use tracing::{debug, trace};

/// Pool of outbound datagram buffers. Buffers are handed out empty with the configured capacity;
///  buffers returned while the pool is full are discarded.
pub struct SendBufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        SendBufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            // the buffer was split or frozen along the way, it is cheaper to let it go
            trace!("returned buffer lost its capacity: discarding");
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
