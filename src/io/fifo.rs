use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// A byte queue built from shared segments.
///
/// Enqueued data is not copied until it is dequeued, and dequeuing never
/// waits: it returns whatever is available up to the requested amount.
#[derive(Debug, Default)]
pub struct FifoBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl FifoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Moves up to `buffer.len()` bytes into `buffer` and returns how many
    /// were moved.
    pub fn dequeue_into(&mut self, buffer: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buffer.len() {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            let len = front.len().min(buffer.len() - filled);
            buffer[filled..filled + len].copy_from_slice(&front[..len]);
            front.advance(len);
            if front.is_empty() {
                self.segments.pop_front();
            }
            filled += len;
        }
        self.len -= filled;
        filled
    }

    /// Removes up to `len` bytes, without copying when they lie in a single
    /// segment.
    pub fn dequeue(&mut self, len: usize) -> Bytes {
        let len = len.min(self.len);
        if len == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.segments.front_mut() {
            if front.len() >= len {
                let taken = front.split_to(len);
                if front.is_empty() {
                    self.segments.pop_front();
                }
                self.len -= len;
                return taken;
            }
        }
        let mut data = vec![0; len];
        let filled = self.dequeue_into(&mut data);
        data.truncate(filled);
        Bytes::from(data)
    }

    /// Removes everything.
    pub fn take_all(&mut self) -> Bytes {
        self.dequeue(self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}
