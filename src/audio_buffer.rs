/// Frame assembly for audio sources
///
/// Audio arrives in blocks of arbitrary size; the engine wants frames of
/// exactly `frame_length` samples. `FrameBuffer` re-chunks the stream through
/// a ring buffer, dropping the oldest samples if the consumer falls behind.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Frames of headroom kept by default
pub const DEFAULT_CAPACITY_FRAMES: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameBufferError {
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),

    #[error("Capacity of {capacity} samples cannot hold a {frame_length}-sample frame")]
    InvalidCapacity { capacity: usize, frame_length: usize },
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

pub struct FrameBuffer {
    producer: RingProducer,
    consumer: RingConsumer,
    frame_length: usize,
    dropped_samples: u64,
}

impl FrameBuffer {
    pub fn new(frame_length: usize) -> Result<Self, FrameBufferError> {
        Self::with_capacity(frame_length, frame_length.saturating_mul(DEFAULT_CAPACITY_FRAMES))
    }

    /// Buffer holding up to `capacity` samples
    pub fn with_capacity(frame_length: usize, capacity: usize) -> Result<Self, FrameBufferError> {
        if frame_length == 0 {
            return Err(FrameBufferError::InvalidFrameLength(frame_length));
        }
        if capacity < frame_length {
            return Err(FrameBufferError::InvalidCapacity {
                capacity,
                frame_length,
            });
        }

        let (producer, consumer) = RingBuffer::new(capacity).split();

        Ok(Self {
            producer,
            consumer,
            frame_length,
            dropped_samples: 0,
        })
    }

    /// Append samples, overwriting the oldest ones when full
    pub fn push(&mut self, samples: &[AudioSample]) {
        let capacity = self.capacity();
        let samples = if samples.len() > capacity {
            let skipped = samples.len() - capacity;
            self.dropped_samples += skipped as u64;
            &samples[skipped..]
        } else {
            samples
        };

        let vacant = self.producer.vacant_len();
        if samples.len() > vacant {
            let to_drop = samples.len() - vacant;
            self.consumer.skip(to_drop);
            self.dropped_samples += to_drop as u64;
            warn!("Frame buffer full, dropped {} oldest samples", to_drop);
        }

        let written = self.producer.push_slice(samples);
        trace!("Buffered {} samples", written);
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<AudioSample>> {
        if self.consumer.occupied_len() < self.frame_length {
            return None;
        }

        let mut frame = vec![0; self.frame_length];
        self.consumer.pop_slice(&mut frame);
        Some(frame)
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Samples buffered but not yet returned as a frame
    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// Samples lost to overflow since creation
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn clear(&mut self) {
        let occupied = self.consumer.occupied_len();
        self.consumer.skip(occupied);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rechunks_into_frames() {
        let mut buffer = FrameBuffer::new(4).unwrap();
        let samples: Vec<i16> = (0..10).collect();

        buffer.push(&samples[..3]);
        assert_eq!(buffer.next_frame(), None);

        buffer.push(&samples[3..]);
        assert_eq!(buffer.next_frame(), Some(vec![0, 1, 2, 3]));
        assert_eq!(buffer.next_frame(), Some(vec![4, 5, 6, 7]));
        assert_eq!(buffer.next_frame(), None);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = FrameBuffer::with_capacity(2, 4).unwrap();

        buffer.push(&[1, 2, 3, 4]);
        buffer.push(&[5, 6]);

        assert_eq!(buffer.dropped_samples(), 2);
        assert_eq!(buffer.next_frame(), Some(vec![3, 4]));
        assert_eq!(buffer.next_frame(), Some(vec![5, 6]));
    }

    #[test]
    fn test_oversized_block_keeps_newest() {
        let mut buffer = FrameBuffer::with_capacity(2, 4).unwrap();
        let block: Vec<i16> = (0..7).collect();

        buffer.push(&block);

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.next_frame(), Some(vec![3, 4]));
        assert_eq!(buffer.dropped_samples(), 3);
    }

    #[test]
    fn test_invalid_sizes() {
        assert_eq!(FrameBuffer::new(0).err(), Some(FrameBufferError::InvalidFrameLength(0)));
        assert!(matches!(
            FrameBuffer::with_capacity(512, 100),
            Err(FrameBufferError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new(4).unwrap();
        buffer.push(&[1; 6]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_frame(), None);
    }
}
