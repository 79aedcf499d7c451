//! # Local Audio Buffer
//!
//! A fixed-capacity interleaved sample ring paired with a
//! [`fifo::DescriptorFifo`] that tags ranges of the ring with the local
//! time they were written, so a transmit stream can rebase presentation
//! time onto its own reference plane and a receive stream can feed a
//! downstream consumer (ALSA, a test harness) in write order.

pub mod fifo;

use fifo::{AudioBufferDesc, DescriptorFifo};
use parking_lot::Mutex;

/// Interleaved-sample ring buffer over a fixed number of channels, with
/// a paired descriptor FIFO recording which local time each write
/// happened at.
pub struct LocalAudioBuffer {
    channels: usize,
    ring: Mutex<Vec<i16>>,
    write_index: Mutex<u64>,
    descriptors: DescriptorFifo,
}

impl LocalAudioBuffer {
    /// Builds a buffer for `channels` channels, `frames_capacity` frames
    /// deep, with a descriptor FIFO bounded to `descriptor_capacity`
    /// entries.
    pub fn new(channels: usize, frames_capacity: usize, descriptor_capacity: usize) -> Self {
        Self {
            channels,
            ring: Mutex::new(vec![0i16; channels * frames_capacity]),
            write_index: Mutex::new(0),
            descriptors: DescriptorFifo::new(descriptor_capacity),
        }
    }

    /// Number of channels this buffer interleaves.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Ring depth in frames.
    pub fn capacity_frames(&self) -> usize {
        self.ring.lock().len() / self.channels.max(1)
    }

    /// The FIFO of write-time descriptors.
    pub fn descriptors(&self) -> &DescriptorFifo {
        &self.descriptors
    }

    /// Writes `samples` (interleaved, `samples.len() / channels()`
    /// frames) at the current write position, wrapping around the ring,
    /// tags the write with `timestamp`, and enqueues a descriptor for
    /// it.
    pub fn write(&self, samples: &[i16], timestamp: u64) {
        let channels = self.channels.max(1);
        let frame_count = samples.len() / channels;
        if frame_count == 0 {
            return;
        }

        let mut ring = self.ring.lock();
        let cap_frames = ring.len() / channels;
        let mut write_index = self.write_index.lock();
        let start = *write_index;

        for (i, frame) in samples.chunks(channels).enumerate() {
            let frame_pos = ((start as usize + i) % cap_frames) * channels;
            ring[frame_pos..frame_pos + channels].copy_from_slice(frame);
        }

        self.descriptors.enqueue(AudioBufferDesc {
            timestamp,
            buf_index: start,
            sample_count: frame_count as u32,
        });

        *write_index = start + frame_count as u64;
    }

    /// Reads `frame_count` frames starting at virtual ring position
    /// `buf_index` into `out` (interleaved), for re-assembling a
    /// previously written range named by a descriptor.
    pub fn read_at(&self, buf_index: u64, frame_count: usize, out: &mut [i16]) {
        let channels = self.channels.max(1);
        let ring = self.ring.lock();
        let cap_frames = ring.len() / channels;
        for i in 0..frame_count {
            let frame_pos = ((buf_index as usize + i) % cap_frames) * channels;
            let out_pos = i * channels;
            out[out_pos..out_pos + channels].copy_from_slice(&ring[frame_pos..frame_pos + channels]);
        }
    }

    /// Empties the descriptor FIFO and resets the write cursor to zero,
    /// used on a media-clock-restart or a receive-side epoch recovery.
    pub fn reset(&self) {
        self.descriptors.reset();
        *self.write_index.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_one_frame_range() {
        let buf = LocalAudioBuffer::new(2, 8, 4);
        buf.write(&[1, 2, 3, 4], 1000);
        let mut out = [0i16; 4];
        buf.read_at(0, 2, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buf.descriptors().peek().unwrap().sample_count, 2);
    }

    #[test]
    fn write_wraps_around_ring_capacity() {
        let buf = LocalAudioBuffer::new(1, 4, 4);
        buf.write(&[1, 2, 3, 4], 0);
        buf.write(&[5, 6], 1);
        let mut out = [0i16; 4];
        buf.read_at(0, 4, &mut out);
        assert_eq!(out, [5, 6, 3, 4]);
    }
}
