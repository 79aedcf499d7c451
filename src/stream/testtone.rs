//! # Test-Tone Generator
//!
//! A pseudo audio source: instead of draining samples written by an ALSA
//! period callback, each channel runs a small recursive oscillator and
//! the engine drives [`TestToneStream::fill`] on the same cadence a real
//! device's period interrupt would fire, writing straight into the
//! [`LocalAudioBuffer`] an `AudioStream`'s transmit side reads from. The
//! audio stream is unaware whether its samples came from hardware or
//! here.

use crate::error::{AvbError, Result};
use crate::localaudio::LocalAudioBuffer;
use std::f32::consts::PI;
use std::sync::Arc;

/// Waveform shape for one channel's generator. `File` (playback from a
/// recorded sample file) is recognized on the original but never wired
/// up here; see [`AvbError::NotImplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestToneMode {
    Sine,
    Pulse,
    SawtoothRising,
    SawtoothFalling,
}

/// Per-channel tone parameters, settable independently at any time via
/// [`TestToneStream::set_channel_params`].
#[derive(Debug, Clone, Copy)]
pub struct TestToneParams {
    pub mode: TestToneMode,
    pub signal_freq_hz: u32,
    pub level_db: i32,
    /// Duty cycle (0-100) for `Pulse`; direction (+-1) for the sawtooth
    /// variants, which is why `set_channel_params` picks the variant
    /// from its sign rather than taking `SawtoothRising`/`Falling`
    /// directly.
    pub user_param: i32,
}

impl Default for TestToneParams {
    fn default() -> Self {
        Self {
            mode: TestToneMode::Sine,
            signal_freq_hz: 1_000,
            level_db: 0,
            user_param: 0,
        }
    }
}

struct Generator {
    params: TestToneParams,
    peak: f32,
    coeff: f32,
    buf1: f32,
    buf2: f32,
}

impl Generator {
    fn new(sample_freq: u32, params: TestToneParams) -> Self {
        let mut g = Generator {
            params,
            peak: 1.0,
            coeff: 1.0,
            buf1: 1.0,
            buf2: 0.0,
        };
        g.recalc(sample_freq);
        g
    }

    fn recalc(&mut self, sample_freq: u32) {
        let sample_freq = sample_freq.max(1) as f32;
        self.peak = 10f32.powf(self.params.level_db as f32 / 20.0);
        match self.params.mode {
            TestToneMode::Sine => {
                let omega = 2.0 * PI * self.params.signal_freq_hz as f32 / sample_freq;
                self.coeff = 2.0 * omega.cos();
                self.buf1 = self.peak * omega.sin();
                self.buf2 = 0.0;
            }
            TestToneMode::Pulse => {
                self.coeff = self.params.signal_freq_hz as f32 / sample_freq;
                self.buf1 = 0.0;
                self.buf2 = 0.01 * self.params.user_param as f32;
            }
            TestToneMode::SawtoothRising | TestToneMode::SawtoothFalling => {
                self.buf2 = 2.0 * self.peak;
                self.coeff = self.buf2 * self.params.signal_freq_hz as f32 / sample_freq;
                self.buf1 = 0.0;
            }
        }
    }

    /// Advances the oscillator `num_samples` steps and writes the
    /// converted PCM16 values into `out[..num_samples]`.
    fn generate(&mut self, out: &mut [i16], num_samples: usize, gain: f32, saturate: bool) {
        match self.params.mode {
            TestToneMode::Sine => {
                for sample in out.iter_mut().take(num_samples) {
                    let tmp = self.coeff * self.buf1 - self.buf2;
                    *sample = convert(tmp, gain, saturate);
                    self.buf2 = self.buf1;
                    self.buf1 = tmp;
                }
            }
            TestToneMode::Pulse => {
                for sample in out.iter_mut().take(num_samples) {
                    let mut value = convert(self.peak, gain, saturate);
                    if self.buf1 > self.buf2 {
                        value = value.saturating_neg();
                    }
                    *sample = value;
                    self.buf1 += self.coeff;
                    if self.buf1 >= 1.0 {
                        self.buf1 -= 1.0;
                    }
                }
            }
            TestToneMode::SawtoothRising => {
                for sample in out.iter_mut().take(num_samples) {
                    *sample = convert(self.buf1, gain, saturate);
                    self.buf1 += self.coeff;
                    if self.buf1 > self.peak {
                        self.buf1 -= self.buf2;
                    }
                }
            }
            TestToneMode::SawtoothFalling => {
                for sample in out.iter_mut().take(num_samples) {
                    *sample = convert(self.buf1, gain, saturate);
                    self.buf1 -= self.coeff;
                    if self.buf1 < -self.peak {
                        self.buf1 += self.buf2;
                    }
                }
            }
        }
    }
}

fn convert(value: f32, gain: f32, saturate: bool) -> i16 {
    if saturate {
        let clamped = value.clamp(-1.0, 1.0);
        (clamped * gain) as i16
    } else {
        let scaled = value * gain;
        scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

/// A transmit-side pseudo audio stream generating test tones instead of
/// reading from a device, feeding the same [`LocalAudioBuffer`] an
/// ALSA-connected `AudioStream` would read from.
pub struct TestToneStream {
    sample_freq: u32,
    channels: Vec<Generator>,
    conversion_gain: f32,
    use_saturation: bool,
    buffer: Option<Arc<LocalAudioBuffer>>,
    local_time: u64,
}

impl TestToneStream {
    /// Builds a generator for `num_channels` channels at `sample_freq`
    /// Hz, all initialized to a silent sine tone until
    /// [`set_channel_params`](Self::set_channel_params) is called.
    pub fn new(num_channels: usize, sample_freq: u32) -> Result<Self> {
        if num_channels == 0 {
            return Err(AvbError::InvalidParam("test tone stream needs at least one channel"));
        }
        if sample_freq == 0 {
            return Err(AvbError::InvalidParam("sample frequency must be nonzero"));
        }

        let channels = (0..num_channels)
            .map(|_| Generator::new(sample_freq, TestToneParams::default()))
            .collect();

        let gain_raw = crate::config::get_u64("testtone.gain").unwrap_or(0x7FFF);
        let saturate_raw = crate::config::get_u64("testtone.saturate").unwrap_or(1);

        Ok(Self {
            sample_freq,
            channels,
            conversion_gain: gain_raw as f32,
            use_saturation: saturate_raw != 0,
            buffer: None,
            local_time: 0,
        })
    }

    /// Attaches the local buffer this stream's transmit side feeds.
    pub fn connect(&mut self, buffer: Arc<LocalAudioBuffer>) {
        self.buffer = Some(buffer);
    }

    /// Sets the parameters for one channel's oscillator. Rejects a
    /// signal frequency that would alias (must be below Nyquist), a
    /// pulse duty cycle outside 0-100, or a sawtooth direction other
    /// than +-1; `File` playback is recognized by the original format
    /// but not implemented here.
    pub fn set_channel_params(&mut self, channel: usize, mode: TestToneMode, signal_freq_hz: u32, level_db: i32, user_param: i32) -> Result<()> {
        if channel >= self.channels.len() {
            return Err(AvbError::InvalidParam("channel index out of range"));
        }
        if 2 * signal_freq_hz > self.sample_freq {
            return Err(AvbError::InvalidParam("signal frequency exceeds Nyquist"));
        }
        match mode {
            TestToneMode::Pulse if !(0..=100).contains(&user_param) => {
                return Err(AvbError::InvalidParam("pulse duty cycle must be 0-100"));
            }
            TestToneMode::SawtoothRising | TestToneMode::SawtoothFalling if user_param * user_param != 1 => {
                return Err(AvbError::InvalidParam("sawtooth direction must be +-1"));
            }
            _ => {}
        }

        let params = TestToneParams { mode, signal_freq_hz, level_db, user_param };
        self.channels[channel] = Generator::new(self.sample_freq, params);
        Ok(())
    }

    /// Number of channels this generator drives.
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Generates `frames` frames for every channel, interleaves them,
    /// and writes the result into the connected buffer tagged with
    /// `timestamp` (the local time the period "arrived" at, matching an
    /// ALSA period interrupt's role). A no-op if nothing is connected.
    pub fn fill(&mut self, frames: usize, timestamp: u64) {
        let Some(buffer) = self.buffer.clone() else {
            return;
        };
        if frames == 0 {
            return;
        }

        let channel_count = self.channels.len();
        let mut per_channel = vec![0i16; frames];
        let mut interleaved = vec![0i16; frames * channel_count];

        for (ch_idx, generator) in self.channels.iter_mut().enumerate() {
            generator.generate(&mut per_channel, frames, self.conversion_gain, self.use_saturation);
            for (frame, sample) in per_channel.iter().enumerate() {
                interleaved[frame * channel_count + ch_idx] = *sample;
            }
        }

        buffer.write(&interleaved, timestamp);
        self.local_time = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_channels() {
        assert!(matches!(TestToneStream::new(0, 48_000), Err(AvbError::InvalidParam(_))));
    }

    #[test]
    fn rejects_signal_frequency_above_nyquist() {
        let mut s = TestToneStream::new(1, 48_000).unwrap();
        let err = s.set_channel_params(0, TestToneMode::Sine, 30_000, 0, 0).unwrap_err();
        assert!(matches!(err, AvbError::InvalidParam(_)));
    }

    #[test]
    fn rejects_pulse_duty_cycle_out_of_range() {
        let mut s = TestToneStream::new(1, 48_000).unwrap();
        let err = s.set_channel_params(0, TestToneMode::Pulse, 1_000, 0, 150).unwrap_err();
        assert!(matches!(err, AvbError::InvalidParam(_)));
    }

    #[test]
    fn sine_generator_produces_bounded_samples() {
        let mut s = TestToneStream::new(1, 48_000).unwrap();
        s.set_channel_params(0, TestToneMode::Sine, 1_000, 0, 0).unwrap();
        let buffer = Arc::new(LocalAudioBuffer::new(1, 256, 8));
        s.connect(buffer.clone());
        s.fill(64, 1_000_000);
        let mut out = [0i16; 64];
        buffer.read_at(0, 64, &mut out);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn fill_without_connect_is_a_noop() {
        let mut s = TestToneStream::new(2, 48_000).unwrap();
        s.fill(64, 1);
    }
}
