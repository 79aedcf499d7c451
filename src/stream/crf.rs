//! # Clock Reference Format (CRF) Stream
//!
//! Transmit/receive state machine for the AVTP clock-reference subtype:
//! a stream of timestamps describing a reference clock's ticks, with no
//! audio/video payload. Used either as a standalone time distribution
//! mechanism or to carry the "media clock restart" handshake an audio
//! stream's receiver watches for.

use crate::avtp::{CrfCompatibility, CrfPacket};
use crate::clock::ClockDomain;
use crate::error::{AvbError, Result};
use crate::stream::{AvbStreamBase, Direction, PacketPool, StreamState};
use crate::tspec::{StreamId, TSpec};
use parking_lot::Mutex;
use std::sync::Arc;

/// What kind of event the CRF stream's timestamps mark, carried in the
/// `type` field of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrfStreamType {
    /// Application-defined event.
    User,
    /// One timestamp per audio sample (or per N samples, see
    /// `timestamp_interval`).
    Audio,
    /// One timestamp per video frame.
    VideoFrame,
    /// One timestamp per video line.
    VideoLine,
    /// One timestamp per machine cycle.
    MachineCycle,
}

impl CrfStreamType {
    fn code(self) -> u8 {
        match self {
            CrfStreamType::User => 0,
            CrfStreamType::Audio => 1,
            CrfStreamType::VideoFrame => 2,
            CrfStreamType::VideoLine => 3,
            CrfStreamType::MachineCycle => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CrfStreamType::User),
            1 => Some(CrfStreamType::Audio),
            2 => Some(CrfStreamType::VideoFrame),
            3 => Some(CrfStreamType::VideoLine),
            4 => Some(CrfStreamType::MachineCycle),
            _ => None,
        }
    }
}

/// Clock multiplier ("pull") field. Only `Flat` (no pull) is produced or
/// accepted on receive; the others are recognized on the wire but this
/// crate has no oscillator-pull use for them (§1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMultiplier {
    Flat,
    Minus1000Ppm,
    Plus1000Ppm,
    TvToMovie,
    MovieToTv,
    OneEighth,
}

impl ClockMultiplier {
    fn code(self) -> u8 {
        match self {
            ClockMultiplier::Flat => 0,
            ClockMultiplier::Minus1000Ppm => 1,
            ClockMultiplier::Plus1000Ppm => 2,
            ClockMultiplier::TvToMovie => 3,
            ClockMultiplier::MovieToTv => 4,
            ClockMultiplier::OneEighth => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ClockMultiplier::Flat),
            1 => Some(ClockMultiplier::Minus1000Ppm),
            2 => Some(ClockMultiplier::Plus1000Ppm),
            3 => Some(ClockMultiplier::TvToMovie),
            4 => Some(ClockMultiplier::MovieToTv),
            5 => Some(ClockMultiplier::OneEighth),
            _ => None,
        }
    }
}

/// Maps a CRF d6 nominal-frequency nibble to a concrete sample rate.
fn decode_nominal_freq(field: u8) -> u32 {
    match field {
        1 => 8_000,
        2 => 16_000,
        3 => 32_000,
        4 => 44_100,
        5 => 88_200,
        6 => 176_400,
        7 => 48_000,
        8 => 96_000,
        9 => 192_000,
        _ => 0,
    }
}

/// A clock-reference stream, transmit or receive.
pub struct ClockReferenceStream {
    base: AvbStreamBase,
    compat: CrfCompatibility,
    crf_type: CrfStreamType,
    pull: ClockMultiplier,
    base_frequency: u32,
    timestamp_interval: u16,
    timestamps_per_pdu: u16,

    media_clock_restart_toggle: u8,
    ref_plane_event_count: u64,
    ref_plane_event_time: u64,
    ref_plane_event_offset: i64,
    master_count: u64,
    last_master_count: u64,
    master_time: u64,
    last_master_time: u64,
    master_timeout_ns: u64,
    master_time_update_min_interval_ns: u64,
    packet_launch_time: u64,
    sequence_number: u8,
    clock_valid: bool,
    holdoff_ns: u64,

    validation_mode: u32,
    validation_threshold: u32,
    validation_count: u32,

    packet_pool: Option<PacketPool<CrfPacket>>,
}

/// Validation stage reached by the most recent `read_from_avb_packet`
/// call, for diagnostics/tests; mirrors the original's staged-gate
/// counter (length -> subtype -> stream type -> sv/version/tu ->
/// base-frequency -> pull -> payload length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub stage_reached: u32,
    pub accepted: bool,
}

const CRF_TIMESTAMP_SIZE: usize = 8;

impl ClockReferenceStream {
    /// Builds a transmit CRF stream addressed to `dest_mac`, ticking at
    /// `base_frequency` Hz with `timestamp_interval` events between
    /// consecutive timestamps and `timestamps_per_pdu` timestamps per
    /// packet.
    #[allow(clippy::too_many_arguments)]
    pub fn init_transmit(
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        compat: CrfCompatibility,
        crf_type: CrfStreamType,
        base_frequency: u32,
        pull: ClockMultiplier,
        timestamp_interval: u16,
        timestamps_per_pdu: u16,
        clock_domain: Arc<Mutex<ClockDomain>>,
        pool_size: usize,
    ) -> Result<Self> {
        if base_frequency == 0 {
            return Err(AvbError::InvalidParam("base frequency must be nonzero"));
        }
        if timestamps_per_pdu == 0 {
            return Err(AvbError::InvalidParam("timestamps per pdu must be nonzero"));
        }

        let mut base = AvbStreamBase::new(Direction::Transmit, tspec, stream_id, dest_mac, src_mac);
        base.set_clock_domain(clock_domain);

        let template = CrfPacket::new_template(
            compat,
            dest_mac,
            src_mac,
            base.tspec().class().vlan_priority(),
            base.tspec().class().vlan_id(),
            stream_id,
            base_frequency,
            pull.code(),
            crf_type.code(),
            timestamps_per_pdu,
        );

        Ok(Self {
            base,
            compat,
            crf_type,
            pull,
            base_frequency,
            timestamp_interval,
            timestamps_per_pdu,
            media_clock_restart_toggle: 0,
            ref_plane_event_count: 0,
            ref_plane_event_time: 0,
            ref_plane_event_offset: 0,
            master_count: 0,
            last_master_count: 0,
            master_time: 0,
            last_master_time: 0,
            master_timeout_ns: crate::config::get_u64("audio.clock.timeout").unwrap_or(2_000_000_000),
            master_time_update_min_interval_ns: 0,
            packet_launch_time: 0,
            sequence_number: 0,
            clock_valid: false,
            holdoff_ns: 0,
            validation_mode: 1,
            validation_threshold: 0,
            validation_count: 0,
            packet_pool: Some(PacketPool::new(template, pool_size)),
        })
    }

    /// Builds a receive CRF stream. `holdoff_ns` gates how often an
    /// incoming timestamp is allowed to update the receive-stream clock
    /// domain, configured from `crf.rx.holdoff` (milliseconds).
    pub fn init_receive(
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        compat: CrfCompatibility,
        clock_domain: Arc<Mutex<ClockDomain>>,
    ) -> Result<Self> {
        let mut base = AvbStreamBase::new(Direction::Receive, tspec, stream_id, dest_mac, src_mac);
        base.set_clock_domain(clock_domain);

        let holdoff_ms = crate::config::get_u64("crf.rx.holdoff").unwrap_or(100);
        let validation_threshold = crate::config::get_u64("rx.validation.threshold").unwrap_or(100) as u32;

        Ok(Self {
            base,
            compat,
            crf_type: CrfStreamType::Audio,
            pull: ClockMultiplier::Flat,
            base_frequency: 0,
            timestamp_interval: 0,
            timestamps_per_pdu: 0,
            media_clock_restart_toggle: 0,
            ref_plane_event_count: 0,
            ref_plane_event_time: 0,
            ref_plane_event_offset: 0,
            master_count: 0,
            last_master_count: 0,
            master_time: 0,
            last_master_time: 0,
            master_timeout_ns: crate::config::get_u64("audio.clock.timeout").unwrap_or(2_000_000_000),
            master_time_update_min_interval_ns: 0,
            packet_launch_time: 0,
            sequence_number: 0,
            clock_valid: false,
            holdoff_ns: holdoff_ms * 1_000_000,
            validation_mode: 1,
            validation_threshold,
            validation_count: validation_threshold,
            packet_pool: None,
        })
    }

    /// The shared lifecycle state.
    pub fn base(&self) -> &AvbStreamBase {
        &self.base
    }

    /// Mutable access to the shared lifecycle state.
    pub fn base_mut(&mut self) -> &mut AvbStreamBase {
        &mut self.base
    }

    /// The wire bytes of the packet most recently filled by
    /// `write_to_avb_packet`, for a caller that hands frames to a
    /// transport. `None` on a receive stream, which owns no pool.
    pub fn last_packet_bytes(&self) -> Option<&[u8]> {
        self.packet_pool.as_ref().map(|pool| pool.last().as_bytes())
    }

    /// Resets the transmit reference plane from the current master
    /// event count/time. Returns `false` if no master clock is
    /// available yet.
    fn reset_time(&mut self, next_window_start: u64, ptp: &dyn crate::ptp::PtpProxy) -> bool {
        let clock = self.base.clock_domain().expect("activation requires a clock domain").clone();
        let mut clock = clock.lock();
        let (mut master_count, master_time) = clock.get_event_count(ptp);
        let event_rate = clock.get_event_rate();

        self.master_time = if event_rate == 0 {
            0
        } else {
            master_count = master_count * self.base_frequency as u64 / event_rate as u64;
            master_time
        };
        self.master_count = master_count;

        let ret = if self.master_time == 0 {
            self.ref_plane_event_count = 0;
            self.ref_plane_event_time = 0;
            self.packet_launch_time = next_window_start;
            false
        } else {
            self.ref_plane_event_offset = self.ref_plane_event_count as i64 - self.master_count as i64;
            self.ref_plane_event_time = self.master_time;
            self.packet_launch_time = self.ref_plane_event_time;
            true
        };

        self.last_master_count = 0;
        self.last_master_time = 0;
        ret
    }

    /// Fills the next transmit packet with `timestamps_per_pdu`
    /// consecutive reference-clock timestamps, toggling the
    /// media-clock-restart bit exactly once per unlock->lock transition,
    /// and returns the launch time for the transmit sequencer.
    pub fn write_to_avb_packet(&mut self, next_window_start: u64, ptp: &dyn crate::ptp::PtpProxy) -> Result<u64> {
        if !self.base.is_active() || self.base.direction() != Direction::Transmit {
            return Err(AvbError::NotInitialized);
        }

        if self.ref_plane_event_count == 0 && self.ref_plane_event_time == 0 {
            if !self.reset_time(next_window_start, ptp) {
                let launch = self.packet_launch_time + 10_000_000;
                self.packet_launch_time = launch;
                return Ok(launch);
            }
        }

        self.sequence_number = crate::avtp::next_sequence_number(self.sequence_number);
        let pkt = self.packet_pool.as_mut().unwrap().next_mut();
        pkt.set_sequence_number(self.sequence_number);

        let clock = self.base.clock_domain().unwrap().clone();
        {
            let mut clock = clock.lock();
            let (mut new_master_count, new_master_time) = clock.get_event_count(ptp);
            new_master_count = new_master_count * self.base_frequency as u64 / clock.get_event_rate().max(1) as u64;

            if new_master_time != self.master_time {
                if new_master_time.saturating_sub(self.master_time) > self.master_timeout_ns
                    || new_master_count <= self.master_count
                {
                    self.ref_plane_event_time = 0;
                    self.ref_plane_event_count = 0;
                    self.master_time = 0;
                } else {
                    let do_update = self.master_time_update_min_interval_ns == 0
                        || new_master_time - self.master_time >= self.master_time_update_min_interval_ns;
                    if do_update {
                        self.last_master_time = self.master_time;
                        self.master_time = new_master_time;
                        self.last_master_count = self.master_count;
                        self.master_count = new_master_count;
                    }
                }
            }

            if self.master_time != 0 {
                let event_duration = if self.last_master_time == 0 {
                    1.0e9 * clock.get_rate_ratio() / self.base_frequency as f64
                } else {
                    (self.master_time - self.last_master_time) as f64 / (self.master_count - self.last_master_count) as f64
                };

                for i in 0..self.timestamps_per_pdu as usize {
                    let delta = self.ref_plane_event_count as i64 - (self.master_count as i64 + self.ref_plane_event_offset);
                    self.ref_plane_event_time = (self.master_time as i64 + (event_duration * delta as f64) as i64) as u64;
                    self.ref_plane_event_count += self.timestamp_interval as u64;
                    let offset = self.base.presentation_time_offset_ns() as u64;
                    pkt.set_timestamp(i, self.ref_plane_event_time + offset);
                    if i == 0 {
                        self.packet_launch_time = self.ref_plane_event_time;
                    }
                }
            }

            let locked = clock.get_lock_state() == crate::clock::LockState::Locked;
            if !self.clock_valid && locked {
                self.media_clock_restart_toggle ^= 0x08;
            }
            self.clock_valid = locked;
        }

        pkt.set_media_clock_restart(self.media_clock_restart_toggle != 0);
        self.base.diagnostics_mut().frames_tx += 1;
        self.base.set_state(StreamState::Valid);

        Ok(self.packet_launch_time)
    }

    /// Validates and dispatches a received CRF frame: length, subtype,
    /// CRF stream type, sv/version/tu bits, nonzero base frequency, flat
    /// pull, and a payload length that is a positive multiple of 8.
    /// Feeds the receive clock domain per timestamp, gated by the
    /// holdoff interval and a media-clock-restart-triggered reset.
    pub fn read_from_avb_packet(&mut self, packet: &CrfPacket, ptp: &dyn crate::ptp::PtpProxy) -> ValidationOutcome {
        self.base.diagnostics_mut().frames_rx += 1;
        let was_valid = self.base.state() == StreamState::Valid;

        let outcome = self.validate(packet, was_valid);

        if outcome.accepted {
            self.sequence_number = packet.sequence_number();
            if self.validation_count > 0 {
                self.validation_count -= 1;
                if self.validation_count == 0 {
                    self.base.set_state(StreamState::Valid);
                }
            } else if was_valid {
                self.base.set_state(StreamState::Valid);
            }
        } else {
            self.base.diagnostics_mut().unsupported_format += 1;
            self.validation_count = self.validation_threshold;
            self.base.set_state(StreamState::InvalidData);
            return outcome;
        }

        if self.base.state() == StreamState::Valid {
            self.advance_receive_clock(packet, ptp);
        }

        outcome
    }

    fn validate(&self, packet: &CrfPacket, was_valid: bool) -> ValidationOutcome {
        if self.validation_mode != 2 && was_valid {
            return ValidationOutcome { stage_reached: 7, accepted: true };
        }

        let mut stage = 0;
        let expected_subtype = self.compat.subtype();
        if packet.timestamps_per_pdu() == 0 {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        if packet.subtype() != expected_subtype {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        if self.base_frequency != 0 && CrfStreamType::from_code(packet.crs_type()) != Some(self.crf_type) {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        if (packet.sv_version_byte() & 0xF1) != 0x80 {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        let base_freq = if self.compat == CrfCompatibility::D6 {
            decode_nominal_freq(packet.nominal_freq_field())
        } else {
            packet.base_frequency()
        };
        if base_freq == 0 {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        if self.compat != CrfCompatibility::D6 && ClockMultiplier::from_code(packet.pull_code()) != Some(ClockMultiplier::Flat) {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        let payload_len = packet.payload_len();
        if payload_len == 0 || payload_len % CRF_TIMESTAMP_SIZE != 0 {
            return ValidationOutcome { stage_reached: stage, accepted: false };
        }
        stage += 1;

        ValidationOutcome { stage_reached: stage, accepted: true }
    }

    fn advance_receive_clock(&mut self, packet: &CrfPacket, ptp: &dyn crate::ptp::PtpProxy) {
        let base_freq = if self.compat == CrfCompatibility::D6 {
            decode_nominal_freq(packet.nominal_freq_field())
        } else {
            packet.base_frequency()
        };
        // The wire format carries no separate "events per timestamp" field;
        // a receiver has no way to learn it except out-of-band, so it keeps
        // whatever interval it was configured with (1 if never configured).
        let events_per_stamp = if self.timestamp_interval == 0 { 1 } else { self.timestamp_interval };
        let num_stamps = packet.timestamps_per_pdu() as usize;
        if base_freq == 0 || num_stamps == 0 {
            return;
        }
        self.base_frequency = base_freq;
        self.timestamps_per_pdu = num_stamps as u16;

        let mr_field = packet.media_clock_restart_bit();
        let clock = self.base.clock_domain().unwrap().clone();
        let mut clock = clock.lock();
        let reset_requested = clock.get_reset_request();

        let mut i = 0usize;
        if mr_field != self.media_clock_restart_toggle || reset_requested || self.ref_plane_event_time == 0 {
            self.media_clock_restart_toggle = mr_field;
            let first_ts = packet.timestamp(0);
            clock.rx_stream_reset(first_ts as u32, base_freq, ptp);
            self.clock_valid = false;
            self.ref_plane_event_time = first_ts;
            self.ref_plane_event_count = 0;
            i = 1;
            self.base.diagnostics_mut().media_reset += 1;
        }

        if self.clock_valid && i < num_stamps {
            self.ref_plane_event_count += ((num_stamps - i) as u64 - 1) * events_per_stamp as u64;
            i = num_stamps - 1;
        }

        while i < num_stamps {
            let timestamp = packet.timestamp(i);
            self.ref_plane_event_count += events_per_stamp as u64;
            if !self.clock_valid || timestamp.saturating_sub(self.ref_plane_event_time) > self.holdoff_ns {
                let delta_wall_clock_ns = timestamp.saturating_sub(self.ref_plane_event_time);
                let delta_media_clock =
                    ((1_000_000_000u64 * self.ref_plane_event_count) + (base_freq as u64 / 2)) / base_freq as u64;
                clock.rx_stream_update(
                    self.ref_plane_event_count,
                    timestamp as u32,
                    delta_media_clock as u32,
                    delta_wall_clock_ns as u32,
                    ptp,
                );
                self.ref_plane_event_count = 0;
                self.ref_plane_event_time = timestamp;
            }
            i += 1;
        }

        self.clock_valid = clock.get_lock_state() == crate::clock::LockState::Locked;
        if self.clock_valid {
            self.base.diagnostics_mut().media_locked += 1;
        } else {
            self.base.diagnostics_mut().media_unlocked += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::FakePtpProxy;
    use crate::tspec::SrClass;

    fn mac(n: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, n]
    }

    #[test]
    fn init_transmit_rejects_zero_base_frequency() {
        let clock = Arc::new(Mutex::new(ClockDomain::new_ptp()));
        let tspec = TSpec::new(SrClass::High, 24, 1);
        let err = ClockReferenceStream::init_transmit(
            tspec,
            StreamId(1),
            mac(1),
            mac(2),
            CrfCompatibility::Latest,
            CrfStreamType::Audio,
            0,
            ClockMultiplier::Flat,
            8,
            6,
            clock,
            4,
        )
        .unwrap_err();
        assert!(matches!(err, AvbError::InvalidParam(_)));
    }

    #[test]
    fn p6_media_clock_restart_toggles_once_per_lock_transition() {
        let clock = Arc::new(Mutex::new(ClockDomain::new_ptp()));
        let tspec = TSpec::new(SrClass::High, 24, 1);
        let mut s = ClockReferenceStream::init_transmit(
            tspec,
            StreamId(1),
            mac(1),
            mac(2),
            CrfCompatibility::Latest,
            CrfStreamType::Audio,
            48_000,
            ClockMultiplier::Flat,
            8,
            6,
            clock,
            4,
        )
        .unwrap();
        s.base_mut().set_active(true).unwrap();
        let ptp = FakePtpProxy::new();
        ptp.set_ptp_time_ns(1);

        s.write_to_avb_packet(0, &ptp).unwrap();
        let toggled_once = s.media_clock_restart_toggle;

        ptp.set_ptp_time_ns(2);
        s.write_to_avb_packet(0, &ptp).unwrap();
        assert_eq!(s.media_clock_restart_toggle, toggled_once);
    }

    #[test]
    fn decode_nominal_freq_matches_table() {
        assert_eq!(decode_nominal_freq(7), 48_000);
        assert_eq!(decode_nominal_freq(0), 0);
    }
}
