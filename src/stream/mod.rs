//! # AVB Stream State Machines
//!
//! The common lifecycle shared by every 1722 AVTP stream this crate
//! speaks (audio, clock-reference) plus the two concrete packet engines
//! built on top of it: [`audio::AudioStream`] and [`crf::ClockReferenceStream`].
//!
//! The original class hierarchy (`IasAvbStream` base, `IasAvbAudioStream`
//! / `IasAvbClockReferenceStream` derived) collapses here to composition:
//! each concrete stream embeds an [`AvbStreamBase`] rather than
//! inheriting from it, since Rust has no implementation inheritance and
//! the shared state (direction, activation, diagnostics, packet pool,
//! clock-domain back-reference) is the same regardless of wire format.

pub mod audio;
pub mod crf;
pub mod testtone;

use crate::clock::ClockDomain;
use crate::error::{AvbError, Result};
use crate::tspec::{StreamId, TSpec};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which direction a stream moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The stream emits packets onto the wire.
    Transmit,
    /// The stream consumes packets from the wire.
    Receive,
}

/// A stream's current data-validity state.
///
/// Receive streams progress `InvalidData -> Valid` only after
/// `validationThreshold` consecutive well-formed packets (see
/// [`audio::ValidationMode`]); any failure drops back to `InvalidData`
/// and resets the counter. `NoData` is reserved for the "nothing
/// received yet" case, distinct from "received but rejected".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet activated.
    Inactive,
    /// Activated but the most recently examined packet failed validation
    /// (or none has arrived since the last reset).
    InvalidData,
    /// Activated, transmit direction, nothing has been written yet.
    NoData,
    /// Activated and the data path is considered reliable.
    Valid,
}

/// Per-stream diagnostic counters, incremented at the sites named in
/// their doc comments and surfaced read-only for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    /// Packets successfully received and dispatched to this stream.
    pub frames_rx: u64,
    /// Packets successfully handed to the transmit sequencer.
    pub frames_tx: u64,
    /// Receive: a gap or reorder in the 8-bit sequence number while `Valid`.
    pub seq_num_mismatch: u64,
    /// Receive: the AVTP timestamp trails the local clock by more than
    /// the tolerated window.
    pub late_timestamp: u64,
    /// Receive: the AVTP timestamp leads the local clock by more than
    /// the tolerated window.
    pub early_timestamp: u64,
    /// Receive: a packet with the timestamp-valid bit set.
    pub timestamp_valid: u64,
    /// Receive: a packet without the timestamp-valid bit set.
    pub timestamp_not_valid: u64,
    /// Receive: the clock domain accepted the timestamp but flagged it
    /// as not yet trustworthy (held behind a holdoff or an epoch change).
    pub timestamp_uncertain: u64,
    /// A receive packet failed a format/subtype/length validation gate.
    pub unsupported_format: u64,
    /// The backing clock domain transitioned into `Locked`.
    pub media_locked: u64,
    /// The backing clock domain transitioned out of `Locked`.
    pub media_unlocked: u64,
    /// The stream's reference plane or receive validation state was
    /// force-reset (master-time watchdog, epoch change, media-clock
    /// restart).
    pub media_reset: u64,
    /// Activation was dropped mid-stream (link loss, disconnect).
    pub stream_interrupted: u64,
}

/// Shared lifecycle state for an AVTP stream: direction, activation,
/// stream state, owned [`TSpec`] and [`StreamId`], a non-owning
/// back-reference to its clock domain, MAC addressing, the
/// presentation-time offset, and diagnostics.
///
/// The packet pool itself is NOT stored here — it is owned by the
/// concrete stream (`Vec<AudioPacket>` / `Vec<CrfPacket>`) since its
/// element type differs per wire format; see §9's ownership note.
pub struct AvbStreamBase {
    direction: Direction,
    active: bool,
    state: StreamState,
    tspec: TSpec,
    stream_id: StreamId,
    clock_domain: Option<Arc<Mutex<ClockDomain>>>,
    dest_mac: [u8; 6],
    src_mac: [u8; 6],
    presentation_time_offset_ns: u32,
    diagnostics: Diagnostics,
}

impl AvbStreamBase {
    /// Builds a fresh base in `Inactive` state with no clock domain
    /// attached yet.
    pub fn new(
        direction: Direction,
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
    ) -> Self {
        let presentation_time_offset_ns = tspec.class().presentation_time_offset_ns();
        Self {
            direction,
            active: false,
            state: StreamState::Inactive,
            tspec,
            stream_id,
            clock_domain: None,
            dest_mac,
            src_mac,
            presentation_time_offset_ns,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Direction this stream moves data.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the stream is currently activated.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current stream-validity state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Forces the stream state, used by the concrete streams' own
    /// validation/reset logic; kept `pub(crate)` since the transition
    /// rules live in the concrete streams, not here.
    pub(crate) fn set_state(&mut self, state: StreamState) {
        self.state = state;
    }

    /// The stream's traffic specification.
    pub fn tspec(&self) -> &TSpec {
        &self.tspec
    }

    /// The stream's 64-bit identifier.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Destination MAC address for transmit, or the filter address for
    /// receive.
    pub fn dest_mac(&self) -> [u8; 6] {
        self.dest_mac
    }

    /// Source MAC address used to build outgoing frames.
    pub fn src_mac(&self) -> [u8; 6] {
        self.src_mac
    }

    /// Presentation-time offset in nanoseconds, possibly adjusted to a
    /// sample-interval multiple by the concrete stream's init path.
    pub fn presentation_time_offset_ns(&self) -> u32 {
        self.presentation_time_offset_ns
    }

    /// Overwrites the presentation-time offset; used by `AudioStream`'s
    /// transmit init to snap it to a multiple of the sample interval.
    pub(crate) fn set_presentation_time_offset_ns(&mut self, ns: u32) {
        self.presentation_time_offset_ns = ns;
    }

    /// Read-only diagnostics snapshot.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Attaches (or replaces) the backing clock domain.
    pub fn set_clock_domain(&mut self, domain: Arc<Mutex<ClockDomain>>) {
        self.clock_domain = Some(domain);
    }

    /// The backing clock domain, if one has been attached.
    pub fn clock_domain(&self) -> Option<&Arc<Mutex<ClockDomain>>> {
        self.clock_domain.as_ref()
    }

    /// Activates or deactivates the stream. Transmit streams move to
    /// `NoData` on activation (no samples written yet); receive streams
    /// move to `InvalidData` (no validated packet yet). Deactivation
    /// always returns to `Inactive` and counts as an interruption if the
    /// stream was previously `Valid`.
    pub fn set_active(&mut self, active: bool) -> Result<()> {
        if self.clock_domain.is_none() && active {
            return Err(AvbError::NotInitialized);
        }
        if active == self.active {
            return Ok(());
        }
        self.active = active;
        if active {
            self.state = match self.direction {
                Direction::Transmit => StreamState::NoData,
                Direction::Receive => StreamState::InvalidData,
            };
        } else {
            if self.state == StreamState::Valid {
                self.diagnostics.stream_interrupted += 1;
            }
            self.state = StreamState::Inactive;
        }
        Ok(())
    }
}

/// A fixed-size pool of pre-built packet templates the concrete stream
/// replicates at init time and cycles through on transmit, matching the
/// original engine's "packets are returned to the pool after
/// transmission and reusable by any producer on the stream's sequencer"
/// ownership rule (§5). No dynamic growth: running out of templates is
/// a caller bug (the pool is sized to the sequencer's pipeline depth at
/// init time), not a runtime condition to recover from.
pub struct PacketPool<T> {
    packets: Vec<T>,
    next: usize,
}

impl<T: Clone> PacketPool<T> {
    /// Replicates `template` into a pool of `count` packets.
    pub fn new(template: T, count: usize) -> Self {
        Self {
            packets: vec![template; count.max(1)],
            next: 0,
        }
    }

    /// Borrows the next packet in round-robin order for the caller to
    /// mutate in place and hand to the transmit sequencer.
    pub fn next_mut(&mut self) -> &mut T {
        let idx = self.next;
        self.next = (self.next + 1) % self.packets.len();
        &mut self.packets[idx]
    }

    /// The slot most recently returned by `next_mut`, for a caller that
    /// needs to read back what was just written (e.g. to hand the bytes
    /// to a transport) without holding onto the `&mut` borrow.
    pub fn last(&self) -> &T {
        let len = self.packets.len();
        &self.packets[(self.next + len - 1) % len]
    }

    /// Number of packet slots in the pool.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the pool holds no slots (never true after `new`, kept for
    /// API symmetry).
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tspec::SrClass;

    fn mac(n: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, n]
    }

    #[test]
    fn activation_requires_clock_domain() {
        let tspec = TSpec::new(SrClass::High, 48, 1);
        let mut base = AvbStreamBase::new(Direction::Transmit, tspec, StreamId(1), mac(1), mac(2));
        assert!(matches!(base.set_active(true), Err(AvbError::NotInitialized)));
        base.set_clock_domain(Arc::new(Mutex::new(crate::clock::ClockDomain::new_software())));
        assert!(base.set_active(true).is_ok());
        assert_eq!(base.state(), StreamState::NoData);
    }

    #[test]
    fn deactivation_from_valid_counts_as_interruption() {
        let tspec = TSpec::new(SrClass::High, 48, 1);
        let mut base = AvbStreamBase::new(Direction::Receive, tspec, StreamId(1), mac(1), mac(2));
        base.set_clock_domain(Arc::new(Mutex::new(crate::clock::ClockDomain::new_software())));
        base.set_active(true).unwrap();
        base.set_state(StreamState::Valid);
        base.set_active(false).unwrap();
        assert_eq!(base.diagnostics().stream_interrupted, 1);
        assert_eq!(base.state(), StreamState::Inactive);
    }

    #[test]
    fn packet_pool_cycles_round_robin() {
        let mut pool = PacketPool::new(0u32, 3);
        *pool.next_mut() = 10;
        *pool.next_mut() = 20;
        *pool.next_mut() = 30;
        assert_eq!(*pool.next_mut(), 10);
    }
}
