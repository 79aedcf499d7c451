//! # Traffic Specification and Stream Identifiers
//!
//! Per-class traffic specification tables and the 64-bit stream identifier
//! value type used as the map key for stream lookups.

use crate::config;

/// Stream-reservation class. `High` corresponds to SR class A (125 us
/// observation interval), `Low` to SR class B (250 us).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrClass {
    /// Class A, 125 us observation interval.
    High,
    /// Class B, 250 us observation interval.
    Low,
}

impl SrClass {
    fn config_suffix(self) -> &'static str {
        match self {
            SrClass::High => "high",
            SrClass::Low => "low",
        }
    }

    /// VLAN priority for this class, read from the configuration registry.
    pub fn vlan_priority(self) -> u8 {
        config::get_u64(&format!("tspec.vlanprio.{}", self.config_suffix())).unwrap_or(0) as u8
    }

    /// VLAN id for this class, read from the configuration registry.
    pub fn vlan_id(self) -> u16 {
        config::get_u64(&format!("tspec.vlanid.{}", self.config_suffix())).unwrap_or(2) as u16
    }

    /// Observation interval in nanoseconds, read from the configuration
    /// registry.
    pub fn observation_interval_ns(self) -> u64 {
        config::get_u64(&format!("tspec.interval.{}", self.config_suffix())).unwrap_or(125_000)
    }

    /// Presentation-time offset in nanoseconds, read from the
    /// configuration registry.
    pub fn presentation_time_offset_ns(self) -> u32 {
        config::get_u64(&format!("tspec.presenttime.{}", self.config_suffix())).unwrap_or(2_000_000) as u32
    }

    /// Packets per second implied by this class's observation interval.
    pub fn packets_per_second(self) -> f64 {
        let interval = self.observation_interval_ns();
        if interval == 0 {
            0.0
        } else {
            1.0e9 / interval as f64
        }
    }
}

/// Per-Layer-1-packet overhead (bytes): preamble + SFD, DMAC, SMAC, VLAN
/// tag, EtherType, CRC, interframe gap. 7 + 1 + 18 + 4 + 12 == 42.
const PACKET_OVERHEAD: u32 = 42;
/// SRP reservation overhead (bytes), not part of the wire packet itself
/// but counted for bandwidth reservation purposes.
const SRP_OVERHEAD: u32 = 1;
/// Minimum Ethernet payload size once the VLAN tag is present (64-byte
/// minimum frame minus DMAC/SMAC/VLAN/type/CRC).
const MIN_FRAME_SIZE: u32 = 42;

/// Immutable per-stream traffic specification.
#[derive(Debug, Clone, Copy)]
pub struct TSpec {
    class: SrClass,
    max_frame_size: u32,
    max_interval_frames: u32,
}

impl TSpec {
    /// Builds a new traffic specification for the given class and frame
    /// geometry.
    pub fn new(class: SrClass, max_frame_size: u32, max_interval_frames: u32) -> Self {
        Self {
            class,
            max_frame_size,
            max_interval_frames,
        }
    }

    /// The stream's reservation class.
    pub fn class(&self) -> SrClass {
        self.class
    }

    /// Maximum frame payload size in bytes, as configured.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Maximum number of frames per observation interval.
    pub fn max_interval_frames(&self) -> u32 {
        self.max_interval_frames
    }

    /// Packets per second derived from the class observation interval.
    pub fn packets_per_second(&self) -> f64 {
        self.class.packets_per_second() * self.max_interval_frames as f64
    }

    /// Required bandwidth in kbit/s, including per-packet overhead (42)
    /// and 1-byte SRP overhead, with the frame payload clamped to the
    /// 64-byte Ethernet minimum frame (42-byte minimum payload once the
    /// VLAN tag is present).
    ///
    /// Grounded in `IasAvbTSpec::getRequiredBandwidth`: the frame size is
    /// floored to the Ethernet minimum payload before the packet and SRP
    /// overheads are added, then multiplied by the per-class packet rate
    /// and converted from bytes/s to kbit/s.
    pub fn required_bandwidth_kbit_s(&self) -> f64 {
        let payload = self.max_frame_size.max(MIN_FRAME_SIZE);
        let per_packet_bytes = (payload + PACKET_OVERHEAD + SRP_OVERHEAD) as f64;
        per_packet_bytes * self.packets_per_second() * 8.0 / 1000.0
    }
}

/// A 64-bit AVTP stream identifier, convertible to/from an eight-byte
/// network-order buffer and used as the map key for stream lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Parses a stream id from an eight-byte big-endian buffer.
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Serializes the stream id as an eight-byte big-endian buffer.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl From<u64> for StreamId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_scenario_s1_class_a_2ch_48khz_6spp() {
        let tspec = TSpec::new(SrClass::High, 24 + 2 * 2 * 6, 1);
        assert_eq!(tspec.max_frame_size(), 48);
        assert_eq!(tspec.required_bandwidth_kbit_s() as u64, 5824);
    }

    #[test]
    fn bandwidth_scenario_s1_class_a_2ch_24khz_3spp() {
        let tspec = TSpec::new(SrClass::High, 24 + 2 * 2 * 3, 1);
        assert_eq!(tspec.max_frame_size(), 36);
        assert_eq!(tspec.required_bandwidth_kbit_s() as u64, 5440);
    }

    #[test]
    fn stream_id_round_trips_through_wire_bytes() {
        let id = StreamId(0x0011_2233_4455_6677);
        let bytes = id.to_be_bytes();
        assert_eq!(bytes, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(StreamId::from_be_bytes(bytes), id);
    }
}
