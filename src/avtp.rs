//! # 1722 AVTP Wire Format
//!
//! Header layout and byte-level (de)serialization for the audio and
//! clock-reference-format (CRF) subtypes this crate speaks. Every
//! packet is Ethernet + 802.1Q VLAN + AVTP, built once per stream as a
//! template and mutated in place on every transmit.

use crate::tspec::StreamId;
use bytes::BytesMut;

/// 1722 AVTP EtherType, carried inside the 802.1Q tag's payload type
/// field.
pub const ETHER_TYPE_AVTP: u16 = 0x22F0;
/// 802.1Q tag protocol identifier.
pub const ETHER_TYPE_VLAN: u16 = 0x8100;

/// AVTP subtype for SAF16 audio streams.
pub const SUBTYPE_AUDIO: u8 = 0x02;
/// AVTP subtype for the "latest" (20-byte header) clock-reference format.
pub const SUBTYPE_CRF_LATEST: u8 = 0x04;
/// AVTP subtype for the 1722a-d6 (24-byte header) clock-reference format.
pub const SUBTYPE_CRF_D6: u8 = 0x05;

/// Timestamp-valid bit, byte 1 of the AVTP common header.
pub const FLAG_TV: u8 = 0x01;
/// Sparse-timestamp bit in the audio packet-info byte: only every 8th
/// packet carries a valid timestamp.
pub const FLAG_SPARSE_TIMESTAMP: u8 = 0x10;

const MAC_LEN: usize = 6;
const VLAN_HEADER_LEN: usize = 18; // 2x MAC + VLAN tag (4) + ethertype (2)
const AUDIO_HEADER_LEN: usize = 24;
const CRF_LATEST_HEADER_LEN: usize = 20;
const CRF_D6_HEADER_LEN: usize = 24;

/// A 6-byte Ethernet MAC address.
pub type MacAddress = [u8; MAC_LEN];

/// An Ethernet + VLAN + AVTP audio packet, built once as a template per
/// stream (`AudioStream::init_transmit`) and mutated in place on every
/// send.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    buf: BytesMut,
    payload_offset: usize,
}

impl AudioPacket {
    /// Builds a fresh audio packet template addressed to `dest`/`src`
    /// with the given VLAN tag, stream id, sample-format fields, and
    /// packet-info flags. `payload_len` is the SAF16 payload capacity in
    /// bytes (`samples_per_channel_per_packet * channels * 2`).
    #[allow(clippy::too_many_arguments)]
    pub fn new_template(
        dest: MacAddress,
        src: MacAddress,
        vlan_priority: u8,
        vlan_id: u16,
        stream_id: StreamId,
        format_code: u8,
        sample_freq_code: u8,
        channels_per_frame: u8,
        bit_depth: u8,
        sparse_timestamp: bool,
        payload_len: usize,
    ) -> Self {
        let total_len = VLAN_HEADER_LEN + AUDIO_HEADER_LEN + payload_len;
        let mut buf = BytesMut::zeroed(total_len);

        buf[0..6].copy_from_slice(&dest);
        buf[6..12].copy_from_slice(&src);
        buf[12..14].copy_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        let tci = ((vlan_priority as u16 & 0x7) << 13) | (vlan_id & 0x0FFF);
        buf[14..16].copy_from_slice(&tci.to_be_bytes());
        buf[16..18].copy_from_slice(&ETHER_TYPE_AVTP.to_be_bytes());

        let header = &mut buf[VLAN_HEADER_LEN..VLAN_HEADER_LEN + AUDIO_HEADER_LEN];
        header[0] = SUBTYPE_AUDIO;
        header[1] = 0; // sv/version/mr/reset/gv/tv, tv set per packet
        header[2] = 0; // sequence number, filled per packet
        header[3] = 0; // reserved / tu, tu set per packet
        header[4..12].copy_from_slice(&stream_id.to_be_bytes());
        header[12..16].copy_from_slice(&0u32.to_be_bytes()); // avtp timestamp slot
        header[16] = format_code;
        header[17] = (sample_freq_code << 4) | (channels_per_frame & 0x0F);
        header[18] = bit_depth;
        header[19..21].copy_from_slice(&(payload_len as u16).to_be_bytes());
        header[21] = if sparse_timestamp { FLAG_SPARSE_TIMESTAMP } else { 0 };
        header[22] = 0;
        header[23] = 0;

        Self {
            buf,
            payload_offset: VLAN_HEADER_LEN + AUDIO_HEADER_LEN,
        }
    }

    /// Raw Ethernet frame bytes, ready to hand to a transmit queue.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw Ethernet frame bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[VLAN_HEADER_LEN..self.payload_offset]
    }

    fn header(&self) -> &[u8] {
        &self.buf[VLAN_HEADER_LEN..self.payload_offset]
    }

    /// Sets the 8-bit sequence number.
    pub fn set_sequence_number(&mut self, seq: u8) {
        self.header_mut()[2] = seq;
    }

    /// Reads the 8-bit sequence number.
    pub fn sequence_number(&self) -> u8 {
        self.header()[2]
    }

    /// Sets or clears the timestamp-valid bit.
    pub fn set_timestamp_valid(&mut self, valid: bool) {
        let h = self.header_mut();
        if valid {
            h[1] |= FLAG_TV;
        } else {
            h[1] &= !FLAG_TV;
        }
    }

    /// Whether the timestamp-valid bit is set.
    pub fn timestamp_valid(&self) -> bool {
        self.header()[1] & FLAG_TV != 0
    }

    /// Sets or clears the timestamp-uncertain bit (bit 0 of byte 3).
    pub fn set_timestamp_uncertain(&mut self, uncertain: bool) {
        let h = self.header_mut();
        if uncertain {
            h[3] |= 0x01;
        } else {
            h[3] &= !0x01;
        }
    }

    /// Writes the 32-bit AVTP presentation timestamp, in network byte
    /// order.
    pub fn set_timestamp(&mut self, timestamp_ns: u32) {
        self.header_mut()[12..16].copy_from_slice(&timestamp_ns.to_be_bytes());
    }

    /// Reads the 32-bit AVTP presentation timestamp.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes(self.header()[12..16].try_into().unwrap())
    }

    /// The declared data-length field (payload length in bytes).
    pub fn data_length(&self) -> u16 {
        u16::from_be_bytes(self.header()[19..21].try_into().unwrap())
    }

    /// The AVTP subtype byte.
    pub fn subtype(&self) -> u8 {
        self.header()[0]
    }

    /// The stream id carried in the header.
    pub fn stream_id(&self) -> StreamId {
        StreamId::from_be_bytes(self.header()[4..12].try_into().unwrap())
    }

    /// The sample-frequency code (high nibble of byte 17).
    pub fn sample_freq_code(&self) -> u8 {
        self.header()[17] >> 4
    }

    /// The channels-per-frame count (low nibble of byte 17).
    pub fn channels_per_frame(&self) -> u8 {
        self.header()[17] & 0x0F
    }

    /// Mutable access to the SAF16 payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let off = self.payload_offset;
        &mut self.buf[off..]
    }

    /// Read-only access to the SAF16 payload region.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset..]
    }

    /// Parses a received Ethernet frame as an audio packet, validating
    /// only that it is large enough to contain a full header; field
    /// value validation is the receive path's job.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < VLAN_HEADER_LEN + AUDIO_HEADER_LEN {
            return None;
        }
        Some(Self {
            buf: BytesMut::from(raw),
            payload_offset: VLAN_HEADER_LEN + AUDIO_HEADER_LEN,
        })
    }
}

/// Which CRF header layout a clock-reference stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrfCompatibility {
    /// 20-byte header, 0-byte payload header, subtype `0x04`.
    Latest,
    /// 24-byte header, 4-byte payload header, subtype `0x05`.
    D6,
}

impl CrfCompatibility {
    fn subtype(self) -> u8 {
        match self {
            CrfCompatibility::Latest => SUBTYPE_CRF_LATEST,
            CrfCompatibility::D6 => SUBTYPE_CRF_D6,
        }
    }

    fn header_len(self) -> usize {
        match self {
            CrfCompatibility::Latest => CRF_LATEST_HEADER_LEN,
            CrfCompatibility::D6 => CRF_D6_HEADER_LEN,
        }
    }
}

/// An Ethernet + VLAN + AVTP clock-reference (CRF) packet carrying
/// `timestamps_per_pdu` big-endian 64-bit PTP timestamps.
#[derive(Debug, Clone)]
pub struct CrfPacket {
    buf: BytesMut,
    header_len: usize,
    timestamps_per_pdu: u16,
}

impl CrfPacket {
    /// Builds a fresh CRF packet template.
    #[allow(clippy::too_many_arguments)]
    pub fn new_template(
        compat: CrfCompatibility,
        dest: MacAddress,
        src: MacAddress,
        vlan_priority: u8,
        vlan_id: u16,
        stream_id: StreamId,
        base_frequency: u32,
        pull: u8,
        crs_type: u8,
        timestamps_per_pdu: u16,
    ) -> Self {
        let header_len = compat.header_len();
        let total_len = VLAN_HEADER_LEN + header_len + (timestamps_per_pdu as usize * 8);
        let mut buf = BytesMut::zeroed(total_len);

        buf[0..6].copy_from_slice(&dest);
        buf[6..12].copy_from_slice(&src);
        buf[12..14].copy_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        let tci = ((vlan_priority as u16 & 0x7) << 13) | (vlan_id & 0x0FFF);
        buf[14..16].copy_from_slice(&tci.to_be_bytes());
        buf[16..18].copy_from_slice(&ETHER_TYPE_AVTP.to_be_bytes());

        let header = &mut buf[VLAN_HEADER_LEN..VLAN_HEADER_LEN + header_len];
        header[0] = compat.subtype();
        header[1] = 0; // sv/version/mr, mr toggled per lock transition
        header[2] = 0; // sequence number
        header[3] = 0; // reserved/type
        header[4..12].copy_from_slice(&stream_id.to_be_bytes());
        header[12] = (pull & 0x7) << 5 | ((base_frequency >> 24) as u8 & 0x1F);
        header[13] = (base_frequency >> 16) as u8;
        header[14] = (base_frequency >> 8) as u8;
        header[15] = base_frequency as u8;
        header[16..18].copy_from_slice(&timestamps_per_pdu.to_be_bytes());
        header[18] = crs_type;
        header[19] = 0;
        if header_len == CRF_D6_HEADER_LEN {
            header[20] = encode_nominal_freq(base_frequency);
            header[21..24].copy_from_slice(&[0u8; 3]);
        }

        Self {
            buf,
            header_len,
            timestamps_per_pdu,
        }
    }

    /// Raw Ethernet frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn payload_offset(&self) -> usize {
        VLAN_HEADER_LEN + self.header_len
    }

    /// Sets the 8-bit sequence number.
    pub fn set_sequence_number(&mut self, seq: u8) {
        self.buf[VLAN_HEADER_LEN + 2] = seq;
    }

    /// The stream this packet belongs to.
    pub fn stream_id(&self) -> StreamId {
        let b = VLAN_HEADER_LEN + 4;
        StreamId::from_be_bytes(self.buf[b..b + 8].try_into().unwrap())
    }

    /// Flips the media-clock-restart bit pair (bits 3-2 of byte 1).
    pub fn toggle_media_clock_restart(&mut self) {
        self.buf[VLAN_HEADER_LEN + 1] ^= 0x08;
    }

    /// Sets the media-clock-restart bit to an absolute value, for a
    /// transmit sequencer cycling through a packet pool where each slot
    /// needs the same bit value regardless of what it last held.
    pub fn set_media_clock_restart(&mut self, value: bool) {
        if value {
            self.buf[VLAN_HEADER_LEN + 1] |= 0x08;
        } else {
            self.buf[VLAN_HEADER_LEN + 1] &= !0x08;
        }
    }

    /// Writes the `i`th 64-bit timestamp slot (0-indexed) in network
    /// byte order.
    pub fn set_timestamp(&mut self, i: usize, ts: u64) {
        let off = self.payload_offset() + i * 8;
        self.buf[off..off + 8].copy_from_slice(&ts.to_be_bytes());
    }

    /// Reads the `i`th 64-bit timestamp slot.
    pub fn timestamp(&self, i: usize) -> u64 {
        let off = self.payload_offset() + i * 8;
        u64::from_be_bytes(self.buf[off..off + 8].try_into().unwrap())
    }

    /// Number of timestamps carried per PDU.
    pub fn timestamps_per_pdu(&self) -> u16 {
        self.timestamps_per_pdu
    }

    /// The AVTP subtype byte.
    pub fn subtype(&self) -> u8 {
        self.buf[VLAN_HEADER_LEN]
    }

    /// Reads the 8-bit sequence number.
    pub fn sequence_number(&self) -> u8 {
        self.buf[VLAN_HEADER_LEN + 2]
    }

    /// The sv/version/mr/reserved byte (byte 1 of the CRF header).
    pub fn sv_version_byte(&self) -> u8 {
        self.buf[VLAN_HEADER_LEN + 1]
    }

    /// The media-clock-restart bit as last written by
    /// [`Self::toggle_media_clock_restart`].
    pub fn media_clock_restart_bit(&self) -> u8 {
        self.buf[VLAN_HEADER_LEN + 1] & 0x08
    }

    /// The clock-reference stream type (byte 18).
    pub fn crs_type(&self) -> u8 {
        self.buf[VLAN_HEADER_LEN + 18]
    }

    /// The clock-multiplier ("pull") field (top 3 bits of byte 12).
    pub fn pull_code(&self) -> u8 {
        (self.buf[VLAN_HEADER_LEN + 12] >> 5) & 0x7
    }

    /// The 29-bit base frequency field spanning bytes 12-15.
    pub fn base_frequency(&self) -> u32 {
        let b = VLAN_HEADER_LEN + 12;
        (((self.buf[b] & 0x1F) as u32) << 24)
            | ((self.buf[b + 1] as u32) << 16)
            | ((self.buf[b + 2] as u32) << 8)
            | (self.buf[b + 3] as u32)
    }

    /// The d6-compatibility nominal-frequency nibble (byte 20), only
    /// meaningful when this packet uses [`CrfCompatibility::D6`].
    pub fn nominal_freq_field(&self) -> u8 {
        if self.header_len == CRF_D6_HEADER_LEN {
            self.buf[VLAN_HEADER_LEN + 20]
        } else {
            0
        }
    }

    /// Declared payload length in bytes (the timestamp slots region).
    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.payload_offset()
    }

    /// Parses a received Ethernet frame as a CRF packet of the given
    /// header layout, inferring `timestamps_per_pdu` from the remaining
    /// length; field value validation is the receive path's job.
    pub fn parse(raw: &[u8], compat: CrfCompatibility) -> Option<Self> {
        let header_len = compat.header_len();
        if raw.len() <= VLAN_HEADER_LEN + header_len {
            return None;
        }
        let payload_len = raw.len() - VLAN_HEADER_LEN - header_len;
        Some(Self {
            buf: BytesMut::from(raw),
            header_len,
            timestamps_per_pdu: (payload_len / 8) as u16,
        })
    }
}

/// Encodes a sample rate into the d6-compatibility nominal-frequency
/// nibble; inverse of the table `decode_nominal_freq` in `stream::crf`
/// reads on receive. Returns 0 (invalid) for rates the nibble cannot
/// represent.
fn encode_nominal_freq(freq: u32) -> u8 {
    match freq {
        8_000 => 1,
        16_000 => 2,
        32_000 => 3,
        44_100 => 4,
        88_200 => 5,
        176_400 => 6,
        48_000 => 7,
        96_000 => 8,
        192_000 => 9,
        _ => 0,
    }
}

/// Wraps `seq` forward by one, at 256 (the AVTP sequence-number field is
/// 8 bits).
pub fn next_sequence_number(seq: u8) -> u8 {
    seq.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        [0x02, 0x00, 0x00, 0x00, 0x00, n]
    }

    #[test]
    fn audio_template_carries_ethertype_and_subtype() {
        let pkt = AudioPacket::new_template(
            mac(1),
            mac(2),
            3,
            2,
            StreamId(0x1122_3344_5566_7788),
            0x00,
            0x3, // 48 kHz
            2,
            16,
            true,
            24,
        );
        let bytes = pkt.as_bytes();
        assert_eq!(&bytes[12..14], &ETHER_TYPE_VLAN.to_be_bytes());
        assert_eq!(&bytes[16..18], &ETHER_TYPE_AVTP.to_be_bytes());
        assert_eq!(pkt.subtype(), SUBTYPE_AUDIO);
        assert_eq!(pkt.stream_id(), StreamId(0x1122_3344_5566_7788));
        assert_eq!(pkt.channels_per_frame(), 2);
    }

    #[test]
    fn p7_sequence_number_wraps_at_256() {
        let mut seq = 250u8;
        for _ in 0..6 {
            seq = next_sequence_number(seq);
        }
        assert_eq!(seq, 0);
    }

    #[test]
    fn timestamp_valid_bit_round_trips() {
        let mut pkt = AudioPacket::new_template(mac(1), mac(2), 3, 2, StreamId(1), 0, 3, 2, 16, false, 24);
        assert!(!pkt.timestamp_valid());
        pkt.set_timestamp_valid(true);
        assert!(pkt.timestamp_valid());
        pkt.set_timestamp_valid(false);
        assert!(!pkt.timestamp_valid());
    }

    #[test]
    fn crf_template_carries_subtype_and_timestamps() {
        let mut pkt = CrfPacket::new_template(
            CrfCompatibility::Latest,
            mac(1),
            mac(2),
            3,
            2,
            StreamId(9),
            48_000,
            0,
            0,
            6,
        );
        assert_eq!(pkt.as_bytes()[VLAN_HEADER_LEN], SUBTYPE_CRF_LATEST);
        pkt.set_timestamp(0, 0x0102_0304_0506_0708);
        assert_eq!(pkt.timestamp(0), 0x0102_0304_0506_0708);
    }
}
