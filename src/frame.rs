//! Bit-exact encode/decode of the five packet shapes used on the wire, and
//! the CRC discipline that guards four of them.
//!
//! All multi-byte fields are little-endian. Commands carry no CRC; ACK,
//! IDENTIFICATION, DATA and TRIGGER packets carry a trailing CRC-16/CCITT
//! over the entire preceding body (see [`crate::crc`]).
use byteorder::{ByteOrder, LittleEndian};

use crate::crc;
use crate::error::{FrameError, FrameResult};

/// Number of interleaved samples per channel in one DATA packet.
pub const SAMPLES_PER_PACKET: usize = 200;

/// Fixed non-channel portion of an IDENTIFICATION body, before the
/// per-channel calibration entries and the trailing CRC.
///
/// Computed field-by-field from `spec.md` §6.2 (2+2+2+1+1+4+12+2+1+1+4+2+1+1+8+30+2)
/// and cross-checked against `original_source/Plotter.py`'s
/// `struct.Struct('<HHHBBI3I HBB I HBB 8s 30s H')`, which packs to the same
/// 76 bytes with no implicit alignment padding (`<` disables it). `spec.md`
/// itself calls this "the fixed 94-byte header"; the byte-exact field list in
/// §6.2 is taken as authoritative over that rounder figure.
pub const ID_HEADER_LEN: usize = 76;

/// Size in bytes of one per-channel calibration entry trailing the
/// IDENTIFICATION header: 4 bytes unit ASCII, float32 offset, float32 gain.
pub const ID_CHANNEL_ENTRY_LEN: usize = 12;

/// Packet-type discriminator carried as the first 16-bit word of every
/// packet on the wire.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Reply to a command, echoing the command code.
    Ack = 0,
    /// Device identification record, sent in reply to GET_ID.
    Identification = 1,
    /// A chunk of interleaved channel samples.
    Data = 2,
    /// Trigger-fired notification to all registered receivers.
    Trigger = 3,
}

impl PacketType {
    /// Maps a raw wire value to a [`PacketType`], if it names one of the
    /// four known packet shapes.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Ack),
            1 => Some(Self::Identification),
            2 => Some(Self::Data),
            3 => Some(Self::Trigger),
            _ => None,
        }
    }
}

/// Encodes a command for the wire: the 32-bit command code followed by its
/// (possibly empty) payload, verbatim. Commands carry no CRC.
pub fn encode_command(code: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verifies the trailing CRC-16/CCITT of `bytes` against the CRC of the
/// preceding body and, on match, returns the body with the CRC stripped.
pub fn verify_and_strip(bytes: &[u8]) -> FrameResult<&[u8]> {
    if bytes.len() < 2 {
        return Err(FrameError::TooShort {
            need: 2,
            got: bytes.len(),
        });
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 2);
    let expected = LittleEndian::read_u16(crc_bytes);
    let computed = crc::checksum(body);
    if expected != computed {
        return Err(FrameError::Crc { expected, computed });
    }
    Ok(body)
}

/// Decodes the 4-byte DATA header and returns the packet's sequence number.
pub fn decode_data_header(body: &[u8]) -> FrameResult<u16> {
    if body.len() < 4 {
        return Err(FrameError::TooShort {
            need: 4,
            got: body.len(),
        });
    }
    let packet_type = LittleEndian::read_u16(&body[0..2]);
    if packet_type != PacketType::Data as u16 {
        return Err(FrameError::BadType {
            wanted: PacketType::Data as u16,
            got: packet_type,
        });
    }
    Ok(LittleEndian::read_u16(&body[2..4]))
}

/// Splits a verified DATA body into its per-channel samples and per-channel
/// error-count bytes, per `spec.md` §3/§6.2's layout:
/// `channels_count` blocks of 200 `i16` samples, then `channels_count`
/// error bytes, then an optional pad byte if `channels_count` is odd.
pub fn decode_data_samples(body: &[u8], channels_count: usize) -> FrameResult<(Vec<Vec<i16>>, Vec<u8>)> {
    let samples_len = channels_count * SAMPLES_PER_PACKET * 2;
    let errors_len = channels_count;
    let pad_len = if channels_count % 2 == 1 { 1 } else { 0 };
    let need = 4 + samples_len + errors_len + pad_len;
    if body.len() != need {
        return Err(FrameError::BadChannelLayout(channels_count));
    }

    let mut channels = Vec::with_capacity(channels_count);
    let mut offset = 4;
    for _ in 0..channels_count {
        let mut samples = Vec::with_capacity(SAMPLES_PER_PACKET);
        for k in 0..SAMPLES_PER_PACKET {
            let sample_off = offset + k * 2;
            samples.push(LittleEndian::read_i16(&body[sample_off..sample_off + 2]));
        }
        offset += SAMPLES_PER_PACKET * 2;
        channels.push(samples);
    }

    let errors = body[offset..offset + channels_count].to_vec();
    Ok((channels, errors))
}

/// One channel's calibration entry from an IDENTIFICATION body.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelCalibration {
    /// ASCII unit label, NUL-trimmed.
    pub unit: [u8; 4],
    pub offset: f32,
    pub gain: f32,
}

/// A decoded IDENTIFICATION body (`spec.md` §3/§6.2). `channels_count` is
/// the only field the core protocol engine consumes past this record; the
/// rest is surfaced for the benefit of the UI collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentificationRecord {
    pub state: u16,
    pub hw_id: u16,
    pub hw_major: u8,
    pub hw_minor: u8,
    pub mcu_serial: u32,
    pub cpu_uid: [u32; 3],
    pub adc_hw_id: u16,
    pub adc_major: u8,
    pub adc_minor: u8,
    pub adc_serial: u32,
    pub fw_id: u16,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_config: String,
    pub build_time: String,
    pub channels_count: u16,
    pub channels: Vec<ChannelCalibration>,
}

fn trim_ascii_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes an IDENTIFICATION body, including its trailing per-channel
/// calibration entries. Rejects bodies shorter than [`ID_HEADER_LEN`], or
/// whose length doesn't match the header plus `channels_count` calibration
/// entries.
pub fn decode_id(body: &[u8]) -> FrameResult<IdentificationRecord> {
    if body.len() < ID_HEADER_LEN {
        return Err(FrameError::TooShort {
            need: ID_HEADER_LEN,
            got: body.len(),
        });
    }
    let packet_type = LittleEndian::read_u16(&body[0..2]);
    if packet_type != PacketType::Identification as u16 {
        return Err(FrameError::BadType {
            wanted: PacketType::Identification as u16,
            got: packet_type,
        });
    }

    let state = LittleEndian::read_u16(&body[2..4]);
    let hw_id = LittleEndian::read_u16(&body[4..6]);
    let hw_major = body[6];
    let hw_minor = body[7];
    let mcu_serial = LittleEndian::read_u32(&body[8..12]);
    let cpu_uid = [
        LittleEndian::read_u32(&body[12..16]),
        LittleEndian::read_u32(&body[16..20]),
        LittleEndian::read_u32(&body[20..24]),
    ];
    let adc_hw_id = LittleEndian::read_u16(&body[24..26]);
    let adc_major = body[26];
    let adc_minor = body[27];
    let adc_serial = LittleEndian::read_u32(&body[28..32]);
    let fw_id = LittleEndian::read_u16(&body[32..34]);
    let fw_major = body[34];
    let fw_minor = body[35];
    let fw_config = trim_ascii_nul(&body[36..44]);
    let build_time = trim_ascii_nul(&body[44..74]);
    let channels_count = LittleEndian::read_u16(&body[74..76]);

    let expected_len = ID_HEADER_LEN + channels_count as usize * ID_CHANNEL_ENTRY_LEN;
    if body.len() != expected_len {
        return Err(FrameError::TooShort {
            need: expected_len,
            got: body.len(),
        });
    }

    let mut channels = Vec::with_capacity(channels_count as usize);
    let mut offset = ID_HEADER_LEN;
    for _ in 0..channels_count {
        let mut unit = [0u8; 4];
        unit.copy_from_slice(&body[offset..offset + 4]);
        let calib_offset = f32::from_le_bytes(body[offset + 4..offset + 8].try_into().unwrap());
        let gain = f32::from_le_bytes(body[offset + 8..offset + 12].try_into().unwrap());
        channels.push(ChannelCalibration {
            unit,
            offset: calib_offset,
            gain,
        });
        offset += ID_CHANNEL_ENTRY_LEN;
    }

    Ok(IdentificationRecord {
        state,
        hw_id,
        hw_major,
        hw_minor,
        mcu_serial,
        cpu_uid,
        adc_hw_id,
        adc_major,
        adc_minor,
        adc_serial,
        fw_id,
        fw_major,
        fw_minor,
        fw_config,
        build_time,
        channels_count,
        channels,
    })
}

/// A decoded TRIGGER body (`spec.md` §6.2): the sequence number in effect
/// when the trigger fired, and the sample offset within that packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerBody {
    pub packet_id: u16,
    pub sample_offset: u8,
}

/// Decodes a TRIGGER body.
pub fn decode_trigger(body: &[u8]) -> FrameResult<TriggerBody> {
    if body.len() < 5 {
        return Err(FrameError::TooShort {
            need: 5,
            got: body.len(),
        });
    }
    let packet_type = LittleEndian::read_u16(&body[0..2]);
    if packet_type != PacketType::Trigger as u16 {
        return Err(FrameError::BadType {
            wanted: PacketType::Trigger as u16,
            got: packet_type,
        });
    }
    Ok(TriggerBody {
        packet_id: LittleEndian::read_u16(&body[2..4]),
        sample_offset: body[4],
    })
}

/// A decoded ACK body (`spec.md` §6.2). ACKs carry no CRC, so callers pass
/// the raw datagram, not a `verify_and_strip`-ped body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckBody {
    pub error: u16,
    pub cmd_echo: u32,
    pub tail: Vec<u8>,
}

/// Decodes an ACK datagram: `u16 type=0 | u16 error | u32 cmd_echo | tail`.
pub fn decode_ack(bytes: &[u8]) -> FrameResult<AckBody> {
    if bytes.len() < 8 {
        return Err(FrameError::TooShort {
            need: 8,
            got: bytes.len(),
        });
    }
    let packet_type = LittleEndian::read_u16(&bytes[0..2]);
    if packet_type != PacketType::Ack as u16 {
        return Err(FrameError::BadType {
            wanted: PacketType::Ack as u16,
            got: packet_type,
        });
    }
    Ok(AckBody {
        error: LittleEndian::read_u16(&bytes[2..4]),
        cmd_echo: LittleEndian::read_u32(&bytes[4..8]),
        tail: bytes[8..].to_vec(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[test]
    fn verify_and_strip_reference_vector() {
        let datagram = [0x02, 0x00, 0x05, 0x00, 0x5F, 0xBE];
        let body = verify_and_strip(&datagram).expect("CRC should validate");
        assert_eq!(body, &[0x02, 0x00, 0x05, 0x00]);
        assert_eq!(decode_data_header(body).unwrap(), 5);
    }

    #[test]
    fn verify_and_strip_rejects_bad_crc() {
        let datagram = [0x02, 0x00, 0x05, 0x00, 0x00, 0x00];
        let err = verify_and_strip(&datagram).unwrap_err();
        assert!(matches!(err, FrameError::Crc { .. }));
    }

    #[rstest]
    #[case(vec![0u8; 1])]
    #[case(vec![])]
    fn verify_and_strip_rejects_short_input(#[case] input: Vec<u8>) {
        assert!(matches!(
            verify_and_strip(&input),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn encode_command_has_no_crc() {
        let bytes = encode_command(5, &[1, 2, 3]);
        assert_eq!(bytes, vec![5, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn decode_data_samples_roundtrip_two_channels() {
        let channels_count = 2usize;
        let mut body = vec![0u8; 4];
        LittleEndian::write_u16(&mut body[0..2], PacketType::Data as u16);
        LittleEndian::write_u16(&mut body[2..4], 7);
        for ch in 0..channels_count {
            for k in 0..SAMPLES_PER_PACKET {
                let mut buf = [0u8; 2];
                LittleEndian::write_i16(&mut buf, (ch * 1000 + k) as i16);
                body.extend_from_slice(&buf);
            }
        }
        body.extend_from_slice(&[0, 1]); // per-channel error bytes
        // channels_count is even, no pad byte.

        let (channels, errors) = decode_data_samples(&body, channels_count).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0][0], 0);
        assert_eq!(channels[1][199], 1199);
        assert_eq!(errors, vec![0, 1]);
    }

    #[test]
    fn decode_id_rejects_too_short() {
        let err = decode_id(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, FrameError::TooShort { .. }));
    }

    #[test]
    fn decode_trigger_reads_fields() {
        let mut body = vec![0u8; 5];
        LittleEndian::write_u16(&mut body[0..2], PacketType::Trigger as u16);
        LittleEndian::write_u16(&mut body[2..4], 42);
        body[4] = 17;
        let trigger = decode_trigger(&body).unwrap();
        assert_eq!(
            trigger,
            TriggerBody {
                packet_id: 42,
                sample_offset: 17
            }
        );
    }

    #[test]
    fn decode_ack_reads_fields() {
        let mut bytes = vec![0u8; 12];
        LittleEndian::write_u16(&mut bytes[0..2], PacketType::Ack as u16);
        LittleEndian::write_u16(&mut bytes[2..4], 0);
        LittleEndian::write_u32(&mut bytes[4..8], 7);
        bytes[8..12].copy_from_slice(&[1, 2, 3, 4]);
        let ack = decode_ack(&bytes).unwrap();
        assert_eq!(ack.cmd_echo, 7);
        assert_eq!(ack.tail, vec![1, 2, 3, 4]);
    }
}
