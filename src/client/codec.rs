//! MQTT Client Codec
//!
//! Encodes the packets a publishing client sends (CONNECT, PUBLISH, PINGREQ,
//! DISCONNECT) and decodes the ones it needs to react to (CONNACK, PUBACK,
//! PINGRESP, DISCONNECT). Every other packet type is framed and skipped.
//! MQTT v5.0 property blocks are written empty and skipped on read.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// MQTT Protocol Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1.1 (protocol level 4)
    #[serde(rename = "v311", alias = "3.1.1")]
    V311 = 4,
    /// MQTT v5.0 (protocol level 5)
    #[default]
    #[serde(rename = "v5", alias = "5.0")]
    V5 = 5,
}

/// Quality of Service levels supported for publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Packet exceeds the configured maximum
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet cannot be sent by a client
    Unsupported(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string exceeds maximum length"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::Unsupported(kind) => write!(f, "{} cannot be encoded by a client", kind),
        }
    }
}

impl std::error::Error for CodecError {}

/// CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// CONNACK packet. `code` is the v5 reason code or the v3.1.1 return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: u8,
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// PUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
    pub reason_code: u8,
}

/// DISCONNECT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    /// Any other packet type, framed but not interpreted
    Other(u8),
}

/// Read a Variable Byte Integer. Returns `Ok(None)` when more bytes are needed.
fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;

    for (pos, byte) in buf.iter().enumerate() {
        if pos >= 4 {
            return Err(CodecError::InvalidRemainingLength);
        }
        value += ((byte & 0x7F) as u32) * multiplier;
        if (byte & 0x80) == 0 {
            return Ok(Some((value, pos + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(CodecError::InvalidRemainingLength);
    }
    Ok(None)
}

fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), CodecError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(CodecError::PacketTooLarge);
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), CodecError> {
    if data.len() > 65535 {
        return Err(CodecError::StringTooLong);
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Encodes client packets
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            Packet::ConnAck(_) => Err(CodecError::Unsupported("CONNACK")),
            Packet::PubAck(_) => Err(CodecError::Unsupported("PUBACK")),
            Packet::PingResp => Err(CodecError::Unsupported("PINGRESP")),
            Packet::Other(_) => Err(CodecError::Unsupported("packet")),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), CodecError> {
        // Protocol name, level, flags, keep alive
        let mut remaining_length = 6 + 1 + 1 + 2;
        if self.is_v5() {
            remaining_length += 1;
        }
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_binary(buf, b"MQTT")?;
        buf.put_u8(self.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        if self.is_v5() {
            buf.put_u8(0x00);
        }

        write_binary(buf, packet.client_id.as_bytes())?;
        if let Some(ref username) = packet.username {
            write_binary(buf, username.as_bytes())?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), CodecError> {
        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        if self.is_v5() {
            remaining_length += 1;
        }
        remaining_length += packet.payload.len();

        buf.put_u8(0x30 | ((packet.qos as u8) << 1));
        write_variable_int(buf, remaining_length as u32)?;
        write_binary(buf, packet.topic.as_bytes())?;

        match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, _) => {}
            (_, Some(id)) if id != 0 => buf.put_u16(id),
            _ => return Err(CodecError::MalformedPacket("QoS 1 publish needs a packet id")),
        }

        if self.is_v5() {
            buf.put_u8(0x00);
        }
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_disconnect(&self, packet: &Disconnect, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(0xE0);
        if self.is_v5() && packet.reason_code != 0 {
            buf.put_u8(0x01);
            buf.put_u8(packet.reason_code);
        } else {
            buf.put_u8(0x00);
        }
        Ok(())
    }
}

/// Decodes packets sent by the broker
pub struct Decoder {
    protocol_version: ProtocolVersion,
    max_packet_size: usize,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    /// Returns `(packet, bytes_consumed)`, or `None` until a full frame is buffered.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..])? {
            Some(r) => r,
            None => return Ok(None),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(CodecError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            2 => self.decode_connack(flags, payload)?,
            4 => self.decode_puback(flags, payload)?,
            13 => {
                if flags != 0 {
                    return Err(CodecError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, payload)?,
            0 => return Err(CodecError::MalformedPacket("reserved packet type")),
            other => Packet::Other(other),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, CodecError> {
        if flags != 0 {
            return Err(CodecError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(CodecError::MalformedPacket("CONNACK too short"));
        }
        if (payload[0] & 0xFE) != 0 {
            return Err(CodecError::InvalidFlags);
        }

        Ok(Packet::ConnAck(ConnAck {
            session_present: (payload[0] & 0x01) != 0,
            code: payload[1],
        }))
    }

    fn decode_puback(&self, flags: u8, payload: &[u8]) -> Result<Packet, CodecError> {
        if flags != 0 {
            return Err(CodecError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(CodecError::MalformedPacket("PUBACK too short"));
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        let reason_code = match self.protocol_version {
            ProtocolVersion::V5 if payload.len() > 2 => payload[2],
            _ => 0,
        };

        Ok(Packet::PubAck(PubAck {
            packet_id,
            reason_code,
        }))
    }

    fn decode_disconnect(&self, flags: u8, payload: &[u8]) -> Result<Packet, CodecError> {
        if flags != 0 {
            return Err(CodecError::InvalidFlags);
        }

        let reason_code = match self.protocol_version {
            ProtocolVersion::V5 => payload.first().copied().unwrap_or(0),
            ProtocolVersion::V311 => 0,
        };

        Ok(Packet::Disconnect(Disconnect { reason_code }))
    }
}
