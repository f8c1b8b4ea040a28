use bytes::{Buf, BufMut};
use thiserror::Error;

/// Largest datagram the driver sends or expects
pub const MTU: usize = 1400;
/// Size of the embedded session token trailer
pub const TOKEN_SIZE: usize = 2;
/// Largest application payload accepted by `send`
pub const MAX_PAYLOAD_SIZE: usize = MTU - Header::SIZE - TOKEN_SIZE;

/// Flags bit 0: the payload ends with the sender's receive token
pub const FLAG_HAS_CONNECT_TOKEN: u8 = 0x01;

/// Packet Type Definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionReject = 1,
    ConnectionAccept = 2,
    Disconnect = 3,
    Data = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(PacketType::ConnectionRequest),
            1 => Ok(PacketType::ConnectionReject),
            2 => Ok(PacketType::ConnectionAccept),
            3 => Ok(PacketType::Disconnect),
            4 => Ok(PacketType::Data),
            other => Err(PacketError::InvalidType(other)),
        }
    }
}

/// Wire Header
/// Type (1) | Flags (1) | Session Token (2, little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub flags: u8,
    pub session_token: u16,
}

impl Header {
    pub const SIZE: usize = 4;

    pub fn new(packet_type: PacketType, session_token: u16) -> Self {
        Header {
            packet_type,
            flags: 0,
            session_token,
        }
    }

    pub fn with_connect_token(mut self) -> Self {
        self.flags |= FLAG_HAS_CONNECT_TOKEN;
        self
    }

    pub fn has_connect_token(&self) -> bool {
        self.flags & FLAG_HAS_CONNECT_TOKEN != 0
    }

    pub fn encode(&self, mut buf: impl BufMut) {
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.session_token);
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        self.encode(&mut raw[..]);
        raw
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < Self::SIZE {
            return Err(PacketError::Incomplete);
        }

        let packet_type = PacketType::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let session_token = buf.get_u16_le();

        Ok(Header {
            packet_type,
            flags,
            session_token,
        })
    }
}

/// Read the token trailer from the last two bytes of `payload`
pub fn read_token_trailer(payload: &[u8]) -> Result<u16, PacketError> {
    if payload.len() < TOKEN_SIZE {
        return Err(PacketError::Incomplete);
    }
    let mut tail = &payload[payload.len() - TOKEN_SIZE..];
    Ok(tail.get_u16_le())
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet data incomplete")]
    Incomplete,
    #[error("Invalid packet type: {0:#x}")]
    InvalidType(u8),
}
