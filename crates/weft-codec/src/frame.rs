use crate::error::CodecError;

pub const MAGIC: u8 = 0xaa;
pub const VERSION: u8 = 0x01;
/// magic + version + type + sequence id + body length.
pub const HEADER_LEN: usize = 11;

/// Message types carried in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Heartbeat = 0,
    MethodRequest,
    MethodResponse,
    ServiceDiscover,
    ServiceDiscoverResponse,
    ServiceRegister,
    ServiceRegisterResponse,
    SubscribeRequest,
    SubscribeResponse,
    PublishRequest,
    PublishResponse,
    ProviderAnnounce,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Heartbeat,
            1 => Self::MethodRequest,
            2 => Self::MethodResponse,
            3 => Self::ServiceDiscover,
            4 => Self::ServiceDiscoverResponse,
            5 => Self::ServiceRegister,
            6 => Self::ServiceRegisterResponse,
            7 => Self::SubscribeRequest,
            8 => Self::SubscribeResponse,
            9 => Self::PublishRequest,
            10 => Self::PublishResponse,
            11 => Self::ProviderAnnounce,
            _ => return None,
        })
    }
}

/// Decoded frame header. Sequence id and body length are big-endian on
/// the wire. Only the magic byte is validated; version is advisory and
/// unknown type bytes are kept for the dispatch layer to ignore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub ty: u8,
    pub seq_id: u32,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        if raw[0] != MAGIC {
            return Err(CodecError::BadMagic(raw[0]));
        }
        Ok(Self {
            version: raw[1],
            ty: raw[2],
            seq_id: u32::from_be_bytes([raw[3], raw[4], raw[5], raw[6]]),
            body_len: u32::from_be_bytes([raw[7], raw[8], raw[9], raw[10]]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = MAGIC;
        raw[1] = self.version;
        raw[2] = self.ty;
        raw[3..7].copy_from_slice(&self.seq_id.to_be_bytes());
        raw[7..11].copy_from_slice(&self.body_len.to_be_bytes());
        raw
    }
}

/// A single protocol message: 11-byte header plus body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub ty: u8,
    pub seq_id: u32,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(ty: MsgType, body: Vec<u8>, seq_id: u32) -> Self {
        Self { version: VERSION, ty: ty as u8, seq_id, body }
    }

    pub fn heartbeat() -> Self {
        Self::new(MsgType::Heartbeat, Vec::new(), 0)
    }

    /// `None` for type bytes this implementation does not know; the
    /// session layer drops those frames.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u8(self.ty)
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            version: self.version,
            ty: self.ty,
            seq_id: self.seq_id,
            body_len: self.body.len() as u32,
        }
    }

    pub fn from_parts(header: FrameHeader, body: Vec<u8>) -> Self {
        Self { version: header.version, ty: header.ty, seq_id: header.seq_id, body }
    }

    /// Wire image, exactly `HEADER_LEN + body.len()` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.body);
        out
    }

    /// Two-step decode of a full wire image, mirroring what a transport
    /// does with separate header and body reads.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < HEADER_LEN {
            return Err(CodecError::ShortBuffer {
                wanted: HEADER_LEN as u64,
                readable: raw.len() as u64,
            });
        }
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&raw[..HEADER_LEN]);
        let header = FrameHeader::decode(&head)?;
        let total = HEADER_LEN + header.body_len as usize;
        if raw.len() < total {
            return Err(CodecError::ShortBuffer {
                wanted: total as u64,
                readable: raw.len() as u64,
            });
        }
        Ok(Self::from_parts(header, raw[HEADER_LEN..total].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let f = Frame::new(MsgType::MethodRequest, b"payload".to_vec(), 42);
        let wire = f.encode();
        assert_eq!(wire.len(), HEADER_LEN + 7);
        assert_eq!(Frame::decode(&wire).unwrap(), f);
    }

    #[test]
    fn empty_body_roundtrip() {
        let f = Frame::heartbeat();
        let wire = f.encode();
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(Frame::decode(&wire).unwrap(), f);
    }

    #[test]
    fn header_integers_are_big_endian() {
        let f = Frame::new(MsgType::MethodResponse, Vec::new(), 0x0102_0304);
        let wire = f.encode();
        assert_eq!(&wire[3..7], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut wire = Frame::heartbeat().encode();
        wire[0] = 0xbb;
        assert!(matches!(Frame::decode(&wire), Err(CodecError::BadMagic(0xbb))));
    }

    #[test]
    fn unknown_type_is_accepted() {
        let mut wire = Frame::heartbeat().encode();
        wire[2] = 0xfe;
        let f = Frame::decode(&wire).unwrap();
        assert_eq!(f.ty, 0xfe);
        assert!(f.msg_type().is_none());
    }
}
