use crate::endpoint::EndpointAddress;

/// Remote-access descriptor for a registered DRAM region, published through
/// `get_public_data` and consumed by `load_remote_md`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionToken {
    pub(crate) endpoint_id: u64,
    pub(crate) region_key: u64,
    pub(crate) base: u64,
    pub(crate) len: u64,
    pub(crate) dev_id: u64,
}

impl RegionToken {
    const BYTES: usize = 40;

    fn to_bytes(self) -> [u8; Self::BYTES] {
        let mut bytes = [0_u8; Self::BYTES];
        bytes[..8].copy_from_slice(&self.endpoint_id.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.region_key.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.base.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.len.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.dev_id.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        Some(Self {
            endpoint_id: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            region_key: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            base: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
            len: u64::from_le_bytes(bytes[24..32].try_into().ok()?),
            dev_id: u64::from_le_bytes(bytes[32..40].try_into().ok()?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    ConnInfo = 1,
    RegionToken = 2,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::ConnInfo),
            2 => Some(Self::RegionToken),
            _ => None,
        }
    }
}

/// Blobs exchanged out of band between agents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    ConnInfo(EndpointAddress),
    RegionToken(RegionToken),
}

impl ControlMessage {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ConnInfo(_) => "conn_info",
            ControlMessage::RegionToken(_) => "region_token",
        }
    }
}

pub(crate) fn encode_message(message: &ControlMessage) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    match message {
        ControlMessage::ConnInfo(addr) => {
            bytes.push(MessageType::ConnInfo as u8);
            bytes.extend_from_slice(&addr.to_bytes());
        }
        ControlMessage::RegionToken(token) => {
            bytes.push(MessageType::RegionToken as u8);
            bytes.extend_from_slice(&token.to_bytes());
        }
    }
    bytes
}

pub(crate) fn decode_message(bytes: &[u8]) -> Option<ControlMessage> {
    let (&tag, payload) = bytes.split_first()?;
    match MessageType::from_u8(tag)? {
        MessageType::ConnInfo => Some(ControlMessage::ConnInfo(EndpointAddress::from_bytes(
            payload,
        )?)),
        MessageType::RegionToken => Some(ControlMessage::RegionToken(RegionToken::from_bytes(
            payload,
        )?)),
    }
}

/// Hex framing used for the string-typed contract fields.
pub(crate) fn to_wire_string(message: &ControlMessage) -> String {
    hex::encode(encode_message(message))
}

pub(crate) fn from_wire_string(s: &str) -> Option<ControlMessage> {
    let bytes = hex::decode(s.trim()).ok()?;
    decode_message(&bytes)
}

#[cfg(test)]
mod tests {
    use super::{
        ControlMessage, RegionToken, decode_message, encode_message, from_wire_string,
        to_wire_string,
    };
    use crate::endpoint::EndpointAddress;

    fn sample_token() -> RegionToken {
        RegionToken {
            endpoint_id: 3,
            region_key: 9,
            base: 0x7f00_0000_1000,
            len: 64,
            dev_id: 1,
        }
    }

    #[test]
    fn wire_string_roundtrip() {
        let conn = ControlMessage::ConnInfo(EndpointAddress::from_parts(5, "Agent2").expect("addr"));
        assert_eq!(from_wire_string(&to_wire_string(&conn)), Some(conn));

        let token = ControlMessage::RegionToken(sample_token());
        let wire = to_wire_string(&token);
        assert!(wire.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(from_wire_string(&wire), Some(token));
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let mut bytes = encode_message(&ControlMessage::RegionToken(sample_token()));
        bytes[0] = 99;
        assert!(decode_message(&bytes).is_none());
        assert!(decode_message(&[]).is_none());
    }

    #[test]
    fn decode_rejects_bad_payload_len() {
        let mut bytes = encode_message(&ControlMessage::RegionToken(sample_token()));
        bytes.pop();
        assert!(decode_message(&bytes).is_none());
    }

    #[test]
    fn wire_string_rejects_garbage() {
        assert!(from_wire_string("").is_none());
        assert!(from_wire_string("not-hex").is_none());
        assert!(from_wire_string("0").is_none());
    }

    #[test]
    fn kinds_are_distinct() {
        let conn = ControlMessage::ConnInfo(EndpointAddress::from_parts(1, "a").expect("addr"));
        assert_eq!(conn.kind(), "conn_info");
        assert_eq!(
            ControlMessage::RegionToken(sample_token()).kind(),
            "region_token"
        );
    }
}
