use std::fmt::{Display, Formatter};

use bytes::{BufMut, Bytes, BytesMut};

/// Address of one engine on the loopback fabric: a process-unique endpoint
/// id followed by the owning agent's name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress(Bytes);

impl EndpointAddress {
    const ID_BYTES: usize = 8;
    pub const MAX_AGENT_BYTES: usize = 255;

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() <= Self::ID_BYTES || bytes.len() > Self::ID_BYTES + Self::MAX_AGENT_BYTES {
            return None;
        }
        std::str::from_utf8(&bytes[Self::ID_BYTES..]).ok()?;
        Some(Self(Bytes::copy_from_slice(bytes)))
    }

    pub(crate) fn from_parts(endpoint_id: u64, agent: &str) -> Option<Self> {
        if agent.is_empty() || agent.len() > Self::MAX_AGENT_BYTES {
            return None;
        }
        let mut bytes = BytesMut::with_capacity(Self::ID_BYTES + agent.len());
        bytes.put_u64_le(endpoint_id);
        bytes.put_slice(agent.as_bytes());
        Some(Self(bytes.freeze()))
    }

    pub fn endpoint_id(&self) -> u64 {
        u64::from_le_bytes(
            self.0[..Self::ID_BYTES]
                .try_into()
                .expect("validated length"),
        )
    }

    pub fn agent(&self) -> &str {
        std::str::from_utf8(&self.0[Self::ID_BYTES..]).expect("validated utf-8")
    }
}

impl std::fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EndpointAddress {{ endpoint_id: {}, agent: {:?} }}",
            self.endpoint_id(),
            self.agent()
        )
    }
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.agent(), self.endpoint_id())
    }
}
