//! Logical addresses for sources and sinks of frames.

use crate::error::CommError;
use std::fmt;
use std::str::FromStr;

/// A 128-bit endpoint identifier. Ordering is lexicographic over the four
/// components, which the derive provides given the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EndpointId {
    pub node_id: u32,
    pub proc_id: u32,
    pub port_id: u32,
    pub reserved: u32,
}

impl EndpointId {
    pub const INVALID: EndpointId = EndpointId::new(0, 0, 0);
    pub const BROADCAST: EndpointId = EndpointId {
        node_id: 0xFFFF_FFFF,
        proc_id: 0xFFFF_FFFF,
        port_id: 0xFFFF_FFFF,
        reserved: 0,
    };

    pub const fn new(node_id: u32, proc_id: u32, port_id: u32) -> EndpointId {
        EndpointId {
            node_id,
            proc_id,
            port_id,
            reserved: 0,
        }
    }

    /// Collapses node and process id into a single 64-bit id, losing the
    /// port. Inverse of [`EndpointId::from_simple`].
    pub const fn to_simple(self) -> u64 {
        ((self.node_id as u64) << 32) | self.proc_id as u64
    }

    pub const fn from_simple(simple: u64) -> EndpointId {
        EndpointId::new((simple >> 32) as u32, simple as u32, 0)
    }

    pub const fn is_broadcast(self) -> bool {
        self.node_id == 0xFFFF_FFFF
    }

    /// An id is local when its node component is unset or lies within the
    /// 127.0.0.0/8 loopback range.
    pub const fn is_local(self) -> bool {
        self.node_id == 0 || (self.node_id >> 24) == 0x7F
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.node_id, self.proc_id, self.port_id, self.reserved
        )
    }
}

impl FromStr for EndpointId {
    type Err = CommError;

    fn from_str(s: &str) -> Result<EndpointId, CommError> {
        let mut parts = s.split(':');
        let mut next = || -> Result<u32, CommError> {
            parts
                .next()
                .ok_or(CommError::Invalid)?
                .parse()
                .map_err(|_| CommError::Invalid)
        };
        let id = EndpointId {
            node_id: next()?,
            proc_id: next()?,
            port_id: next()?,
            reserved: next()?,
        };
        if parts.next().is_some() {
            return Err(CommError::Invalid);
        }
        Ok(id)
    }
}

/// Well-known `cmd_type` values. Application-defined types start at
/// [`message_types::USER_DEFINED`].
pub mod message_types {
    pub const DATA: u32 = 0x0000_0000;
    pub const ACK: u32 = 0x0000_0001;
    pub const NACK: u32 = 0x0000_0002;
    pub const HEARTBEAT: u32 = 0x0000_0003;
    pub const HELLO: u32 = 0x0000_0004;
    pub const GOODBYE: u32 = 0x0000_0005;

    pub const RPC_REQUEST: u32 = 0x0000_1000;
    pub const RPC_RESPONSE: u32 = 0x0000_1001;
    pub const RPC_ERROR: u32 = 0x0000_1002;

    pub const PUBLISH: u32 = 0x0000_2000;
    pub const SUBSCRIBE: u32 = 0x0000_2001;
    pub const UNSUBSCRIBE: u32 = 0x0000_2002;

    pub const SYSTEM_INFO: u32 = 0x0000_3000;
    pub const SYSTEM_ERROR: u32 = 0x0000_3001;

    pub const USER_DEFINED: u32 = 0x1000_0000;
}
