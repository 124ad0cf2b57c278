//! Neighbor protocol wire messages
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use byteorder::{ByteOrder, LittleEndian};
use smoltcp::wire::Ipv4Address;

use super::NeighborFlags;
use crate::crypto::AUTH_TAG_SIZE;

pub const PROTOCOL_VERSION: u8 = 1;

pub const MSG_TYPE_BEACON: u8 = 1;
pub const MSG_TYPE_FLASH: u8 = 2;
pub const MSG_TYPE_THUNDER: u8 = 3;
pub const MSG_TYPE_EVICT: u8 = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgError {
    Truncated,
    BadVersion,
    BadType,
}

/// Periodic presence announcement, also opens the four-way join when
/// the JOIN flag is set
#[derive(Clone, Debug, PartialEq)]
pub struct Beacon {
    pub flags: NeighborFlags,
    pub ip: Ipv4Address,
    pub upstream: u16,
    pub depth: u8,
    pub counter: u32,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
}

impl Beacon {
    pub const LEN: usize = 2 + 2 + 4 + 2 + 1 + 16 + 4 + AUTH_TAG_SIZE;
    pub const SIGNED_LEN: usize = Self::LEN - AUTH_TAG_SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_BEACON;
        buf[1] = PROTOCOL_VERSION;
        LittleEndian::write_u16(&mut buf[2..], self.flags.bits());
        buf[4..8].copy_from_slice(self.ip.as_bytes());
        LittleEndian::write_u16(&mut buf[8..], self.upstream);
        buf[10] = self.depth;
        buf[11..27].fill(0);
        LittleEndian::write_u32(&mut buf[27..], self.counter);
        buf[31..31 + AUTH_TAG_SIZE].copy_from_slice(&self.auth_tag);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }

        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[31..31 + AUTH_TAG_SIZE]);

        Ok(Self {
            flags: NeighborFlags::from_bits_truncate(LittleEndian::read_u16(&buf[2..])),
            ip: Ipv4Address::from_bytes(&buf[4..8]),
            upstream: LittleEndian::read_u16(&buf[8..]),
            depth: buf[10],
            counter: LittleEndian::read_u32(&buf[27..]),
            auth_tag,
        })
    }
}

/// Join challenge carrying the sender's session IV
#[derive(Clone, Debug, PartialEq)]
pub struct Flash {
    pub challenge: u64,
    pub iv: [u8; 16],
    pub auth_tag: [u8; AUTH_TAG_SIZE],
}

impl Flash {
    pub const LEN: usize = 2 + 8 + 16 + AUTH_TAG_SIZE;
    pub const SIGNED_LEN: usize = Self::LEN - AUTH_TAG_SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_FLASH;
        buf[1] = PROTOCOL_VERSION;
        LittleEndian::write_u64(&mut buf[2..], self.challenge);
        buf[10..26].copy_from_slice(&self.iv);
        buf[26..26 + AUTH_TAG_SIZE].copy_from_slice(&self.auth_tag);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[10..26]);
        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[26..26 + AUTH_TAG_SIZE]);

        Ok(Self {
            challenge: LittleEndian::read_u64(&buf[2..]),
            iv,
            auth_tag,
        })
    }
}

/// Challenge response, carries the responder's session IV and replay
/// counter
#[derive(Clone, Debug, PartialEq)]
pub struct Thunder {
    pub response: u64,
    pub iv: [u8; 16],
    pub counter: u32,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
}

impl Thunder {
    pub const LEN: usize = 2 + 8 + 16 + 4 + AUTH_TAG_SIZE;
    pub const SIGNED_LEN: usize = Self::LEN - AUTH_TAG_SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_THUNDER;
        buf[1] = PROTOCOL_VERSION;
        LittleEndian::write_u64(&mut buf[2..], self.response);
        buf[10..26].copy_from_slice(&self.iv);
        LittleEndian::write_u32(&mut buf[26..], self.counter);
        buf[30..30 + AUTH_TAG_SIZE].copy_from_slice(&self.auth_tag);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[10..26]);
        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[30..30 + AUTH_TAG_SIZE]);

        Ok(Self {
            response: LittleEndian::read_u64(&buf[2..]),
            iv,
            counter: LittleEndian::read_u32(&buf[26..]),
            auth_tag,
        })
    }
}

/// Session teardown notice
#[derive(Clone, Debug, PartialEq)]
pub struct Evict {
    pub counter: u32,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
}

impl Evict {
    pub const LEN: usize = 2 + 4 + AUTH_TAG_SIZE;
    pub const SIGNED_LEN: usize = Self::LEN - AUTH_TAG_SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_EVICT;
        buf[1] = PROTOCOL_VERSION;
        LittleEndian::write_u32(&mut buf[2..], self.counter);
        buf[6..6 + AUTH_TAG_SIZE].copy_from_slice(&self.auth_tag);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }

        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[6..6 + AUTH_TAG_SIZE]);

        Ok(Self {
            counter: LittleEndian::read_u32(&buf[2..]),
            auth_tag,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NeighborMsg {
    Beacon(Beacon),
    Flash(Flash),
    Thunder(Thunder),
    Evict(Evict),
}

/// Decode any neighbor protocol message, rejecting unknown versions
pub fn decode(buf: &[u8]) -> Result<NeighborMsg, MsgError> {
    if buf.len() < 2 {
        return Err(MsgError::Truncated);
    }
    if buf[1] != PROTOCOL_VERSION {
        return Err(MsgError::BadVersion);
    }

    match buf[0] {
        MSG_TYPE_BEACON => Beacon::decode(buf).map(NeighborMsg::Beacon),
        MSG_TYPE_FLASH => Flash::decode(buf).map(NeighborMsg::Flash),
        MSG_TYPE_THUNDER => Thunder::decode(buf).map(NeighborMsg::Thunder),
        MSG_TYPE_EVICT => Evict::decode(buf).map(NeighborMsg::Evict),
        _ => Err(MsgError::BadType),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let beacon = Beacon {
            flags: NeighborFlags::GATEWAY | NeighborFlags::TIME_SYNC,
            ip: Ipv4Address::new(10, 0, 1, 2),
            upstream: 0x1234,
            depth: 3,
            counter: 0xdeadbeef,
            auth_tag: [7u8; 12],
        };

        let mut buf = [0u8; 64];
        let n = beacon.encode(&mut buf);
        assert_eq!(n, Beacon::LEN);

        match decode(&buf[..n]).unwrap() {
            NeighborMsg::Beacon(b) => assert_eq!(b, beacon),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn flash_thunder_roundtrip() {
        let flash = Flash {
            challenge: 0x0102030405060708,
            iv: [0x11; 16],
            auth_tag: [0x22; 12],
        };
        let mut buf = [0u8; 64];
        let n = flash.encode(&mut buf);
        assert_eq!(decode(&buf[..n]).unwrap(), NeighborMsg::Flash(flash));

        let thunder = Thunder {
            response: 0x0102030405060709,
            iv: [0x33; 16],
            counter: 42,
            auth_tag: [0x44; 12],
        };
        let n = thunder.encode(&mut buf);
        assert_eq!(decode(&buf[..n]).unwrap(), NeighborMsg::Thunder(thunder));
    }

    #[test]
    fn evict_roundtrip() {
        let evict = Evict {
            counter: 9,
            auth_tag: [1u8; 12],
        };
        let mut buf = [0u8; 32];
        let n = evict.encode(&mut buf);
        assert_eq!(decode(&buf[..n]).unwrap(), NeighborMsg::Evict(evict));
    }

    #[test]
    fn version_and_type_checked() {
        let mut buf = [0u8; 64];
        let beacon = Beacon {
            flags: NeighborFlags::empty(),
            ip: Ipv4Address::UNSPECIFIED,
            upstream: 0,
            depth: 0,
            counter: 0,
            auth_tag: [0u8; 12],
        };
        let n = beacon.encode(&mut buf);

        buf[1] = 99;
        assert_eq!(decode(&buf[..n]), Err(MsgError::BadVersion));

        buf[1] = PROTOCOL_VERSION;
        buf[0] = 77;
        assert_eq!(decode(&buf[..n]), Err(MsgError::BadType));

        assert_eq!(decode(&buf[..4]), Err(MsgError::BadType));
        assert_eq!(decode(&buf[..1]), Err(MsgError::Truncated));
    }

    #[test]
    fn signed_region_excludes_tag() {
        assert_eq!(Beacon::SIGNED_LEN, Beacon::LEN - 12);
        assert_eq!(Flash::SIGNED_LEN, Flash::LEN - 12);
        assert_eq!(Thunder::SIGNED_LEN, Thunder::LEN - 12);
        assert_eq!(Evict::SIGNED_LEN, Evict::LEN - 12);
    }
}
