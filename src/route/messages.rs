//! Route control messages
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use byteorder::{ByteOrder, LittleEndian};
use smoltcp::wire::Ipv4Address;

use super::{DestFlags, RouteQuery, MAX_HOPS};

pub const PROTOCOL_VERSION: u8 = 1;

pub const MSG_TYPE_RREQ: u8 = 1;
pub const MSG_TYPE_RREP: u8 = 2;
pub const MSG_TYPE_RERR: u8 = 3;

pub const ERROR_NOT_A_ROUTER: u8 = 1;
pub const ERROR_NEXT_HOP_UNAVAILABLE: u8 = 2;

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgError {
    Truncated,
    BadVersion,
    BadType,
}

const QUERY_LEN: usize = 7;

fn encode_query(query: &RouteQuery, buf: &mut [u8]) {
    buf[..4].copy_from_slice(query.ip.as_bytes());
    LittleEndian::write_u16(&mut buf[4..], query.short_addr);
    buf[6] = query.flags.bits();
}

fn decode_query(buf: &[u8]) -> RouteQuery {
    RouteQuery {
        ip: Ipv4Address::from_bytes(&buf[..4]),
        short_addr: LittleEndian::read_u16(&buf[4..]),
        flags: DestFlags::from_bits_truncate(buf[6]),
    }
}

fn encode_hops(hops: &[u16; MAX_HOPS], buf: &mut [u8]) {
    for (i, hop) in hops.iter().enumerate() {
        LittleEndian::write_u16(&mut buf[i * 2..], *hop);
    }
}

fn decode_hops(buf: &[u8]) -> [u16; MAX_HOPS] {
    let mut hops = [0u16; MAX_HOPS];
    for (i, hop) in hops.iter_mut().enumerate() {
        *hop = LittleEndian::read_u16(&buf[i * 2..]);
    }
    hops
}

/// Route request, broadcast link-local and flooded by routers
#[derive(Clone, Debug, PartialEq)]
pub struct Rreq {
    pub flags: u8,
    pub tag: u16,
    pub query: RouteQuery,
    pub forward_cost: u16,
    pub reverse_cost: u16,
    pub hop_count: u8,
    pub hops: [u16; MAX_HOPS],
}

impl Rreq {
    pub const LEN: usize = 3 + 2 + QUERY_LEN + 2 + 2 + 1 + 2 * MAX_HOPS;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_RREQ;
        buf[1] = PROTOCOL_VERSION;
        buf[2] = self.flags;
        LittleEndian::write_u16(&mut buf[3..], self.tag);
        encode_query(&self.query, &mut buf[5..]);
        LittleEndian::write_u16(&mut buf[12..], self.forward_cost);
        LittleEndian::write_u16(&mut buf[14..], self.reverse_cost);
        buf[16] = self.hop_count;
        encode_hops(&self.hops, &mut buf[17..]);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }
        Ok(Self {
            flags: buf[2],
            tag: LittleEndian::read_u16(&buf[3..]),
            query: decode_query(&buf[5..]),
            forward_cost: LittleEndian::read_u16(&buf[12..]),
            reverse_cost: LittleEndian::read_u16(&buf[14..]),
            hop_count: buf[16],
            hops: decode_hops(&buf[17..]),
        })
    }
}

/// Route reply, unicast back along the recorded hop list
#[derive(Clone, Debug, PartialEq)]
pub struct Rrep {
    pub flags: u8,
    pub tag: u16,
    pub query: RouteQuery,
    pub forward_cost: u16,
    pub reverse_cost: u16,
    pub hop_count: u8,
    pub hop_index: u8,
    pub hops: [u16; MAX_HOPS],
}

impl Rrep {
    pub const LEN: usize = 3 + 2 + QUERY_LEN + 2 + 2 + 2 + 2 * MAX_HOPS;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_RREP;
        buf[1] = PROTOCOL_VERSION;
        buf[2] = self.flags;
        LittleEndian::write_u16(&mut buf[3..], self.tag);
        encode_query(&self.query, &mut buf[5..]);
        LittleEndian::write_u16(&mut buf[12..], self.forward_cost);
        LittleEndian::write_u16(&mut buf[14..], self.reverse_cost);
        buf[16] = self.hop_count;
        buf[17] = self.hop_index;
        encode_hops(&self.hops, &mut buf[18..]);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }
        Ok(Self {
            flags: buf[2],
            tag: LittleEndian::read_u16(&buf[3..]),
            query: decode_query(&buf[5..]),
            forward_cost: LittleEndian::read_u16(&buf[12..]),
            reverse_cost: LittleEndian::read_u16(&buf[14..]),
            hop_count: buf[16],
            hop_index: buf[17],
            hops: decode_hops(&buf[18..]),
        })
    }
}

/// Route error, unicast back along the hop list of the failed packet
#[derive(Clone, Debug, PartialEq)]
pub struct Rerr {
    pub flags: u8,
    pub error: u8,
    pub dest_ip: Ipv4Address,
    pub origin_ip: Ipv4Address,
    pub error_ip: Ipv4Address,
    pub unreachable_hop: u16,
    pub hop_count: u8,
    pub hop_index: u8,
    pub hops: [u16; MAX_HOPS],
}

impl Rerr {
    pub const LEN: usize = 4 + 4 + 4 + 4 + 2 + 2 + 2 * MAX_HOPS;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_RERR;
        buf[1] = PROTOCOL_VERSION;
        buf[2] = self.flags;
        buf[3] = self.error;
        buf[4..8].copy_from_slice(self.dest_ip.as_bytes());
        buf[8..12].copy_from_slice(self.origin_ip.as_bytes());
        buf[12..16].copy_from_slice(self.error_ip.as_bytes());
        LittleEndian::write_u16(&mut buf[16..], self.unreachable_hop);
        buf[18] = self.hop_count;
        buf[19] = self.hop_index;
        encode_hops(&self.hops, &mut buf[20..]);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < Self::LEN {
            return Err(MsgError::Truncated);
        }
        Ok(Self {
            flags: buf[2],
            error: buf[3],
            dest_ip: Ipv4Address::from_bytes(&buf[4..8]),
            origin_ip: Ipv4Address::from_bytes(&buf[8..12]),
            error_ip: Ipv4Address::from_bytes(&buf[12..16]),
            unreachable_hop: LittleEndian::read_u16(&buf[16..]),
            hop_count: buf[18],
            hop_index: buf[19],
            hops: decode_hops(&buf[20..]),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteMsg {
    Rreq(Rreq),
    Rrep(Rrep),
    Rerr(Rerr),
}

pub fn decode(buf: &[u8]) -> Result<RouteMsg, MsgError> {
    if buf.len() < 2 {
        return Err(MsgError::Truncated);
    }
    if buf[1] != PROTOCOL_VERSION {
        return Err(MsgError::BadVersion);
    }

    match buf[0] {
        MSG_TYPE_RREQ => Rreq::decode(buf).map(RouteMsg::Rreq),
        MSG_TYPE_RREP => Rrep::decode(buf).map(RouteMsg::Rrep),
        MSG_TYPE_RERR => Rerr::decode(buf).map(RouteMsg::Rerr),
        _ => Err(MsgError::BadType),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn query() -> RouteQuery {
        RouteQuery {
            ip: Ipv4Address::new(10, 0, 0, 7),
            short_addr: 0x0007,
            flags: DestFlags::IS_GATEWAY,
        }
    }

    #[test]
    fn rreq_roundtrip() {
        let mut hops = [0u16; MAX_HOPS];
        hops[0] = 1;
        hops[1] = 2;

        let rreq = Rreq {
            flags: 0,
            tag: 0xbeef,
            query: query(),
            forward_cost: 0,
            reverse_cost: 12,
            hop_count: 2,
            hops,
        };

        let mut buf = [0u8; 64];
        let n = rreq.encode(&mut buf);
        assert_eq!(n, Rreq::LEN);
        assert_eq!(decode(&buf[..n]).unwrap(), RouteMsg::Rreq(rreq));
    }

    #[test]
    fn rrep_roundtrip() {
        let mut hops = [0u16; MAX_HOPS];
        hops[..3].copy_from_slice(&[1, 2, 3]);

        let rrep = Rrep {
            flags: 0,
            tag: 7,
            query: query(),
            forward_cost: 40,
            reverse_cost: 44,
            hop_count: 3,
            hop_index: 1,
            hops,
        };

        let mut buf = [0u8; 64];
        let n = rrep.encode(&mut buf);
        assert_eq!(n, Rrep::LEN);
        assert_eq!(decode(&buf[..n]).unwrap(), RouteMsg::Rrep(rrep));
    }

    #[test]
    fn rerr_roundtrip() {
        let mut hops = [0u16; MAX_HOPS];
        hops[..3].copy_from_slice(&[1, 2, 3]);

        let rerr = Rerr {
            flags: 0,
            error: ERROR_NEXT_HOP_UNAVAILABLE,
            dest_ip: Ipv4Address::new(10, 0, 0, 3),
            origin_ip: Ipv4Address::new(10, 0, 0, 1),
            error_ip: Ipv4Address::new(10, 0, 0, 2),
            unreachable_hop: 3,
            hop_count: 3,
            hop_index: 0,
            hops,
        };

        let mut buf = [0u8; 64];
        let n = rerr.encode(&mut buf);
        assert_eq!(n, Rerr::LEN);
        assert_eq!(decode(&buf[..n]).unwrap(), RouteMsg::Rerr(rerr));
    }

    #[test]
    fn version_checked() {
        let mut buf = [0u8; 64];
        let rreq = Rreq {
            flags: 0,
            tag: 1,
            query: query(),
            forward_cost: 0,
            reverse_cost: 0,
            hop_count: 1,
            hops: [0u16; MAX_HOPS],
        };
        let n = rreq.encode(&mut buf);

        buf[1] = 2;
        assert_eq!(decode(&buf[..n]), Err(MsgError::BadVersion));
    }
}
