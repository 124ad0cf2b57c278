//! 802.15.4 data frame codec
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Frame layout:
//   FCF | seq | dest PAN | dest addr | source addr | protocol control |
//   [auth header] | payload | [12 byte auth tag] | FCS
//
// The protocol control byte is a non standard extension selecting the
// upper protocol and flagging authentication. The 802.15.4 security bit
// in the FCF is never set.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::AUTH_TAG_SIZE;
use crate::radio::MAX_FRAME_SIZE;

pub const FCS_SIZE: usize = 2;
pub const AUTH_HEADER_SIZE: usize = 4;

// frame control field
pub const FCF_TYPE_MASK: u16 = 0x0007;
pub const FCF_TYPE_DATA: u16 = 0x0001;
pub const FCF_ACK_REQ: u16 = 0x0020;
pub const FCF_INTRA_PAN: u16 = 0x0040;

pub const FCF_DEST_MODE_MASK: u16 = 0x0c00;
pub const FCF_DEST_SHORT: u16 = 0x0800;
pub const FCF_DEST_LONG: u16 = 0x0c00;

pub const FCF_SOURCE_MODE_MASK: u16 = 0xc000;
pub const FCF_SOURCE_SHORT: u16 = 0x8000;
pub const FCF_SOURCE_LONG: u16 = 0xc000;

// protocol control field
pub const PCF_PROTOCOL_MASK: u8 = 0x0f;
pub const PCF_AUTH: u8 = 0x80;

/// Upper protocol selector carried in the protocol control byte
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Raw,
    Ipv4,
    Neighbor,
    TimeSync,
}

impl Protocol {
    pub fn from_bits(v: u8) -> Self {
        match v & PCF_PROTOCOL_MASK {
            1 => Protocol::Ipv4,
            2 => Protocol::Neighbor,
            3 => Protocol::TimeSync,
            _ => Protocol::Raw,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Protocol::Raw => 0,
            Protocol::Ipv4 => 1,
            Protocol::Neighbor => 2,
            Protocol::TimeSync => 3,
        }
    }
}

/// MAC address field, short or extended
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    None,
    Short(u16),
    Long(u64),
}

impl Address {
    pub fn short(&self) -> u16 {
        match self {
            Address::Short(v) => *v,
            _ => 0,
        }
    }
}

/// Frame addressing. The source PAN is never transmitted, frames are
/// always intra-PAN.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddr {
    pub dest: Address,
    pub dest_pan: u16,
    pub source: Address,
}

impl MacAddr {
    /// Short-address pair within one PAN
    pub fn short(dest: u16, pan_id: u16, source: u16) -> Self {
        Self {
            dest: Address::Short(dest),
            dest_pan: pan_id,
            source: Address::Short(source),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxOptions {
    pub ack_request: bool,
    pub secure_frame: bool,
    pub protocol: Protocol,
}

/// Receive metadata handed up with each frame
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxOptions {
    pub protocol: Protocol,
    pub security_enabled: bool,
    pub lqi: u8,
    pub ed: u8,
    /// Arrival microsecond timestamp from the receive ISR
    pub timestamp: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    Truncated,
    NotData,
}

fn addr_len(addr: &Address) -> usize {
    match addr {
        Address::None => 0,
        Address::Short(_) => 2,
        Address::Long(_) => 8,
    }
}

/// MAC header + trailer length for the given addressing and options
pub fn header_len(addr: &MacAddr, options: &TxOptions) -> usize {
    // FCF, sequence, protocol control, FCS
    let mut len = 6;

    if !matches!(addr.dest, Address::None) {
        len += 2; // dest PAN
    }
    len += addr_len(&addr.dest);
    len += addr_len(&addr.source);

    if options.secure_frame {
        len += AUTH_HEADER_SIZE + AUTH_TAG_SIZE;
    }

    len
}

/// Maximum payload for a frame with the given addressing and options
pub fn max_payload(addr: &MacAddr, options: &TxOptions) -> usize {
    MAX_FRAME_SIZE - header_len(addr, options)
}

/// An encoded frame ready for signing / transmission
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Encoded {
    pub len: usize,
    /// Offset of the auth tag, when the frame is secured
    pub tag_offset: Option<usize>,
}

impl Encoded {
    /// Byte range covered by the auth tag (everything except the tag
    /// itself and the FCS)
    pub fn signed_len(&self) -> usize {
        self.len - (AUTH_TAG_SIZE + FCS_SIZE)
    }
}

/// Build a data frame into `buf`. When `secure` the auth header carries
/// `replay_counter` and the tag bytes are left zeroed for the caller to
/// sign. The FCS is zero filled, hardware replaces it on air.
pub fn encode(
    buf: &mut [u8],
    addr: &MacAddr,
    options: &TxOptions,
    seq: u8,
    replay_counter: u32,
    payload: &[u8],
) -> Result<Encoded, ()> {
    let total = header_len(addr, options) + payload.len();
    if total > MAX_FRAME_SIZE || buf.len() < total {
        return Err(());
    }

    let mut fcf = FCF_TYPE_DATA | FCF_INTRA_PAN;
    if options.ack_request {
        fcf |= FCF_ACK_REQ;
    }

    buf[2] = seq;
    let mut offset = 3;

    if !matches!(addr.dest, Address::None) {
        LittleEndian::write_u16(&mut buf[offset..], addr.dest_pan);
        offset += 2;
    }

    match addr.dest {
        Address::None => (),
        Address::Short(v) => {
            fcf |= FCF_DEST_SHORT;
            LittleEndian::write_u16(&mut buf[offset..], v);
            offset += 2;
        }
        Address::Long(v) => {
            fcf |= FCF_DEST_LONG;
            LittleEndian::write_u64(&mut buf[offset..], v);
            offset += 8;
        }
    }

    match addr.source {
        Address::None => (),
        Address::Short(v) => {
            fcf |= FCF_SOURCE_SHORT;
            LittleEndian::write_u16(&mut buf[offset..], v);
            offset += 2;
        }
        Address::Long(v) => {
            fcf |= FCF_SOURCE_LONG;
            LittleEndian::write_u64(&mut buf[offset..], v);
            offset += 8;
        }
    }

    LittleEndian::write_u16(&mut buf[..2], fcf);

    let mut pcf = options.protocol.bits();
    if options.secure_frame {
        pcf |= PCF_AUTH;
    }
    buf[offset] = pcf;
    offset += 1;

    if options.secure_frame {
        LittleEndian::write_u32(&mut buf[offset..], replay_counter);
        offset += AUTH_HEADER_SIZE;
    }

    buf[offset..offset + payload.len()].copy_from_slice(payload);
    offset += payload.len();

    let tag_offset = if options.secure_frame {
        buf[offset..offset + AUTH_TAG_SIZE].fill(0);
        let t = offset;
        offset += AUTH_TAG_SIZE;
        Some(t)
    } else {
        None
    };

    // FCS placeholder
    buf[offset] = 0;
    buf[offset + 1] = 0;
    offset += FCS_SIZE;

    debug_assert_eq!(offset, total);

    Ok(Encoded {
        len: total,
        tag_offset,
    })
}

/// A decoded frame, offsets index into the receive buffer
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Parsed {
    pub addr: MacAddr,
    pub seq: u8,
    pub protocol: Protocol,
    pub secured: bool,
    pub replay_counter: u32,
    payload_offset: usize,
    payload_len: usize,
    tag_offset: usize,
    frame_len: usize,
}

impl Parsed {
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload_offset..self.payload_offset + self.payload_len]
    }

    pub fn tag<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.tag_offset..self.tag_offset + AUTH_TAG_SIZE]
    }

    /// Byte range covered by the auth tag
    pub fn signed<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[..self.frame_len - (AUTH_TAG_SIZE + FCS_SIZE)]
    }
}

/// Parse a data frame, `buf` is the full frame including the FCS
pub fn decode(buf: &[u8]) -> Result<Parsed, DecodeError> {
    if buf.len() < 6 {
        return Err(DecodeError::Truncated);
    }

    let fcf = LittleEndian::read_u16(&buf[..2]);
    if fcf & FCF_TYPE_MASK != FCF_TYPE_DATA {
        return Err(DecodeError::NotData);
    }

    let seq = buf[2];
    let mut offset = 3;

    let need = |n: usize, offset: usize| -> Result<(), DecodeError> {
        if offset + n + FCS_SIZE > buf.len() {
            Err(DecodeError::Truncated)
        } else {
            Ok(())
        }
    };

    let mut dest_pan = 0;
    if fcf & FCF_DEST_MODE_MASK != 0 {
        need(2, offset)?;
        dest_pan = LittleEndian::read_u16(&buf[offset..]);
        offset += 2;
    }

    let dest = match fcf & FCF_DEST_MODE_MASK {
        FCF_DEST_SHORT => {
            need(2, offset)?;
            let v = LittleEndian::read_u16(&buf[offset..]);
            offset += 2;
            Address::Short(v)
        }
        FCF_DEST_LONG => {
            need(8, offset)?;
            let v = LittleEndian::read_u64(&buf[offset..]);
            offset += 8;
            Address::Long(v)
        }
        _ => Address::None,
    };

    if fcf & FCF_INTRA_PAN == 0 {
        // source PAN present, skipped
        need(2, offset)?;
        offset += 2;
    }

    let source = match fcf & FCF_SOURCE_MODE_MASK {
        FCF_SOURCE_SHORT => {
            need(2, offset)?;
            let v = LittleEndian::read_u16(&buf[offset..]);
            offset += 2;
            Address::Short(v)
        }
        FCF_SOURCE_LONG => {
            need(8, offset)?;
            let v = LittleEndian::read_u64(&buf[offset..]);
            offset += 8;
            Address::Long(v)
        }
        _ => Address::None,
    };

    need(1, offset)?;
    let pcf = buf[offset];
    offset += 1;

    let secured = pcf & PCF_AUTH != 0;
    let mut replay_counter = 0;
    if secured {
        need(AUTH_HEADER_SIZE + AUTH_TAG_SIZE, offset)?;
        replay_counter = LittleEndian::read_u32(&buf[offset..]);
        offset += AUTH_HEADER_SIZE;
    }

    let tail = if secured {
        AUTH_TAG_SIZE + FCS_SIZE
    } else {
        FCS_SIZE
    };
    if buf.len() < offset + tail {
        return Err(DecodeError::Truncated);
    }
    let payload_len = buf.len() - offset - tail;

    Ok(Parsed {
        addr: MacAddr {
            dest,
            dest_pan,
            source,
        },
        seq,
        protocol: Protocol::from_bits(pcf),
        secured,
        replay_counter,
        payload_offset: offset,
        payload_len,
        tag_offset: offset + payload_len,
        frame_len: buf.len(),
    })
}
