//! Fragmentation header codec
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Four byte header carried in front of every IPv4 fragment:
//
//   byte0: flags[7:4] | tag[7:4]
//   byte1: tag[3:0]   | size[9:6]
//   byte2: size[5:0]  | offset[9:8]
//   byte3: offset[7:0]

pub const FRAG_HEADER_SIZE: usize = 4;

pub const SIZE_MAX: u16 = 0x3ff;
pub const OFFSET_MAX: u16 = 0x3ff;

bitflags::bitflags! {
    /// Composite frame content flags, high nibble only
    pub struct FrameFlags: u8 {
        const IPV4         = 0x80;
        const SOURCE_ROUTE = 0x40;
        const AUTH         = 0x20;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FragHeader {
    pub flags: FrameFlags,
    pub tag: u8,
    /// Total reassembled size, 10 bits
    pub size: u16,
    /// Fragment offset, 10 bits
    pub offset: u16,
}

impl FragHeader {
    pub fn encode(&self) -> [u8; FRAG_HEADER_SIZE] {
        let flags = self.flags.bits() & 0xf0;
        [
            flags | ((self.tag & 0xf0) >> 4),
            ((self.tag & 0x0f) << 4) | (((self.size >> 6) & 0x0f) as u8),
            (((self.size << 2) & 0xfc) as u8) | (((self.offset >> 8) & 0x03) as u8),
            (self.offset & 0xff) as u8,
        ]
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAG_HEADER_SIZE {
            return None;
        }

        Some(Self {
            flags: FrameFlags::from_bits_truncate(buf[0] & 0xf0),
            tag: ((buf[0] & 0x0f) << 4) | ((buf[1] & 0xf0) >> 4),
            size: (((buf[1] & 0x0f) as u16) << 6) | (((buf[2] & 0xfc) as u16) >> 2),
            offset: (((buf[2] & 0x03) as u16) << 8) | buf[3] as u16,
        })
    }
}
