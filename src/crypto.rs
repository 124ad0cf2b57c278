//! AES-128 primitives and message authentication
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
pub const AUTH_TAG_SIZE: usize = 12;

/// AES-XCBC-MAC-96 engine (RFC 3566) with cached subkeys
pub struct Crypto {
    k1: Aes128,
    k2: [u8; BLOCK_SIZE],
    k3: [u8; BLOCK_SIZE],
}

/// One shot AES-128 block encryption
pub fn aes128_encrypt_block(key: &[u8; KEY_SIZE], block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

impl Crypto {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let mut k1 = [0x01u8; BLOCK_SIZE];
        let mut k2 = [0x02u8; BLOCK_SIZE];
        let mut k3 = [0x03u8; BLOCK_SIZE];

        aes128_encrypt_block(key, &mut k1);
        aes128_encrypt_block(key, &mut k2);
        aes128_encrypt_block(key, &mut k3);

        Self {
            k1: Aes128::new(GenericArray::from_slice(&k1)),
            k2,
            k3,
        }
    }

    /// Authenticate the concatenation of `parts`, returning the 96 bit
    /// tag. Accepting parts avoids staging IV-prefixed messages in a
    /// scratch buffer.
    pub fn xcbc_mac_96(&self, parts: &[&[u8]]) -> [u8; AUTH_TAG_SIZE] {
        let mut e = [0u8; BLOCK_SIZE];
        let mut buf = [0u8; BLOCK_SIZE];
        let mut buf_len = 0usize;
        let mut total = 0usize;

        for part in parts {
            for byte in part.iter() {
                if buf_len == BLOCK_SIZE {
                    self.absorb(&mut e, &buf);
                    buf_len = 0;
                }
                buf[buf_len] = *byte;
                buf_len += 1;
                total += 1;
            }
        }

        // final block: complete blocks mix K2, padded blocks mix K3
        if total > 0 && buf_len == BLOCK_SIZE {
            for i in 0..BLOCK_SIZE {
                buf[i] ^= self.k2[i];
            }
        } else {
            buf[buf_len] = 0x80;
            for v in buf.iter_mut().skip(buf_len + 1) {
                *v = 0;
            }
            for i in 0..BLOCK_SIZE {
                buf[i] ^= self.k3[i];
            }
        }

        for i in 0..BLOCK_SIZE {
            e[i] ^= buf[i];
        }
        self.k1.encrypt_block(GenericArray::from_mut_slice(&mut e));

        let mut tag = [0u8; AUTH_TAG_SIZE];
        tag.copy_from_slice(&e[..AUTH_TAG_SIZE]);
        tag
    }

    fn absorb(&self, e: &mut [u8; BLOCK_SIZE], block: &[u8; BLOCK_SIZE]) {
        for i in 0..BLOCK_SIZE {
            e[i] ^= block[i];
        }
        self.k1.encrypt_block(GenericArray::from_mut_slice(e));
    }
}

/// Constant time tag comparison
pub fn tag_eq(a: &[u8; AUTH_TAG_SIZE], b: &[u8]) -> bool {
    if b.len() != AUTH_TAG_SIZE {
        return false;
    }
    let mut diff = 0u8;
    for i in 0..AUTH_TAG_SIZE {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    fn message(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    // RFC 3566 test vectors

    #[test]
    fn rfc3566_empty() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&[]]);
        assert_eq!(
            tag,
            [0x75, 0xf0, 0x25, 0x1d, 0x52, 0x8a, 0xc0, 0x1c, 0x45, 0x73, 0xdf, 0xd5]
        );
    }

    #[test]
    fn rfc3566_3_bytes() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&message(3)]);
        assert_eq!(
            tag,
            [0x5b, 0x37, 0x65, 0x80, 0xae, 0x2f, 0x19, 0xaf, 0xe7, 0x21, 0x9c, 0xee]
        );
    }

    #[test]
    fn rfc3566_16_bytes() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&message(16)]);
        assert_eq!(
            tag,
            [0xd2, 0xa2, 0x46, 0xfa, 0x34, 0x9b, 0x68, 0xa7, 0x99, 0x98, 0xa4, 0x39]
        );
    }

    #[test]
    fn rfc3566_20_bytes() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&message(20)]);
        assert_eq!(
            tag,
            [0x47, 0xf5, 0x1b, 0x45, 0x64, 0x96, 0x62, 0x15, 0xb8, 0x98, 0x5c, 0x63]
        );
    }

    #[test]
    fn rfc3566_32_bytes() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&message(32)]);
        assert_eq!(
            tag,
            [0xf5, 0x4f, 0x0e, 0xc8, 0xd2, 0xb9, 0xf3, 0xd3, 0x68, 0x07, 0x73, 0x4b]
        );
    }

    #[test]
    fn rfc3566_34_bytes() {
        let c = Crypto::new(&KEY);
        let tag = c.xcbc_mac_96(&[&message(34)]);
        assert_eq!(
            tag,
            [0xbe, 0xcb, 0xb3, 0xbc, 0xcd, 0xb5, 0x18, 0xa3, 0x06, 0x77, 0xd5, 0x48]
        );
    }

    #[test]
    fn split_parts_equivalent() {
        let c = Crypto::new(&KEY);
        let msg = message(40);

        let whole = c.xcbc_mac_96(&[&msg]);
        let split = c.xcbc_mac_96(&[&msg[..7], &msg[7..23], &msg[23..]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn deterministic_and_keyed() {
        let c = Crypto::new(&KEY);
        let msg = message(25);
        assert_eq!(c.xcbc_mac_96(&[&msg]), c.xcbc_mac_96(&[&msg]));

        let mut other_key = KEY;
        other_key[0] ^= 1;
        let other = Crypto::new(&other_key);
        assert_ne!(c.xcbc_mac_96(&[&msg]), other.xcbc_mac_96(&[&msg]));
    }

    #[test]
    fn tag_compare() {
        let tag = [1u8; 12];
        assert!(tag_eq(&tag, &[1u8; 12]));
        assert!(!tag_eq(&tag, &[2u8; 12]));
        assert!(!tag_eq(&tag, &[1u8; 11]));
    }
}
