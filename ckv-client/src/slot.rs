//! Hash slot calculation.
//!
//! The key space is split into 16384 slots: `CRC16-XMODEM(tag) mod 16384`,
//! where `tag` is the non-empty substring between the first `{` and the next
//! `}`, or the whole key when there is no such substring.

/// Number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16_POLY: u16 = 0x1021;

// Lookup table built at compile time (XMODEM: poly 0x1021, init 0).
const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut idx = 0;
    while idx < 256 {
        let mut crc = (idx as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[idx] = crc;
        idx += 1;
    }
    table
}

/// CRC16-XMODEM checksum.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ byte as u16) & 0xFF;
        (crc << 8) ^ CRC16_TABLE[idx as usize]
    })
}

/// Portion of the key that is hashed.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// Slot owning `key`.
#[inline]
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}
