//! Checksums shared by the device drivers.

/// Table driven CRC-8, MSB first.
#[derive(Debug, Clone)]
pub struct Crc8 {
    table: [u8; 256],
}

impl Crc8 {
    pub const fn new(poly: u8) -> Self {
        let mut table = [0u8; 256];
        let mut i = 0;
        while i < 256 {
            let mut curr = i as u8;
            let mut bit = 0;
            while bit < 8 {
                curr = if curr & 0x80 != 0 {
                    (curr << 1) ^ poly
                } else {
                    curr << 1
                };
                bit += 1;
            }
            table[i] = curr;
            i += 1;
        }
        Self { table }
    }

    pub fn checksum(&self, bytes: &[u8]) -> u8 {
        bytes
            .iter()
            .fold(0u8, |crc, b| self.table[(crc ^ b) as usize])
    }
}

/// CRC-8 used by Medtronic command payloads.
pub const MEDTRONIC_CRC8: Crc8 = Crc8::new(0x9B);

const fn ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CCITT: [u16; 256] = ccitt_table();

/// CRC-16 CCITT (poly 0x1021) with configurable seed and final XOR.
pub fn crc16_ccitt(bytes: &[u8], init: u16, final_xor: u16) -> u16 {
    let crc = bytes.iter().fold(init, |crc, &b| {
        CCITT[((crc >> 8) as u8 ^ b) as usize] ^ (crc << 8)
    });
    crc ^ final_xor
}

/// Least significant byte of the plain byte sum.
pub fn sum_lsb(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Uppercase hex without separators, used for packet dumps and serials.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
