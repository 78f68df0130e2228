/* Big-endian output buffer for classfile serialization */

use byteorder::{BigEndian, WriteBytesExt};

#[derive(Default)]
pub struct Writer(pub Vec<u8>);

impl Writer {
    pub fn with_capacity(cap: usize) -> Writer {
        Writer(Vec::with_capacity(cap))
    }

    pub fn write(&mut self, s: &[u8]) {
        self.0.extend_from_slice(s);
    }

    pub fn u8(&mut self, x: u8) {
        self.0.push(x);
    }

    pub fn u16(&mut self, x: u16) {
        self.0.write_u16::<BigEndian>(x).unwrap();
    }

    pub fn u32(&mut self, x: u32) {
        self.0.write_u32::<BigEndian>(x).unwrap();
    }

    pub fn u64(&mut self, x: u64) {
        self.0.write_u64::<BigEndian>(x).unwrap();
    }

    pub fn i32(&mut self, x: i32) {
        self.u32(x as u32);
    }
}

// Short big-endian opcode sequences
pub fn op_u16(op: u8, x: u16) -> Vec<u8> {
    vec![op, (x >> 8) as u8, x as u8]
}

pub fn op_i16(op: u8, x: i16) -> Vec<u8> {
    op_u16(op, x as u16)
}

pub fn op_i32(op: u8, x: i32) -> Vec<u8> {
    let x = x as u32;
    vec![op, (x >> 24) as u8, (x >> 16) as u8, (x >> 8) as u8, x as u8]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_layout() {
        let mut w = Writer::default();
        w.u8(0xCA);
        w.u16(0xFEBA);
        w.u32(0xBE00_0031);
        assert_eq!(w.0, vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x31]);
    }

    #[test]
    fn op_helpers() {
        assert_eq!(op_u16(0x13, 0x1234), vec![0x13, 0x12, 0x34]);
        assert_eq!(op_i16(0xa7, -2), vec![0xa7, 0xFF, 0xFE]);
        assert_eq!(op_i32(0xc8, -2), vec![0xc8, 0xFF, 0xFF, 0xFF, 0xFE]);
    }
}
