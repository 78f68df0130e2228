use bitflags::bitflags;

bitflags! {
    /// Scalar category of a register as a set of possibilities. Joins are
    /// set intersection: a register is known to be a category only if every
    /// incoming flow agrees. A constant zero starts as `ZERO` (could be an
    /// int, a float or a null reference) until context commits it.
    pub struct Scalar: u8 {
        const INT = 1 << 0;
        const FLOAT = 1 << 1;
        const OBJ = 1 << 2;
        const LONG = 1 << 3;
        const DOUBLE = 1 << 4;

        const ZERO = Self::INT.bits | Self::FLOAT.bits | Self::OBJ.bits;
        const C32 = Self::INT.bits | Self::FLOAT.bits;
        const C64 = Self::LONG.bits | Self::DOUBLE.bits;
        const ALL = Self::ZERO.bits | Self::C64.bits;
    }
}

pub const INVALID: Scalar = Scalar::empty();

impl Default for Scalar {
    fn default() -> Self {
        INVALID
    }
}

impl Scalar {
    pub fn is_wide(self) -> bool {
        self.intersects(Scalar::C64)
    }

    pub fn includes(self, rhs: Scalar) -> bool {
        self.intersects(rhs)
    }

    pub fn from_desc(desc: &str) -> Scalar {
        match desc.as_bytes()[0] {
            b'Z' | b'B' | b'C' | b'S' | b'I' => Scalar::INT,
            b'F' => Scalar::FLOAT,
            b'J' => Scalar::LONG,
            b'D' => Scalar::DOUBLE,
            b'L' | b'[' => Scalar::OBJ,
            _ => panic!("invalid descriptor {}", desc),
        }
    }

    /// Index in the i/l/f/d/a ordering most typed JVM opcodes follow.
    pub fn ilfda(self) -> u8 {
        match self {
            Scalar::INT => 0,
            Scalar::LONG => 1,
            Scalar::FLOAT => 2,
            Scalar::DOUBLE => 3,
            Scalar::OBJ => 4,
            _ => panic!("ambiguous scalar type"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_intersection() {
        assert_eq!(Scalar::ZERO & Scalar::INT, Scalar::INT);
        assert_eq!(Scalar::ZERO & Scalar::C64, INVALID);
        assert_eq!(Scalar::ALL & Scalar::DOUBLE, Scalar::DOUBLE);
    }

    #[test]
    fn wideness() {
        assert!(Scalar::LONG.is_wide());
        assert!(Scalar::DOUBLE.is_wide());
        assert!(!Scalar::INT.is_wide());
        assert!(!Scalar::ZERO.is_wide());
    }

    #[test]
    fn descriptors() {
        assert_eq!(Scalar::from_desc("I"), Scalar::INT);
        assert_eq!(Scalar::from_desc("Z"), Scalar::INT);
        assert_eq!(Scalar::from_desc("[J"), Scalar::OBJ);
        assert_eq!(Scalar::from_desc("Lfoo/Bar;"), Scalar::OBJ);
        assert_eq!(Scalar::from_desc("D"), Scalar::DOUBLE);
    }
}
