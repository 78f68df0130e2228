use crate::jvm::scalar::Scalar;

/// Primitive element categories an array can be typed with. Boolean arrays
/// share `B` with byte arrays since the JVM uses baload/bastore for both.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElemBase {
    B,
    C,
    S,
    I,
    F,
    J,
    D,
}

/// Array element type of a register. `Null` means only null has been seen
/// on this path; `Invalid` means unknown or not a primitive-element array.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArrayType {
    Invalid,
    Null,
    Array(u8, ElemBase),
}

impl Default for ArrayType {
    fn default() -> Self {
        ArrayType::Invalid
    }
}

impl ArrayType {
    pub fn from_desc(desc: &str) -> ArrayType {
        let mut dim = 0u8;
        for byte in desc.bytes() {
            if byte == b'[' {
                dim += 1;
                continue;
            }
            if dim < 1 {
                return ArrayType::Invalid;
            }
            return match byte {
                b'Z' | b'B' => ArrayType::Array(dim, ElemBase::B),
                b'C' => ArrayType::Array(dim, ElemBase::C),
                b'S' => ArrayType::Array(dim, ElemBase::S),
                b'I' => ArrayType::Array(dim, ElemBase::I),
                b'F' => ArrayType::Array(dim, ElemBase::F),
                b'J' => ArrayType::Array(dim, ElemBase::J),
                b'D' => ArrayType::Array(dim, ElemBase::D),
                _ => ArrayType::Invalid,
            };
        }
        ArrayType::Invalid
    }

    /// Join of two flows. `Null` is the unit; disagreement gives `Invalid`.
    pub fn merge(self, rhs: Self) -> Self {
        if rhs == ArrayType::Null {
            return self;
        }
        if self == ArrayType::Null {
            return rhs;
        }
        if self == rhs {
            return self;
        }
        ArrayType::Invalid
    }

    /// Intersection used when a cast narrows a register. `Invalid` is the
    /// unit here; contradictory facts leave only null.
    pub fn narrow(self, rhs: Self) -> Self {
        if rhs == ArrayType::Invalid {
            return self;
        }
        if self == ArrayType::Invalid {
            return rhs;
        }
        if self == rhs {
            return self;
        }
        ArrayType::Null
    }

    /// Scalar and array type of an element loaded out of this array.
    pub fn elem_pair(self) -> (Scalar, ArrayType) {
        match self {
            ArrayType::Invalid => (Scalar::OBJ, self),
            // unreachable at runtime, so use (ALL, Null) which merges with anything
            ArrayType::Null => (Scalar::ALL, ArrayType::Null),
            ArrayType::Array(dim, base) => {
                if dim > 1 {
                    (Scalar::OBJ, ArrayType::Array(dim - 1, base))
                } else {
                    let st = match base {
                        ElemBase::B | ElemBase::C | ElemBase::S | ElemBase::I => Scalar::INT,
                        ElemBase::F => Scalar::FLOAT,
                        ElemBase::J => Scalar::LONG,
                        ElemBase::D => Scalar::DOUBLE,
                    };
                    (st, ArrayType::Invalid)
                }
            }
        }
    }

    pub fn to_desc(self) -> String {
        match self {
            ArrayType::Array(dim, base) => {
                let mut res = "[".repeat(dim as usize);
                res.push(match base {
                    ElemBase::B => 'B',
                    ElemBase::C => 'C',
                    ElemBase::S => 'S',
                    ElemBase::I => 'I',
                    ElemBase::F => 'F',
                    ElemBase::J => 'J',
                    ElemBase::D => 'D',
                });
                res
            }
            _ => unreachable!("only concrete array types have descriptors"),
        }
    }
}

pub const INVALID: ArrayType = ArrayType::Invalid;
pub const NULL: ArrayType = ArrayType::Null;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors() {
        assert_eq!(ArrayType::from_desc("[I"), ArrayType::Array(1, ElemBase::I));
        assert_eq!(ArrayType::from_desc("[[D"), ArrayType::Array(2, ElemBase::D));
        assert_eq!(ArrayType::from_desc("[Z"), ArrayType::Array(1, ElemBase::B));
        assert_eq!(ArrayType::from_desc("[Ljava/lang/String;"), ArrayType::Invalid);
        assert_eq!(ArrayType::from_desc("I"), ArrayType::Invalid);
    }

    #[test]
    fn merge_laws() {
        let i = ArrayType::Array(1, ElemBase::I);
        let f = ArrayType::Array(1, ElemBase::F);
        assert_eq!(i.merge(NULL), i);
        assert_eq!(NULL.merge(i), i);
        assert_eq!(i.merge(i), i);
        assert_eq!(i.merge(f), INVALID);
    }

    #[test]
    fn narrow_laws() {
        let i = ArrayType::Array(1, ElemBase::I);
        let f = ArrayType::Array(1, ElemBase::F);
        assert_eq!(i.narrow(INVALID), i);
        assert_eq!(INVALID.narrow(i), i);
        assert_eq!(i.narrow(f), NULL);
    }

    #[test]
    fn element_types() {
        let ii = ArrayType::from_desc("[[I");
        let (st, at) = ii.elem_pair();
        assert_eq!(st, Scalar::OBJ);
        assert_eq!(at, ArrayType::Array(1, ElemBase::I));

        let (st, at) = at.elem_pair();
        assert_eq!(st, Scalar::INT);
        assert_eq!(at, INVALID);
    }
}
