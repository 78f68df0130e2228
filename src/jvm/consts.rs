/* Pool-free synthesis of primitive constants */

// A precomputed table gives the cheapest bytecode sequence for every
// primitive constant expressible in three bytes or less, plus the special
// float values (negative infinity takes four bytes but is included to keep
// the synthesis code simple). For example:
//
//   128        sipush 128
//   65535      iconst_m1 i2c
//   1L         lconst_1
//   42.0f      bipush 42 i2f
//   -Inf       dconst_1 dneg dconst_0 ddiv
//
// Values outside the table are built arithmetically: ints by combining
// halves with shifts and xor, longs from int halves, floats and doubles
// from an integer mantissa scaled by powers of two. Table keys are the raw
// bit patterns; all NaN representations normalize to the all-ones pattern
// before keying so that every NaN shares one entry.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::jvm::ops::*;
use crate::jvm::scalar::Scalar;
use crate::jvm::writer::op_i16;

pub const FLOAT_SIGN: u32 = 1 << 31;
pub const FLOAT_NAN: u32 = !0;
pub const FLOAT_INF: u32 = 0xFF << 23;
pub const FLOAT_NINF: u32 = FLOAT_INF ^ FLOAT_SIGN;

pub const DOUBLE_SIGN: u64 = 1 << 63;
pub const DOUBLE_NAN: u64 = !0;
pub const DOUBLE_INF: u64 = 0x7FF << 52;
pub const DOUBLE_NINF: u64 = DOUBLE_INF ^ DOUBLE_SIGN;

fn normalize_float(x: u32) -> u32 {
    if (x | FLOAT_SIGN) > FLOAT_NINF {
        FLOAT_NAN
    } else {
        x
    }
}

fn normalize_double(x: u64) -> u64 {
    if (x | DOUBLE_SIGN) > DOUBLE_NINF {
        DOUBLE_NAN
    } else {
        x
    }
}

/// Collapses every NaN bit pattern to the canonical representative before a
/// value is used as a pool key or table key.
pub fn normalize(st: Scalar, val: u64) -> u64 {
    match st {
        Scalar::FLOAT => normalize_float(val as u32) as u64,
        Scalar::DOUBLE => normalize_double(val),
        _ => val,
    }
}

// Bit patterns of small ints as floats/doubles, for seeding the tables.
// Only exactly representable values are ever converted, so no rounding.
fn i2f_bits(x: i32) -> u32 {
    if x == 0 {
        return 0;
    }
    if x < 0 {
        return i2f_bits(-x) ^ FLOAT_SIGN;
    }
    let x = x as u32;
    let shift = x.leading_zeros() - 8;
    let exponent = shift + 127;
    (exponent << 23) | (x << shift)
}

fn i2d_bits(x: i32) -> u64 {
    if x == 0 {
        return 0;
    }
    if x < 0 {
        return i2d_bits(-x) ^ DOUBLE_SIGN;
    }
    let x = x as u64;
    let shift = x.leading_zeros() as u64 - 11;
    let exponent = shift + 1023;
    (exponent << 52) | (x << shift)
}

fn add_if_shorter<K: std::hash::Hash + Eq>(d: &mut FxHashMap<K, Vec<u8>>, k: K, v: Vec<u8>) {
    match d.get(&k) {
        Some(cur) if cur.len() <= v.len() => {}
        _ => {
            d.insert(k, v);
        }
    }
}

fn concat(s1: &[u8], s2: &[u8]) -> Vec<u8> {
    let mut t = s1.to_vec();
    t.extend_from_slice(s2);
    t
}

struct Tables {
    ints: FxHashMap<i32, Vec<u8>>,
    floats: FxHashMap<u32, Vec<u8>>,
    longs: FxHashMap<i64, Vec<u8>>,
    doubles: FxHashMap<u64, Vec<u8>>,
}

fn build_tables() -> Tables {
    let mut ints: FxHashMap<i32, Vec<u8>> = FxHashMap::default();

    // one byte
    for i in -1i32..6 {
        ints.insert(i, vec![(i + ICONST_0 as i32) as u8]);
    }
    let int_1s = -1i32..6;

    // two bytes
    for i in -128i32..128 {
        add_if_shorter(&mut ints, i, vec![BIPUSH, i as u8]);
    }
    ints.insert(65535, vec![ICONST_M1, I2C]);
    // sorted for determinism, otherwise -0x80000000 could come out as either
    // 1 << -1 or -1 << -1
    let int_2s = {
        let mut t: Vec<_> = ints.iter().filter(|(_, v)| v.len() == 2).map(|(k, _)| *k).collect();
        t.sort_unstable();
        t
    };

    // three bytes
    for i in -32768i32..32768 {
        add_if_shorter(&mut ints, i, op_i16(SIPUSH, i as i16));
    }
    for &i in &int_2s {
        let val = concat(&ints[&i], &[I2C]);
        add_if_shorter(&mut ints, i as u16 as i32, val);
        let val = concat(&ints[&i], &[INEG]);
        add_if_shorter(&mut ints, i.wrapping_neg(), val);
    }
    for x in int_1s.clone() {
        for y in int_1s.clone() {
            let xy = concat(&ints[&x], &ints[&y]);
            add_if_shorter(&mut ints, x.wrapping_shl(y as u32), concat(&xy, &[ISHL]));
            add_if_shorter(&mut ints, x.wrapping_shr(y as u32), concat(&xy, &[ISHR]));
            add_if_shorter(&mut ints, (x as u32).wrapping_shr(y as u32) as i32, concat(&xy, &[IUSHR]));
        }
    }

    let mut longs: FxHashMap<i64, Vec<u8>> = FxHashMap::default();
    for i in 0..2u8 {
        longs.insert(i as i64, vec![LCONST_0 + i]);
    }
    for i in int_1s.clone().chain(int_2s.iter().copied()) {
        add_if_shorter(&mut longs, i as i64, concat(&ints[&i], &[I2L]));
    }

    let mut floats: FxHashMap<u32, Vec<u8>> = FxHashMap::default();
    for i in 0..2i32 {
        floats.insert(i2f_bits(i), vec![FCONST_0 + i as u8]);
    }
    for i in int_1s.clone().chain(int_2s.iter().copied()) {
        add_if_shorter(&mut floats, i2f_bits(i), concat(&ints[&i], &[I2F]));
    }
    // unusual float values are hardcoded
    floats.insert(FLOAT_SIGN, vec![FCONST_0, FNEG]); // -0.0
    floats.insert(FLOAT_NAN, vec![FCONST_0, FCONST_0, FDIV]);
    floats.insert(FLOAT_INF, vec![FCONST_1, FCONST_0, FDIV]);
    floats.insert(FLOAT_NINF, vec![FCONST_1, FNEG, FCONST_0, FDIV]);

    let mut doubles: FxHashMap<u64, Vec<u8>> = FxHashMap::default();
    for i in 0..2i32 {
        doubles.insert(i2d_bits(i), vec![DCONST_0 + i as u8]);
    }
    for i in int_1s.clone().chain(int_2s.iter().copied()) {
        add_if_shorter(&mut doubles, i2d_bits(i), concat(&ints[&i], &[I2D]));
    }
    doubles.insert(DOUBLE_SIGN, vec![DCONST_0, DNEG]); // -0.0
    doubles.insert(DOUBLE_NAN, vec![DCONST_0, DCONST_0, DDIV]);
    doubles.insert(DOUBLE_INF, vec![DCONST_1, DCONST_0, DDIV]);
    doubles.insert(DOUBLE_NINF, vec![DCONST_1, DNEG, DCONST_0, DDIV]);

    Tables { ints, floats, longs, doubles }
}

static TABLES: Lazy<Tables> = Lazy::new(build_tables);

fn calc_int(x: i32) -> Vec<u8> {
    if let Some(v) = TABLES.ints.get(&x) {
        return v.clone();
    }
    // build from the sign-extended low half and the remaining high bits
    let low = x as i16 as i32;
    let high = (x ^ low) >> 16;
    let mut res = calc_int(high);
    res.extend(calc_int(16));
    res.push(ISHL);
    if low != 0 {
        res.extend(calc_int(low));
        res.push(IXOR);
    }
    res
}

fn calc_long(x: i64) -> Vec<u8> {
    if let Some(v) = TABLES.longs.get(&x) {
        return v.clone();
    }
    let low = x as i32;
    let high = ((x ^ low as i64) >> 32) as i32;
    if high == 0 {
        let mut res = calc_int(low);
        res.push(I2L);
        return res;
    }

    let mut res = calc_int(high);
    res.push(I2L);
    res.extend(calc_int(32));
    res.push(LSHL);
    if low != 0 {
        res.extend(calc_int(low));
        res.push(I2L);
        res.push(LXOR);
    }
    res
}

fn calc_float(x: u32) -> Vec<u8> {
    debug_assert!(x == normalize_float(x));
    if let Some(v) = TABLES.floats.get(&x) {
        return v.clone();
    }

    let mut exponent = (((x >> 23) & 0xFF) as i32) - 127;
    let mut mantissa = (x % (1 << 23)) as i32;
    // denormals have no implicit leading bit and a shifted exponent
    if exponent == -127 {
        exponent += 1;
    } else {
        mantissa += 1 << 23;
    }
    exponent -= 23;

    if x & FLOAT_SIGN != 0 {
        mantissa = -mantissa;
    }
    let combine_op = if exponent < 0 { FDIV } else { FMUL };
    let mut exponent = exponent.abs();

    let mut afterm = Vec::new();
    // max two iterations since -149 <= exponent <= 104
    while exponent >= 63 {
        afterm.extend([LCONST_1, ICONST_M1, LSHL, L2F, combine_op]);
        mantissa = -mantissa;
        exponent -= 63;
    }
    if exponent > 0 {
        afterm.push(LCONST_1);
        afterm.extend(calc_int(exponent));
        afterm.extend([LSHL, L2F, combine_op]);
    }

    let mut res = calc_int(mantissa);
    res.push(I2F);
    res.extend(afterm);
    res
}

fn calc_double(x: u64) -> Vec<u8> {
    debug_assert!(x == normalize_double(x));
    if let Some(v) = TABLES.doubles.get(&x) {
        return v.clone();
    }

    let mut exponent = (((x >> 52) & 0x7FF) as i32) - 1023;
    let mut mantissa = (x % (1u64 << 52)) as i64;
    if exponent == -1023 {
        exponent += 1;
    } else {
        mantissa += 1 << 52;
    }
    let exponent = exponent - 52;

    if x & DOUBLE_SIGN != 0 {
        mantissa = -mantissa;
    }

    let mut afterm = Vec::new();
    let part63 = exponent.unsigned_abs() / 63;
    if part63 > 0 {
        // the *63 part of the exponent comes from repeated squaring of 2^63;
        // the negative power is built directly so 2^-1071 cannot overflow
        if exponent < 0 {
            afterm.extend([DCONST_1, LCONST_1, ICONST_M1, LSHL, L2D, DDIV]);
        } else {
            afterm.extend([LCONST_1, ICONST_M1, LSHL, L2D]);
        }

        // the base is really -2^63, so odd powers flip the mantissa sign
        if part63 & 1 > 0 {
            mantissa = -mantissa;
        }

        let mut last_needed = part63 & 1;
        for bi in 1..(32 - part63.leading_zeros()) {
            afterm.push(DUP2);
            if last_needed > 0 {
                afterm.push(DUP2);
            }
            afterm.push(DMUL);
            last_needed = part63 & (1 << bi);
        }
        afterm.extend(std::iter::repeat(DMUL).take(part63.count_ones() as usize));
    }

    let rest = exponent.abs() % 63;
    if rest > 0 {
        afterm.push(LCONST_1);
        afterm.extend(calc_int(rest));
        afterm.push(LSHL);
        afterm.push(L2D);
        afterm.push(if exponent < 0 { DDIV } else { DMUL });
    }

    let mut res = calc_long(mantissa);
    res.push(L2D);
    res.extend(afterm);
    res
}

/// Bytecode synthesizing `val` without any pool entry.
pub fn calc(st: Scalar, val: u64) -> Vec<u8> {
    match st {
        Scalar::INT => calc_int(val as i32),
        Scalar::FLOAT => calc_float(val as u32),
        Scalar::LONG => calc_long(val as i64),
        Scalar::DOUBLE => calc_double(val),
        _ => unreachable!("constants are primitive"),
    }
}

/// Pre-baked short sequence for `val`, if the table has one.
pub fn lookup(st: Scalar, val: u64) -> Option<Vec<u8>> {
    match st {
        Scalar::INT => TABLES.ints.get(&(val as i32)).cloned(),
        Scalar::FLOAT => TABLES.floats.get(&(val as u32)).cloned(),
        Scalar::LONG => TABLES.longs.get(&(val as i64)).cloned(),
        Scalar::DOUBLE => TABLES.doubles.get(&val).cloned(),
        _ => unreachable!("constants are primitive"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_hits() {
        assert_eq!(lookup(Scalar::INT, 0), Some(vec![ICONST_0]));
        assert_eq!(lookup(Scalar::INT, 5), Some(vec![ICONST_5]));
        assert_eq!(lookup(Scalar::INT, (-1i32) as u32 as u64), Some(vec![ICONST_M1]));
        assert_eq!(lookup(Scalar::INT, 42), Some(vec![BIPUSH, 42]));
        assert_eq!(lookup(Scalar::INT, 128), Some(vec![SIPUSH, 0, 128]));
        assert_eq!(lookup(Scalar::INT, 65535), Some(vec![ICONST_M1, I2C]));
        assert_eq!(lookup(Scalar::LONG, 1), Some(vec![LCONST_1]));
        assert_eq!(lookup(Scalar::LONG, 127), Some(vec![BIPUSH, 127, I2L]));
        assert_eq!(lookup(Scalar::FLOAT, i2f_bits(1) as u64), Some(vec![FCONST_1]));
        assert_eq!(lookup(Scalar::FLOAT, i2f_bits(42) as u64), Some(vec![BIPUSH, 42, I2F]));
        assert_eq!(lookup(Scalar::DOUBLE, i2d_bits(0)), Some(vec![DCONST_0]));
    }

    #[test]
    fn special_float_values() {
        assert_eq!(lookup(Scalar::FLOAT, FLOAT_NAN as u64), Some(vec![FCONST_0, FCONST_0, FDIV]));
        assert_eq!(
            lookup(Scalar::DOUBLE, DOUBLE_NINF),
            Some(vec![DCONST_1, DNEG, DCONST_0, DDIV])
        );
    }

    #[test]
    fn nan_patterns_collapse() {
        let weird_nan = 0x7fc8_0000u64;
        assert_eq!(normalize(Scalar::FLOAT, weird_nan), FLOAT_NAN as u64);
        assert_eq!(normalize(Scalar::FLOAT, 0xffc0_0123), FLOAT_NAN as u64);
        assert_eq!(normalize(Scalar::FLOAT, FLOAT_INF as u64), FLOAT_INF as u64);
        assert_eq!(normalize(Scalar::DOUBLE, 0x7ff8_0000_0000_0001), DOUBLE_NAN);
        assert_eq!(normalize(Scalar::DOUBLE, DOUBLE_INF), DOUBLE_INF);
        // infinities and ordinary values pass through
        assert_eq!(normalize(Scalar::INT, 12345), 12345);
    }

    #[test]
    fn int_synthesis_structure() {
        // 0x12345678 is not in the table; synthesis ends in shift/xor ops
        let bc = calc(Scalar::INT, 0x1234_5678);
        assert_eq!(*bc.last().unwrap(), IXOR);
        assert!(bc.contains(&ISHL));
    }

    #[test]
    fn long_synthesis_structure() {
        let bc = calc(Scalar::LONG, 0x0123_4567_89ab_cdefu64);
        assert_eq!(*bc.last().unwrap(), LXOR);
        assert!(bc.contains(&LSHL));
        assert!(bc.contains(&I2L));

        // small longs go through the int path
        let bc = calc(Scalar::LONG, 1_000_000);
        assert_eq!(*bc.last().unwrap(), I2L);
    }

    #[test]
    fn float_synthesis_structure() {
        // 2^-149: smallest denormal, needs the repeated scale-down
        let bc = calc(Scalar::FLOAT, 1);
        assert!(bc.ends_with(&[L2F, FDIV]));

        // an ordinary non-table float multiplies mantissa by a power of two
        let bits = 12345.678f32.to_bits() as u64;
        assert_eq!(normalize(Scalar::FLOAT, bits), bits);
        let bc = calc(Scalar::FLOAT, bits);
        assert!(bc.contains(&I2F));
    }

    #[test]
    fn double_synthesis_structure() {
        let bits = 2.0f64.powi(-1071).to_bits();
        let bc = calc(Scalar::DOUBLE, bits);
        assert!(bc.contains(&DDIV));
        assert!(bc.contains(&L2D));

        let bits = 1e300f64.to_bits();
        let bc = calc(Scalar::DOUBLE, bits);
        assert!(bc.contains(&DMUL));
        assert!(bc.contains(&DUP2));
    }

    #[test]
    fn zero_via_every_scalar() {
        assert_eq!(calc(Scalar::INT, 0), vec![ICONST_0]);
        assert_eq!(calc(Scalar::LONG, 0), vec![LCONST_0]);
        assert_eq!(calc(Scalar::FLOAT, 0), vec![FCONST_0]);
        assert_eq!(calc(Scalar::DOUBLE, 0), vec![DCONST_0]);
    }
}
