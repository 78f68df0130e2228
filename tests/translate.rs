//! End-to-end translation of a small synthesized dex payload

use dex2class::{translate, Options};

fn u2(v: &mut Vec<u8>, x: u16) {
    v.extend_from_slice(&x.to_le_bytes());
}

fn u4(v: &mut Vec<u8>, x: u32) {
    v.extend_from_slice(&x.to_le_bytes());
}

fn uleb(v: &mut Vec<u8>, mut x: u32) {
    loop {
        let mut byte = (x & 0x7F) as u8;
        x >>= 7;
        if x != 0 {
            byte |= 0x80;
        }
        v.push(byte);
        if x == 0 {
            break;
        }
    }
}

/// Builds a one-class dex:
///
/// ```text
/// public class Main {
///     public static final int X = 42;
///     public static int run() { return 1234; }
/// }
/// ```
fn build_test_dex() -> Vec<u8> {
    let strings = ["I", "LMain;", "Ljava/lang/Object;", "X", "run"];

    let string_ids_off = 0x70u32;
    let type_ids_off = string_ids_off + 4 * strings.len() as u32;
    let proto_ids_off = type_ids_off + 4 * 3;
    let field_ids_off = proto_ids_off + 12;
    let method_ids_off = field_ids_off + 8;
    let class_defs_off = method_ids_off + 8;
    let data_off = class_defs_off + 32;

    // data section, with every offset recorded as absolute
    let mut data = Vec::new();
    let mut str_offs = Vec::new();
    for s in strings {
        str_offs.push(data_off + data.len() as u32);
        uleb(&mut data, s.len() as u32);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }

    let code_off = data_off + data.len() as u32;
    u2(&mut data, 1); // registers_size
    u2(&mut data, 0); // ins_size
    u2(&mut data, 0); // outs_size
    u2(&mut data, 0); // tries_size
    u4(&mut data, 0); // debug_info_off
    u4(&mut data, 3); // insns_size in code units
    u2(&mut data, 0x0013); // const/16 v0, #1234
    u2(&mut data, 1234);
    u2(&mut data, 0x000f); // return v0

    let class_data_off = data_off + data.len() as u32;
    uleb(&mut data, 1); // static fields
    uleb(&mut data, 0); // instance fields
    uleb(&mut data, 1); // direct methods
    uleb(&mut data, 0); // virtual methods
    uleb(&mut data, 0); // field 0
    uleb(&mut data, 0x19); // public static final
    uleb(&mut data, 0); // method 0
    uleb(&mut data, 0x9); // public static
    uleb(&mut data, code_off);

    let static_values_off = data_off + data.len() as u32;
    uleb(&mut data, 1);
    data.push(0x04); // VALUE_INT, one byte
    data.push(42);

    let total = data_off + data.len() as u32;

    let mut dex = Vec::with_capacity(total as usize);
    dex.extend_from_slice(b"dex\n035\0");
    u4(&mut dex, 0); // checksum (unchecked)
    dex.extend_from_slice(&[0u8; 20]); // signature (unchecked)
    u4(&mut dex, total);
    u4(&mut dex, 0x70); // header_size
    u4(&mut dex, 0x12345678); // endian_tag
    u4(&mut dex, 0); // link_size
    u4(&mut dex, 0); // link_off
    u4(&mut dex, 0); // map_off
    u4(&mut dex, strings.len() as u32);
    u4(&mut dex, string_ids_off);
    u4(&mut dex, 3);
    u4(&mut dex, type_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, proto_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, field_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, method_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, class_defs_off);
    u4(&mut dex, data.len() as u32);
    u4(&mut dex, data_off);
    assert_eq!(dex.len(), 0x70);

    for off in str_offs {
        u4(&mut dex, off);
    }
    // type ids: I, LMain;, Ljava/lang/Object;
    u4(&mut dex, 0);
    u4(&mut dex, 1);
    u4(&mut dex, 2);
    // proto ()I
    u4(&mut dex, 0); // shorty_idx
    u4(&mut dex, 0); // return_type_idx
    u4(&mut dex, 0); // parameters_off
    // field Main.X:I
    u2(&mut dex, 1);
    u2(&mut dex, 0);
    u4(&mut dex, 3);
    // method Main.run:()I
    u2(&mut dex, 1);
    u2(&mut dex, 0);
    u4(&mut dex, 4);
    // class def
    u4(&mut dex, 1); // class_idx
    u4(&mut dex, 0x1); // access
    u4(&mut dex, 2); // superclass_idx
    u4(&mut dex, 0); // interfaces_off
    u4(&mut dex, 0xFFFFFFFF); // source_file_idx
    u4(&mut dex, 0); // annotations_off
    u4(&mut dex, class_data_off);
    u4(&mut dex, static_values_off);

    dex.extend_from_slice(&data);
    dex
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn translates_the_class() {
    let dex = build_test_dex();
    let classes = translate(&dex, Options::none()).unwrap();
    assert_eq!(classes.len(), 1);

    let (name, bytes) = &classes[0];
    assert_eq!(name, "Main");

    // magic and version 49.0
    assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(&bytes[4..8], &[0, 0, 0, 49]);

    // the pool carries the class names and attribute names
    assert!(contains(bytes, b"Main"));
    assert!(contains(bytes, b"java/lang/Object"));
    assert!(contains(bytes, b"ConstantValue"));
    assert!(contains(bytes, b"Code"));
    assert!(contains(bytes, b"()I"));

    // X's initial value lands in the pool as CONSTANT_Integer 42
    assert!(contains(bytes, &[0x03, 0, 0, 0, 42]));

    // the method body pushes 1234 and returns it
    assert!(contains(bytes, &[0x11, 0x04, 0xD2])); // sipush 1234
    assert!(contains(bytes, &[0xAC])); // ireturn
}

#[test]
fn optimized_output_is_no_larger() {
    let dex = build_test_dex();
    let plain = translate(&dex, Options::none()).unwrap();
    let optimized = translate(&dex, Options::pretty()).unwrap();
    assert_eq!(plain.len(), optimized.len());
    assert!(optimized[0].1.len() <= plain[0].1.len());
    assert!(contains(&optimized[0].1, &[0x11, 0x04, 0xD2]));
}

#[test]
fn translation_is_deterministic() {
    let dex = build_test_dex();
    for bits in [0u8, 9, 0x55, 0xAA, 255] {
        let opts = Options::from_bits(bits);
        let a = translate(&dex, opts).unwrap();
        let b = translate(&dex, opts).unwrap();
        assert_eq!(a, b, "options {:#04x} must be deterministic", bits);
    }
}

#[test]
fn all_option_masks_produce_output() {
    let dex = build_test_dex();
    for bits in 0..=255u8 {
        let classes = translate(&dex, Options::from_bits(bits)).unwrap();
        assert_eq!(classes.len(), 1, "options {:#04x}", bits);
        let bytes = &classes[0].1;
        assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        // split pool always writes a full-size pool
        if Options::from_bits(bits).split_pool {
            assert_eq!(&bytes[8..10], &[0xFF, 0xFF]);
        }
    }
}

#[test]
fn empty_class_translates() {
    // a class def with no class data at all
    let strings = ["LEmpty;", "Ljava/lang/Object;"];
    let string_ids_off = 0x70u32;
    let type_ids_off = string_ids_off + 8;
    let class_defs_off = type_ids_off + 8;
    let data_off = class_defs_off + 32;

    let mut data = Vec::new();
    let mut str_offs = Vec::new();
    for s in strings {
        str_offs.push(data_off + data.len() as u32);
        uleb(&mut data, s.len() as u32);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }

    let mut dex = Vec::new();
    dex.extend_from_slice(b"dex\n035\0");
    u4(&mut dex, 0);
    dex.extend_from_slice(&[0u8; 20]);
    u4(&mut dex, data_off + data.len() as u32);
    u4(&mut dex, 0x70);
    u4(&mut dex, 0x12345678);
    u4(&mut dex, 0);
    u4(&mut dex, 0);
    u4(&mut dex, 0);
    u4(&mut dex, 2);
    u4(&mut dex, string_ids_off);
    u4(&mut dex, 2);
    u4(&mut dex, type_ids_off);
    u4(&mut dex, 0);
    u4(&mut dex, 0); // proto ids
    u4(&mut dex, 0);
    u4(&mut dex, 0); // field ids
    u4(&mut dex, 0);
    u4(&mut dex, 0); // method ids
    u4(&mut dex, 1);
    u4(&mut dex, class_defs_off);
    u4(&mut dex, data.len() as u32);
    u4(&mut dex, data_off);
    assert_eq!(dex.len(), 0x70);

    for off in str_offs {
        u4(&mut dex, off);
    }
    u4(&mut dex, 0);
    u4(&mut dex, 1);

    u4(&mut dex, 0); // class_idx -> LEmpty;
    u4(&mut dex, 0x1);
    u4(&mut dex, 1); // super -> Object
    u4(&mut dex, 0);
    u4(&mut dex, 0xFFFFFFFF);
    u4(&mut dex, 0);
    u4(&mut dex, 0); // no class data
    u4(&mut dex, 0); // no static values

    dex.extend_from_slice(&data);

    let classes = translate(&dex, Options::none()).unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].0, "Empty");
    let bytes = &classes[0].1;
    assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert!(contains(bytes, b"Empty"));
}

/// Builds a class whose method narrows a register through an instance-of
/// guard, then uses it at the narrowed type:
///
/// ```text
/// public class Main {
///     public static String S;
///     public static void run(Object p) {
///         if (p instanceof String) { S = (String) p; }   // cast is implicit in dex
///     }
/// }
/// ```
fn build_instance_of_dex() -> Vec<u8> {
    let strings = ["LMain;", "Ljava/lang/Object;", "Ljava/lang/String;", "V", "run", "S"];

    let string_ids_off = 0x70u32;
    let type_ids_off = string_ids_off + 4 * strings.len() as u32;
    let proto_ids_off = type_ids_off + 4 * 4;
    let field_ids_off = proto_ids_off + 12;
    let method_ids_off = field_ids_off + 8;
    let class_defs_off = method_ids_off + 8;
    let data_off = class_defs_off + 32;

    let mut data = Vec::new();
    let mut str_offs = Vec::new();
    for s in strings {
        str_offs.push(data_off + data.len() as u32);
        uleb(&mut data, s.len() as u32);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }

    // parameter list (Ljava/lang/Object;)
    let params_off = data_off + data.len() as u32;
    u4(&mut data, 1);
    u2(&mut data, 1);

    let code_off = data_off + data.len() as u32;
    u2(&mut data, 2); // registers_size: v0 scratch, v1 param
    u2(&mut data, 1); // ins_size
    u2(&mut data, 0); // outs_size
    u2(&mut data, 0); // tries_size
    u4(&mut data, 0); // debug_info_off
    u4(&mut data, 7); // insns_size
    u2(&mut data, 0x1020); // instance-of v0, v1, type@2
    u2(&mut data, 0x0002);
    u2(&mut data, 0x0038); // if-eqz v0, +4
    u2(&mut data, 0x0004);
    u2(&mut data, 0x0169); // sput-object v1, field@0
    u2(&mut data, 0x0000);
    u2(&mut data, 0x000e); // return-void

    let class_data_off = data_off + data.len() as u32;
    uleb(&mut data, 1); // static fields
    uleb(&mut data, 0);
    uleb(&mut data, 1); // direct methods
    uleb(&mut data, 0);
    uleb(&mut data, 0); // field 0
    uleb(&mut data, 0x9); // public static
    uleb(&mut data, 0); // method 0
    uleb(&mut data, 0x9); // public static
    uleb(&mut data, code_off);

    let total = data_off + data.len() as u32;

    let mut dex = Vec::with_capacity(total as usize);
    dex.extend_from_slice(b"dex\n035\0");
    u4(&mut dex, 0);
    dex.extend_from_slice(&[0u8; 20]);
    u4(&mut dex, total);
    u4(&mut dex, 0x70);
    u4(&mut dex, 0x12345678);
    u4(&mut dex, 0);
    u4(&mut dex, 0);
    u4(&mut dex, 0);
    u4(&mut dex, strings.len() as u32);
    u4(&mut dex, string_ids_off);
    u4(&mut dex, 4);
    u4(&mut dex, type_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, proto_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, field_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, method_ids_off);
    u4(&mut dex, 1);
    u4(&mut dex, class_defs_off);
    u4(&mut dex, data.len() as u32);
    u4(&mut dex, data_off);
    assert_eq!(dex.len(), 0x70);

    for off in str_offs {
        u4(&mut dex, off);
    }
    // type ids: LMain;, Object, String, V
    u4(&mut dex, 0);
    u4(&mut dex, 1);
    u4(&mut dex, 2);
    u4(&mut dex, 3);
    // proto (Ljava/lang/Object;)V
    u4(&mut dex, 3); // shorty_idx (unused by the parser)
    u4(&mut dex, 3); // return type V
    u4(&mut dex, params_off);
    // field Main.S:Ljava/lang/String;
    u2(&mut dex, 0);
    u2(&mut dex, 2);
    u4(&mut dex, 5);
    // method Main.run:(Ljava/lang/Object;)V
    u2(&mut dex, 0);
    u2(&mut dex, 0);
    u4(&mut dex, 4);
    // class def
    u4(&mut dex, 0);
    u4(&mut dex, 0x1);
    u4(&mut dex, 1);
    u4(&mut dex, 0);
    u4(&mut dex, 0xFFFFFFFF);
    u4(&mut dex, 0);
    u4(&mut dex, class_data_off);
    u4(&mut dex, 0);

    dex.extend_from_slice(&data);
    dex
}

#[test]
fn implicit_cast_gets_explicit_checkcast() {
    let dex = build_instance_of_dex();
    for opts in [Options::none(), Options::pretty(), Options::all()] {
        let classes = translate(&dex, opts).unwrap();
        assert_eq!(classes.len(), 1);
        let bytes = &classes[0].1;

        // the narrowed use of the register must checkcast to String before
        // the putstatic
        assert!(contains(bytes, b"java/lang/String"));
        assert!(contains(bytes, &[0xC1])); // instanceof
        assert!(contains(bytes, &[0xC0])); // checkcast
        assert!(contains(bytes, &[0xB3])); // putstatic
    }
}

#[test]
fn garbage_input_is_rejected() {
    assert!(translate(b"not a dex", Options::none()).is_err());
    assert!(translate(&[], Options::none()).is_err());
}
