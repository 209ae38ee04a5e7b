use constructbin::environment::Environment;
use constructbin::error::ImageError;
use constructbin::expression::Expr;
use constructbin::persist::DIGEST_BYTES;
use constructbin::settings::Settings;

fn image() -> Vec<u8> {
    let mut env = Environment::new();
    env.define_module("LAB").expect("module");
    env.define_deffacts("LAB", "samples", vec![Expr::fact("sample", vec![Expr::Integer(1)])])
        .expect("deffacts");
    env.define_deffacts("LAB", "blanks", vec![]).expect("deffacts");
    env.bsave_to_vec().expect("bsave")
}

fn unchecked() -> Environment {
    Environment::with_settings(Settings { verify_checksum: false, ..Settings::default() })
}

/// Offset of the instance count in the storage section of `item`.
fn storage_count_offset(image: &[u8], item: &str) -> usize {
    let mut needle = (item.len() as u32).to_le_bytes().to_vec();
    needle.extend_from_slice(item.as_bytes());
    needle.extend_from_slice(&16u64.to_le_bytes());
    image
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
        .expect("storage section")
        + needle.len()
}

fn assert_left_clean(env: &Environment) {
    assert!(!env.is_bloaded());
    assert_eq!(env.module_names(), vec!["MAIN"]);
    assert_eq!(env.deffacts().count(), 0);
    assert_eq!(env.symbols().len(), 1);
}

#[test]
fn a_flipped_byte_fails_the_checksum() {
    let mut bytes = image();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    let mut env = Environment::new();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::ChecksumMismatch));
    assert_left_clean(&env);
}

#[test]
fn foreign_bytes_are_not_an_image() {
    let mut env = unchecked();
    let error = env.bload_from_slice(&[0u8; 64]).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }));
    let error = env.bload_from_slice(&[1, 2, 3]).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }));
    assert_left_clean(&env);
}

#[test]
fn another_version_is_rejected() {
    let mut bytes = image();
    // "CBIN-1.0" follows the 8 byte prefix and its 4 byte length
    bytes[8 + 4 + 5] = b'9';
    let mut env = unchecked();
    match env.bload_from_slice(&bytes).unwrap_err() {
        ImageError::VersionMismatch { found } => assert_eq!(found, "CBIN-9.0"),
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn counts_that_disagree_with_the_records_are_corrupt() {
    let mut bytes = image();
    let offset = storage_count_offset(&bytes, "deffacts");
    assert_eq!(bytes[offset], 2);
    bytes[offset] = 3;
    let mut env = unchecked();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }), "{}", error);
    assert_left_clean(&env);
}

#[test]
fn lenient_loading_still_catches_short_records() {
    let mut bytes = image();
    let offset = storage_count_offset(&bytes, "deffacts");
    bytes[offset] = 9;
    let mut env = Environment::with_settings(Settings {
        verify_checksum: false,
        strict_lengths: false,
        ..Settings::default()
    });
    assert!(env.bload_from_slice(&bytes).is_err());
    assert_left_clean(&env);
}

#[test]
fn truncated_images_are_rejected() {
    let bytes = image();
    let mut env = unchecked();
    let mut short = bytes[..bytes.len() - DIGEST_BYTES - 10].to_vec();
    short.extend_from_slice(&[0u8; DIGEST_BYTES]);
    assert!(matches!(env.bload_from_slice(&short).unwrap_err(), ImageError::CorruptImage { .. }));
    assert_left_clean(&env);
}

#[test]
fn oversized_images_are_rejected_before_parsing() {
    let mut env = Environment::with_settings(Settings { max_image_bytes: 16, ..Settings::default() });
    assert!(matches!(env.bload_from_slice(&image()).unwrap_err(), ImageError::CorruptImage { .. }));
}

#[test]
fn a_failed_load_does_not_poison_the_next_one() {
    let good = image();
    let mut bad = good.clone();
    bad[20] ^= 0x55;
    let mut env = Environment::new();
    assert!(env.bload_from_slice(&bad).is_err());
    env.bload_from_slice(&good).expect("bload");
    assert_eq!(env.deffacts().count(), 2);
}

/// Offset of the first module item in the record section of `item`.
fn records_offset(image: &[u8], item: &str, space: u64) -> usize {
    let mut needle = (item.len() as u32).to_le_bytes().to_vec();
    needle.extend_from_slice(item.as_bytes());
    needle.extend_from_slice(&space.to_le_bytes());
    image
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
        .expect("record section")
        + needle.len()
}

/// Offset of the first cell of the shared expression section.
fn expression_cells_offset(image: &[u8]) -> usize {
    let read_u64 = |at: usize| u64::from_le_bytes(image[at..at + 8].try_into().expect("u64")) as usize;
    // magic, then the length-prefixed version string
    let mut offset = 8 + 4 + "CBIN-1.0".len();
    for _ in 0..2 {
        offset += 8 + read_u64(offset);
    }
    offset + 8
}

fn put_i64(bytes: &mut [u8], at: usize, value: i64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn two_deffacts_in_main() -> Vec<u8> {
    let mut env = Environment::new();
    env.define_deffacts("MAIN", "first", vec![Expr::fact("one", vec![])]).expect("deffacts");
    env.define_deffacts("MAIN", "second", vec![Expr::fact("two", vec![])]).expect("deffacts");
    env.bsave_to_vec().expect("bsave")
}

#[test]
fn a_list_that_loops_back_is_rejected() {
    let mut env = Environment::new();
    env.define_deffacts("MAIN", "alone", vec![]).expect("deffacts");
    let mut bytes = env.bsave_to_vec().expect("bsave");
    // one module item then one record, whose next link follows name and module
    let start = records_offset(&bytes, "deffacts", 24 + 32);
    put_i64(&mut bytes, start + 24 + 16, 0);
    let mut env = unchecked();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::Relocation { .. }), "{}", error);
    assert_left_clean(&env);

    let mut bytes = two_deffacts_in_main();
    let start = records_offset(&bytes, "deffacts", 24 + 2 * 32);
    put_i64(&mut bytes, start + 24 + 32 + 16, 0);
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::Relocation { .. }), "{}", error);
    assert_left_clean(&env);
}

#[test]
fn an_instance_on_no_list_is_rejected() {
    let mut bytes = two_deffacts_in_main();
    let start = records_offset(&bytes, "deffacts", 24 + 2 * 32);
    // the list of MAIN now stops after its first instance
    put_i64(&mut bytes, start + 16, 0);
    put_i64(&mut bytes, start + 24 + 16, -1);
    let mut env = unchecked();
    match env.bload_from_slice(&bytes).unwrap_err() {
        ImageError::Relocation { kind, index, .. } => {
            assert_eq!(kind, "deffacts");
            assert_eq!(index, 1);
        }
        other => panic!("unexpected error {}", other),
    }
    assert_left_clean(&env);
}

fn one_deffacts_per_module() -> Vec<u8> {
    let mut env = Environment::new();
    env.define_module("LAB").expect("module");
    env.define_deffacts("MAIN", "home", vec![]).expect("deffacts");
    env.define_deffacts("LAB", "away", vec![]).expect("deffacts");
    env.bsave_to_vec().expect("bsave")
}

#[test]
fn module_items_must_follow_module_order() {
    let mut bytes = one_deffacts_per_module();
    let start = records_offset(&bytes, "deffacts", 2 * 24 + 2 * 32);
    put_i64(&mut bytes, start, 1);
    put_i64(&mut bytes, start + 24, 0);
    let mut env = unchecked();
    match env.bload_from_slice(&bytes).unwrap_err() {
        ImageError::Relocation { kind, index, .. } => {
            assert_eq!(kind, "deffacts");
            assert_eq!(index, 0);
        }
        other => panic!("unexpected error {}", other),
    }
    assert_left_clean(&env);
}

#[test]
fn a_list_cannot_start_in_another_module() {
    let mut bytes = one_deffacts_per_module();
    let start = records_offset(&bytes, "deffacts", 2 * 24 + 2 * 32);
    // MAIN claims the instance that belongs to LAB
    put_i64(&mut bytes, start + 8, 1);
    put_i64(&mut bytes, start + 16, 1);
    let mut env = unchecked();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::Relocation { .. }), "{}", error);
    assert_left_clean(&env);
}

fn two_facts_with_fields() -> Vec<u8> {
    let mut env = Environment::new();
    env.define_deffacts(
        "MAIN",
        "pair",
        vec![
            Expr::fact("left", vec![Expr::Integer(1)]),
            Expr::fact("right", vec![Expr::Integer(2)]),
        ],
    )
    .expect("deffacts");
    env.bsave_to_vec().expect("bsave")
}

const CELL_BYTES: usize = 1 + 8 + 8 + 8;

#[test]
fn an_expression_that_is_its_own_sibling_is_rejected() {
    let mut bytes = two_facts_with_fields();
    // cells: (left @1) 1 (right @3) 2; point the second fact back at itself
    let cell = expression_cells_offset(&bytes) + 2 * CELL_BYTES;
    put_i64(&mut bytes, cell + 17, 2);
    let mut env = unchecked();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }), "{}", error);
    assert_left_clean(&env);
}

#[test]
fn arguments_pointing_backwards_are_rejected() {
    let mut bytes = two_facts_with_fields();
    // the second fact borrows the field of the first
    let cell = expression_cells_offset(&bytes) + 2 * CELL_BYTES;
    put_i64(&mut bytes, cell + 9, 1);
    let mut env = unchecked();
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }), "{}", error);
    assert_left_clean(&env);

    let mut bytes = two_facts_with_fields();
    let first = expression_cells_offset(&bytes);
    put_i64(&mut bytes, first + 17, 0);
    let error = env.bload_from_slice(&bytes).unwrap_err();
    assert!(matches!(error, ImageError::CorruptImage { .. }), "{}", error);
    assert_left_clean(&env);
}
