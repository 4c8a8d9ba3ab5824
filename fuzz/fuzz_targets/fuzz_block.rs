#![no_main]
use libfuzzer_sys::fuzz_target;

use std::collections::HashMap;

// Range of a single-block filter: 36 buckets of 256 tags.
const RANGE: u64 = 36 * 256;

fn primary_bucket(hash: u64) -> u8 {
    (hash >> 8) as u8
}

fn alternate_bucket(hash: u64, tag: u8) -> u8 {
    (((hash ^ u64::from(tag) * 0x5bd1_e995) % RANGE) >> 8) as u8
}

// Single-block filter, modeled exactly: inserts append to the primary
// bucket's (bucket, tag) class, while removals and lookups fall back to the
// alternate bucket's class. Within a class the filter is FIFO (the lowest
// matching slot is the oldest insert), so payload streams compare as vectors.
fuzz_target!(|data: Vec<u16>| {
    let f = vqfilter::Filter::new(0).unwrap();
    let mut model: HashMap<(u8, u8), Vec<u8>> = HashMap::new();
    let mut stamp = 0u8;
    for &word in &data {
        // bits 0..8 tag, bits 8..14 bucket, bit 15 op
        let tag = word as u8;
        let bucket = ((word >> 8) & 0x3f) as u8 % 36;
        let hash = u64::from(bucket) << 8 | u64::from(tag);
        let primary = (primary_bucket(hash), tag);
        let alternate = (alternate_bucket(hash, tag), tag);

        if word & 0x8000 != 0 {
            let key = if model.get(&primary).is_some_and(|v| !v.is_empty()) {
                Some(primary)
            } else if model.get(&alternate).is_some_and(|v| !v.is_empty()) {
                Some(alternate)
            } else {
                None
            };
            assert_eq!(f.remove_fingerprint(hash), key.is_some());
            if let Some(key) = key {
                model.get_mut(&key).unwrap().remove(0);
            }
        } else {
            stamp = stamp.wrapping_add(1);
            match f.insert_fingerprint_value(hash, stamp) {
                Ok(()) => model.entry(primary).or_default().push(stamp),
                Err(_) => assert_eq!(f.len(), 28),
            }
        }
        f.validate();

        let expected = match model.get(&primary) {
            Some(values) if !values.is_empty() => values.clone(),
            _ => model.get(&alternate).cloned().unwrap_or_default(),
        };
        assert_eq!(f.values_fingerprint(hash), expected);
    }
    assert_eq!(f.len(), model.values().map(|v| v.len() as u64).sum::<u64>());
});
