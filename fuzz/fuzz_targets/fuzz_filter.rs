#![no_main]
use libfuzzer_sys::fuzz_target;

use std::collections::HashMap;

const SLOTS_PER_BLOCK: u64 = 28;
const BUCKETS_PER_BLOCK: u64 = 36;
const CHECK_EVERY: usize = 8;

/// Mirror of the placement rules: two-choice by free count with ties to the
/// primary, removals probing the primary class before the alternate. Entries
/// are tracked per `(bucket, tag)` class, which makes sequential replay
/// exact, membership included.
struct Model {
    range: u64,
    occupancy: Vec<u32>,
    classes: HashMap<(u64, u8), u64>,
    len: u64,
}

impl Model {
    fn new(filter: &vqfilter::Filter) -> Model {
        let nblocks = filter.capacity() / SLOTS_PER_BLOCK;
        Model {
            range: nblocks * BUCKETS_PER_BLOCK * 256,
            occupancy: vec![0; nblocks as usize],
            classes: HashMap::new(),
            len: 0,
        }
    }

    fn candidates(&self, hash: u64) -> (u64, u64, u8) {
        let hash = hash % self.range;
        let tag = (hash & 0xff) as u8;
        let primary = hash >> 8;
        let alternate = ((hash ^ u64::from(tag) * 0x5bd1_e995) % self.range) >> 8;
        (primary, alternate, tag)
    }

    fn insert(&mut self, hash: u64) -> bool {
        let (primary, alternate, tag) = self.candidates(hash);
        let (pb, ab) = (primary / BUCKETS_PER_BLOCK, alternate / BUCKETS_PER_BLOCK);
        let bucket = if pb != ab && self.occupancy[ab as usize] < self.occupancy[pb as usize] {
            alternate
        } else {
            primary
        };
        let chosen = (bucket / BUCKETS_PER_BLOCK) as usize;
        if self.occupancy[chosen] == SLOTS_PER_BLOCK as u32 {
            return false;
        }
        self.occupancy[chosen] += 1;
        *self.classes.entry((bucket, tag)).or_default() += 1;
        self.len += 1;
        true
    }

    fn remove(&mut self, hash: u64) -> bool {
        let (primary, alternate, tag) = self.candidates(hash);
        for bucket in [primary, alternate] {
            if let Some(count) = self.classes.get_mut(&(bucket, tag)) {
                if *count > 0 {
                    *count -= 1;
                    self.occupancy[(bucket / BUCKETS_PER_BLOCK) as usize] -= 1;
                    self.len -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn contains(&self, hash: u64) -> bool {
        let (primary, alternate, tag) = self.candidates(hash);
        [primary, alternate]
            .iter()
            .any(|&bucket| self.classes.get(&(bucket, tag)).copied().unwrap_or(0) > 0)
    }
}

fuzz_target!(|data: Vec<i16>| {
    if data.len() < 2 {
        return;
    }
    let slots = (data[0] as u16 as u64).min(data.len() as u64 * 2);
    let f = vqfilter::Filter::new(slots).unwrap();
    let mut model = Model::new(&f);
    for (i, &op) in data[1..].iter().enumerate() {
        let hash = u64::from(op as u16);
        if op >= 0 {
            assert_eq!(f.insert_fingerprint(hash).is_ok(), model.insert(hash));
        } else {
            assert_eq!(f.remove_fingerprint(hash), model.remove(hash));
        }
        assert_eq!(f.contains_fingerprint(hash), model.contains(hash));
        if i % CHECK_EVERY == 0 {
            f.validate();
            assert_eq!(f.len(), model.len);
        }
    }
    f.validate();
    assert_eq!(f.len(), model.len);
});
