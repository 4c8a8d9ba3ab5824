#![feature(test)]
extern crate test;

use test::Bencher;
use vqfilter::Filter;

fn spread(i: u64) -> u64 {
    i.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

#[bench]
fn bench_new(b: &mut Bencher) {
    b.iter(|| Filter::new(1_000_000).unwrap());
}

#[bench]
fn bench_insert_to_half_load(b: &mut Bencher) {
    b.iter(|| {
        let f = Filter::new(100_000).unwrap();
        for i in 0..50_000 {
            f.insert_fingerprint(spread(i)).unwrap();
        }
        f
    });
}

#[bench]
fn bench_contains_ok_medium(b: &mut Bencher) {
    let f = Filter::new(100_000).unwrap();
    for i in 0..50_000 {
        f.insert_fingerprint(spread(i)).unwrap();
    }
    let mut i = 0;
    b.iter(|| {
        i += 1;
        f.contains_fingerprint(spread(i % 50_000))
    })
}

#[bench]
fn bench_contains_nok_medium(b: &mut Bencher) {
    let f = Filter::new(100_000).unwrap();
    for i in 0..50_000 {
        f.insert_fingerprint(spread(i)).unwrap();
    }
    let mut i = 50_000;
    b.iter(|| {
        i += 1;
        f.contains_fingerprint(spread(i))
    })
}

#[bench]
fn bench_get_payload(b: &mut Bencher) {
    let f = Filter::new(100_000).unwrap();
    for i in 0..50_000 {
        f.insert_fingerprint_value(spread(i), i as u8).unwrap();
    }
    let mut i = 0;
    b.iter(|| {
        i += 1;
        f.get_fingerprint(spread(i % 50_000))
    })
}

#[bench]
fn bench_remove_insert_churn(b: &mut Bencher) {
    let f = Filter::new(100_000).unwrap();
    for i in 0..50_000 {
        f.insert_fingerprint(spread(i)).unwrap();
    }
    let mut i = 0;
    b.iter(|| {
        i += 1;
        assert!(f.remove_fingerprint(spread(i % 50_000)));
        f.insert_fingerprint(spread(i % 50_000)).unwrap();
    })
}
