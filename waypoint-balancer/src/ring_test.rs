use std::collections::HashMap;

use super::*;

fn ring(weights: &[(&str, u32)]) -> HashRing<String> {
    HashRing::build(weights.iter().map(|(id, p)| (id.to_string(), *p)))
}

#[test]
fn empty_ring_returns_none() {
    let r = ring(&[]);
    assert!(r.is_empty());
    assert!(r.get(b"key").is_none());
    assert_eq!(r.iter_from(b"key").count(), 0);

    let zero = ring(&[("http://a:1", 0), ("http://b:1", 0)]);
    assert!(zero.is_empty());
    assert_eq!(zero.len(), 0);
}

#[test]
fn build_is_deterministic_regardless_of_input_order() {
    let a = ring(&[("http://a:1", 50), ("http://b:1", 80), ("http://c:1", 20)]);
    let b = ring(&[("http://c:1", 20), ("http://a:1", 50), ("http://b:1", 80)]);

    let la: Vec<_> = a.layout().collect();
    let lb: Vec<_> = b.layout().collect();
    assert_eq!(la, lb);

    for i in 0..2000 {
        let key = format!("key-{}", i);
        assert_eq!(a.get(key.as_bytes()), b.get(key.as_bytes()));
    }
}

#[test]
fn lookup_wraps_around() {
    let r = ring(&[("http://a:1", 10), ("http://b:1", 10)]);
    let last = r.layout().last().map(|(h, _)| h).unwrap();
    let first_owner = r.layout().next().map(|(_, id)| id.to_string()).unwrap();

    if last < u32::MAX {
        assert_eq!(r.get_by_hash(last + 1).unwrap(), &first_owner);
    }
    assert_eq!(r.get_by_hash(0).unwrap(), &first_owner);
}

#[test]
fn selection_is_proportional_to_points() {
    let r = ring(&[("http://a:1", 300), ("http://b:1", 100)]);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..20_000 {
        let key = format!("user-{}", i);
        *counts.entry(r.get(key.as_bytes()).unwrap().clone()).or_default() += 1;
    }
    let a = counts["http://a:1"] as f64 / 20_000.0;
    assert!(a > 0.65 && a < 0.85, "share of a was {}", a);
}

#[test]
fn iter_from_yields_distinct_members() {
    let r = ring(&[("http://a:1", 100), ("http://b:1", 100), ("http://c:1", 100)]);
    let walk: Vec<_> = r.iter_from(b"order-17").cloned().collect();
    assert_eq!(walk.len(), 3);
    assert_eq!(&walk[0], r.get(b"order-17").unwrap());

    let mut sorted = walk.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 3);
}

#[test]
fn points_of_reports_member_points() {
    let r = ring(&[("http://a:1", 7), ("http://b:1", 3)]);
    assert_eq!(r.points_of("http://a:1"), 7);
    assert_eq!(r.points_of("http://b:1"), 3);
    assert_eq!(r.points_of("http://z:1"), 0);
    assert_eq!(r.total_points(), 10);
}

#[test]
fn hash_key_is_stable() {
    assert_eq!(hash_key(b"abc"), hash_key(b"abc"));
    assert_ne!(hash_key(b"abc"), hash_key(b"abd"));
}
