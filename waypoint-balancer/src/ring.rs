use std::collections::{BTreeMap, HashSet};
use std::hash::Hasher;
use std::sync::Arc;

use siphasher::sip::SipHasher24;

use crate::tracker::TrackerClient;

/// Anything that can own points on a ring. The id is hashed into the point
/// positions and orders members deterministically.
pub trait RingMember: Clone {
    fn ring_id(&self) -> &str;
}

impl RingMember for String {
    fn ring_id(&self) -> &str {
        self.as_str()
    }
}

impl RingMember for Arc<TrackerClient> {
    fn ring_id(&self) -> &str {
        self.uri()
    }
}

/// Hash of a routing key (or a point id) into the 32 bit ring space.
pub fn hash_key(key: &[u8]) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(key);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Point {
    hash: u32,
    member: usize,
}

/// Weighted consistent hash ring.
///
/// Every member contributes `points` positions, placed at `hash("<id>#<index>")`.
/// Lookup returns the owner of the first point at or after the key hash, wrapping
/// past the end. Members are sorted by id before the points are laid out, so the
/// same weights always give the same ring whatever order they were supplied in;
/// two members landing on the same hash are ordered by id.
#[derive(Debug, Clone)]
pub struct HashRing<T> {
    points: Vec<Point>,
    members: Vec<T>,
    member_points: Vec<u32>,
}

impl<T: RingMember> Default for HashRing<T> {
    fn default() -> Self {
        HashRing {
            points: Vec::new(),
            members: Vec::new(),
            member_points: Vec::new(),
        }
    }
}

impl<T: RingMember> HashRing<T> {
    /// Builds a ring from `(member, points)` pairs. Members with zero points are left out.
    /// A member given twice keeps the last point count.
    pub fn build<I>(weighted: I) -> Self
    where
        I: IntoIterator<Item = (T, u32)>,
    {
        let mut by_id: BTreeMap<String, (T, u32)> = BTreeMap::new();
        for (member, points) in weighted {
            if points > 0 {
                by_id.insert(member.ring_id().to_string(), (member, points));
            } else {
                by_id.remove(member.ring_id());
            }
        }

        let total: usize = by_id.values().map(|(_, p)| *p as usize).sum();
        let mut points = Vec::with_capacity(total);
        let mut members = Vec::with_capacity(by_id.len());
        let mut member_points = Vec::with_capacity(by_id.len());

        for (index, (id, (member, count))) in by_id.into_iter().enumerate() {
            for i in 0..count {
                let point_id = format!("{}#{}", id, i);
                points.push(Point {
                    hash: hash_key(point_id.as_bytes()),
                    member: index,
                });
            }
            members.push(member);
            member_points.push(count);
        }

        // member indexes follow id order, so this also breaks hash ties by id
        points.sort_unstable_by_key(|p| (p.hash, p.member));

        HashRing {
            points,
            members,
            member_points,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of members owning at least one point
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn total_points(&self) -> usize {
        self.points.len()
    }

    pub fn members(&self) -> &[T] {
        &self.members
    }

    /// Points owned by the member with the given id (0 when absent)
    pub fn points_of(&self, id: &str) -> u32 {
        self.members
            .iter()
            .position(|m| m.ring_id() == id)
            .map(|i| self.member_points[i])
            .unwrap_or(0)
    }

    /// Layout of the ring as `(point hash, member id)` pairs in ring order.
    pub fn layout(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.points
            .iter()
            .map(move |p| (p.hash, self.members[p.member].ring_id()))
    }

    /// Owner of the key, `None` when the ring is empty.
    pub fn get(&self, key: &[u8]) -> Option<&T> {
        self.get_by_hash(hash_key(key))
    }

    pub fn get_by_hash(&self, hash: u32) -> Option<&T> {
        let idx = self.position(hash)?;
        Some(&self.members[self.points[idx].member])
    }

    /// Distinct members in ring order starting at the key's position.
    pub fn iter_from(&self, key: &[u8]) -> RingIter<'_, T> {
        self.iter_from_hash(hash_key(key))
    }

    pub fn iter_from_hash(&self, hash: u32) -> RingIter<'_, T> {
        RingIter {
            ring: self,
            start: self.position(hash).unwrap_or(0),
            walked: 0,
            seen: HashSet::new(),
        }
    }

    fn position(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.hash < hash);
        Some(if idx == self.points.len() { 0 } else { idx })
    }
}

/// Iterator over the distinct members of a ring, walking clockwise from a start point.
pub struct RingIter<'a, T> {
    ring: &'a HashRing<T>,
    start: usize,
    walked: usize,
    seen: HashSet<usize>,
}

impl<'a, T> Iterator for RingIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.ring.points.len();
        while self.walked < total && self.seen.len() < self.ring.members.len() {
            let point = self.ring.points[(self.start + self.walked) % total];
            self.walked += 1;
            if self.seen.insert(point.member) {
                return Some(&self.ring.members[point.member]);
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "ring_test.rs"]
mod ring_test;
