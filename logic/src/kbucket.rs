use std::time::Instant;

use crate::{contact::Contact, id::Id, id::IdRange};

/// Outcome of touching a bucket with an observed contact.
#[derive(Debug)]
pub enum TouchResult {
    /// The id was already present; it has been refreshed and moved to the
    /// tail (most-recently-seen).
    Present,
    /// The bucket had room; the contact was appended at the tail.
    Inserted,
    /// The bucket is full and does not contain the contact's id; here is its
    /// current head (least-recently-seen) so the caller can decide whether
    /// to probe it for staleness.
    Full(Contact),
}

/// A bounded, LRU-ordered list of contacts covering one range of the id
/// space, plus a small replacement cache of candidates waiting for a slot.
#[derive(Debug)]
pub struct KBucket {
    range: IdRange,
    entries: Vec<Contact>,
    replacement_cache: Vec<Contact>,
    last_accessed: Instant,
}

impl KBucket {
    pub fn new(range: IdRange) -> Self {
        KBucket {
            range,
            entries: Vec::new(),
            replacement_cache: Vec::new(),
            last_accessed: Instant::now(),
        }
    }

    pub fn range(&self) -> IdRange {
        self.range
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// Marks this bucket as having just been consulted (e.g. by a
    /// `find_closest` scan), resetting its idle clock for maintenance.
    pub fn mark_accessed(&mut self) {
        self.last_accessed = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.entries.iter().any(|c| c.id() == id)
            || self.replacement_cache.iter().any(|c| c.id() == id)
    }

    pub fn snapshot(&self) -> Vec<Contact> {
        self.entries.clone()
    }

    pub fn head(&self) -> Option<&Contact> {
        self.entries.first()
    }

    pub fn touch(&mut self, contact: Contact, bucket_size: usize) -> TouchResult {
        if let Some(index) = self.entries.iter().position(|c| c.id() == contact.id()) {
            self.entries[index] = contact;
            self.entries[index..].rotate_left(1);
            return TouchResult::Present;
        }

        if self.entries.len() < bucket_size {
            self.entries.push(contact);
            return TouchResult::Inserted;
        }

        TouchResult::Full(self.entries[0].clone())
    }

    /// Buffers a candidate that arrived while the bucket was full, evicting
    /// the oldest buffered candidate if the cache itself is full.
    pub fn buffer_replacement(&mut self, contact: Contact, replacement_size: usize) {
        if self.replacement_cache.iter().any(|c| c.id() == contact.id()) {
            return;
        }
        if self.replacement_cache.len() >= replacement_size {
            self.replacement_cache.remove(0);
        }
        self.replacement_cache.push(contact);
    }

    pub fn remove(&mut self, id: Id) -> bool {
        if let Some(index) = self.entries.iter().position(|c| c.id() == id) {
            self.entries.remove(index);
            if !self.replacement_cache.is_empty() {
                self.entries.push(self.replacement_cache.remove(0));
            }
            true
        } else if let Some(index) = self.replacement_cache.iter().position(|c| c.id() == id) {
            self.replacement_cache.remove(index);
            true
        } else {
            false
        }
    }

    /// Atomically evicts `old` and installs `new` at the tail, used by the
    /// stale-eviction protocol once a probe confirms `old` is unresponsive.
    pub fn replace_stale_head(&mut self, old: Id, new: Contact) -> bool {
        if let Some(index) = self.entries.iter().position(|c| c.id() == old) {
            self.entries.remove(index);
            self.entries.push(new);
            true
        } else {
            false
        }
    }

    /// Splits this bucket's entries and replacement cache between the two
    /// halves produced by `self.range().split()`.
    pub fn split(self) -> (KBucket, KBucket) {
        let (low_range, high_range) = self.range.split();
        let mut low = KBucket::new(low_range);
        let mut high = KBucket::new(high_range);

        for contact in self.entries {
            if low_range.contains(contact.id()) {
                low.entries.push(contact);
            } else {
                high.entries.push(contact);
            }
        }
        for contact in self.replacement_cache {
            if low_range.contains(contact.id()) {
                low.replacement_cache.push(contact);
            } else {
                high.replacement_cache.push(contact);
            }
        }
        (low, high)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn contact(id: Id) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 1234)
    }

    #[test]
    fn touch_inserts_then_marks_present() {
        let mut bucket = KBucket::new(IdRange::FULL);
        let id = Id::from_hex("aa");
        assert!(matches!(bucket.touch(contact(id), 2), TouchResult::Inserted));
        assert_eq!(bucket.len(), 1);
        assert!(matches!(bucket.touch(contact(id), 2), TouchResult::Present));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn touch_reports_full_with_head() {
        let mut bucket = KBucket::new(IdRange::FULL);
        let a = Id::from_hex("aa");
        let b = Id::from_hex("bb");
        let c = Id::from_hex("cc");
        bucket.touch(contact(a), 2);
        bucket.touch(contact(b), 2);
        match bucket.touch(contact(c), 2) {
            TouchResult::Full(head) => assert_eq!(head.id(), a),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn remove_promotes_from_replacement_cache() {
        let mut bucket = KBucket::new(IdRange::FULL);
        let a = Id::from_hex("aa");
        let b = Id::from_hex("bb");
        let c = Id::from_hex("cc");
        bucket.touch(contact(a), 2);
        bucket.touch(contact(b), 2);
        bucket.buffer_replacement(contact(c), 1);

        assert!(bucket.remove(a));
        assert_eq!(bucket.len(), 2);
        assert!(bucket.contains(c));
    }

    #[test]
    fn split_partitions_by_range() {
        let mut bucket = KBucket::new(IdRange::FULL);
        let low_id = Id::ZERO;
        let high_id = Id([0xFF; crate::consts::ID_LEN]);
        bucket.touch(contact(low_id), 4);
        bucket.touch(contact(high_id), 4);

        let (low, high) = bucket.split();
        assert!(low.contains(low_id));
        assert!(!low.contains(high_id));
        assert!(high.contains(high_id));
        assert!(!high.contains(low_id));
    }
}
