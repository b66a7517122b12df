use crate::{
    config::RoutingConfig,
    contact::Contact,
    id::{Id, IdRange},
    kbucket::{KBucket, TouchResult},
};

/// Outcome of inserting an observed contact into the routing table.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Brand new entry, routed.
    Inserted,
    /// Already routed; refreshed.
    Present,
    /// The id is the table owner's own id; never stored.
    Ignored,
    /// The covering bucket is full and doesn't span the owner's id, so it
    /// never splits. The candidate was buffered in the replacement cache;
    /// here is the stale-looking head the caller should probe (see
    /// `crate::dispatch`'s stale-eviction protocol).
    Stale(Contact),
}

/// A dynamic array of K-buckets partitioning the full 160-bit id space.
///
/// Only the bucket that covers `owner`'s own id is ever split; every other
/// full bucket evicts through the liveness-probe protocol instead of
/// growing, which is exactly what keeps the table's total size bounded by
/// `O(bucket_size * ID_LEN_BITS)` instead of growing with network size.
#[derive(Debug)]
pub struct RoutingTable {
    owner: Id,
    config: RoutingConfig,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(owner: Id, config: RoutingConfig) -> Self {
        RoutingTable {
            owner,
            config,
            buckets: vec![KBucket::new(IdRange::FULL)],
        }
    }

    fn bucket_index_for(&self, id: Id) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.range().contains(id))
            .expect("bucket ranges must partition the full id space")
    }

    pub fn contains(&self, id: Id) -> bool {
        self.buckets[self.bucket_index_for(id)].contains(id)
    }

    pub fn remove(&mut self, id: Id) -> bool {
        let index = self.bucket_index_for(id);
        self.buckets[index].remove(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn bucket_size(&self) -> usize {
        self.config.bucket_size
    }

    /// Ranges of buckets that haven't been consulted in longer than
    /// `refresh_interval`, each paired with a random id drawn from within it
    /// — maintenance's job is to issue a `FIND_NODE` for that id per bucket
    /// to keep it populated (§4.I).
    pub fn idle_bucket_refresh_targets(&self, refresh_interval: std::time::Duration) -> Vec<Id> {
        let mut rng = rand::thread_rng();
        self.buckets
            .iter()
            .filter(|bucket| bucket.last_accessed().elapsed() >= refresh_interval)
            .map(|bucket| bucket.range().sample_uniform(&mut rng))
            .collect()
    }

    /// Locates the bucket covering `id` and installs `new` at the tail in
    /// place of `old`. Used once a stale-eviction probe confirms `old` is
    /// unresponsive.
    pub fn replace_stale_head(&mut self, old: Id, new: Contact) -> bool {
        let idx = self.bucket_index_for(old);
        self.buckets[idx].replace_stale_head(old, new)
    }

    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if contact.id() == self.owner {
            return InsertOutcome::Ignored;
        }

        loop {
            let idx = self.bucket_index_for(contact.id());
            match self.buckets[idx].touch(contact.clone(), self.config.bucket_size) {
                TouchResult::Present => return InsertOutcome::Present,
                TouchResult::Inserted => return InsertOutcome::Inserted,
                TouchResult::Full(head) => {
                    if self.buckets[idx].range().contains(self.owner) {
                        let bucket = self.buckets.remove(idx);
                        let (low, high) = bucket.split();
                        self.buckets.insert(idx, high);
                        self.buckets.insert(idx, low);
                        // retry: contact now falls into one of the two halves
                        continue;
                    }
                    self.buckets[idx]
                        .buffer_replacement(contact, self.config.bucket_replacement_size);
                    return InsertOutcome::Stale(head);
                }
            }
        }
    }

    /// Returns up to `count` contacts across all buckets, sorted by
    /// ascending XOR distance to `target`. Scans every bucket (the target
    /// may be sparse while closer contacts live in a neighbouring bucket)
    /// and marks each one accessed for maintenance purposes.
    pub fn find_closest(&mut self, target: Id, count: usize) -> Vec<Contact> {
        let mut all = Vec::new();
        for bucket in &mut self.buckets {
            bucket.mark_accessed();
            all.extend(bucket.snapshot());
        }
        all.sort_by_key(|c| c.id() ^ target);
        all.truncate(count);
        all
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
    fn never_stores_owner() {
        let owner = Id::from_hex("a0");
        let mut table = RoutingTable::new(owner, RoutingConfig::default());
        assert!(matches!(table.insert(contact(owner)), InsertOutcome::Ignored));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fresh_insert_is_found_by_find_closest() {
        let owner = Id::from_hex("a0");
        let mut table = RoutingTable::new(owner, RoutingConfig::default());
        let other = Id::from_hex("a1");
        assert!(matches!(table.insert(contact(other)), InsertOutcome::Inserted));
        let found = table.find_closest(other, 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), other);
    }

    #[test]
    fn splits_only_the_bucket_covering_owner() {
        let owner = Id::ZERO;
        let mut config = RoutingConfig::default();
        config.bucket_size = 2;
        config.bucket_replacement_size = 1;
        let mut table = RoutingTable::new(owner, config);

        // All of these ids share the top bit (1) with owner's complement,
        // i.e. they are all in the bucket NOT covering owner (owner is all
        // zero bits, these ids start with a 1 bit) - that bucket must never
        // split.
        let far = [
            Id::from_hex("80"),
            Id::from_hex("81"),
            Id::from_hex("82"),
        ];
        table.insert(contact(far[0]));
        table.insert(contact(far[1]));
        // This first overflow still splits: before any split there is only
        // one bucket (the full range), which trivially covers the owner.
        match table.insert(contact(far[2])) {
            InsertOutcome::Stale(head) => assert_eq!(head.id(), far[0]),
            other => panic!("expected Stale, got {other:?}"),
        }
        let buckets_after_first_overflow = table.all_buckets().len();
        assert!(buckets_after_first_overflow >= 2);

        // Now the bucket holding far[0..2] (the one NOT covering owner)
        // never splits again; further far-side overflow stays Stale.
        let far_extra = Id::from_hex("83");
        match table.insert(contact(far_extra)) {
            InsertOutcome::Stale(_) => {}
            other => panic!("expected Stale, got {other:?}"),
        }
        assert_eq!(table.all_buckets().len(), buckets_after_first_overflow);

        // But ids sharing owner's prefix (leading zero bit) live in the
        // bucket that DOES cover the owner, and overflowing it splits.
        let near = [
            Id::from_hex("00"),
            Id::from_hex("01"),
            Id::from_hex("02"),
        ];
        table.insert(contact(near[0]));
        table.insert(contact(near[1]));
        table.insert(contact(near[2]));
        assert!(table.all_buckets().len() > buckets_after_first_overflow);
    }

    #[test]
    fn find_closest_scans_all_buckets_and_orders_by_distance() {
        let owner = Id::ZERO;
        let mut config = RoutingConfig::default();
        config.bucket_size = 1;
        let mut table = RoutingTable::new(owner, config);

        let a = Id::from_hex("10");
        let b = Id::from_hex("20");
        let c = Id::from_hex("f0");
        table.insert(contact(a));
        table.insert(contact(b));
        table.insert(contact(c));

        let target = Id::from_hex("11");
        let closest = table.find_closest(target, 3);
        let ids: Vec<Id> = closest.iter().map(Contact::id).collect();
        assert_eq!(ids[0], a);
        for w in ids.windows(2) {
            assert!((w[0] ^ target) <= (w[1] ^ target));
        }
    }
}
