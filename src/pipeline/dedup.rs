use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::models::listing::{DedupKey, JobListing, KeyedListing};

/// Collapse listings that describe the same posting. Two listings belong
/// together when they share a URL or a (title, company, location)
/// fingerprint, transitively. Each group is keyed by the smallest key among
/// its members, so the key survives a change of representative. Output is in
/// display order.
pub fn deduplicate(listings: Vec<JobListing>) -> Vec<KeyedListing> {
    let mut groups = DisjointSet::new(listings.len());
    let mut by_url: HashMap<&str, usize> = HashMap::new();
    let mut by_fields = HashMap::new();

    for (i, listing) in listings.iter().enumerate() {
        if let Some(&first) = by_url.get(listing.url.as_str()) {
            groups.union(first, i);
        } else {
            by_url.insert(listing.url.as_str(), i);
        }
        if let Some(fingerprint) = listing.field_fingerprint() {
            match by_fields.get(&fingerprint) {
                Some(&first) => groups.union(first, i),
                None => {
                    by_fields.insert(fingerprint, i);
                }
            }
        }
    }

    let mut best: HashMap<usize, (usize, DedupKey)> = HashMap::new();
    for (i, listing) in listings.iter().enumerate() {
        let key = listing.dedup_key();
        match best.entry(groups.find(i)) {
            Entry::Occupied(mut slot) => {
                let (current, group_key) = slot.get_mut();
                if preference(listing, &listings[*current]) == Ordering::Less {
                    *current = i;
                }
                if key < *group_key {
                    *group_key = key;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((i, key));
            }
        }
    }

    let mut slots: Vec<Option<JobListing>> = listings.into_iter().map(Some).collect();
    let mut out: Vec<KeyedListing> = best
        .into_values()
        .filter_map(|(i, key)| slots[i].take().map(|listing| KeyedListing { key, listing }))
        .collect();
    out.sort_by(|a, b| a.listing.display_cmp(&b.listing));
    out
}

/// `Less` means `a` is the better representative. Total over distinct
/// listings, so the choice never depends on input order.
fn preference(a: &JobListing, b: &JobListing) -> Ordering {
    b.posted_at
        .is_some()
        .cmp(&a.posted_at.is_some())
        .then_with(|| {
            b.description_snippet
                .chars()
                .count()
                .cmp(&a.description_snippet.chars().count())
        })
        .then_with(|| a.source_site.cmp(&b.source_site))
        .then_with(|| a.url.cmp(&b.url))
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| b.posted_at.cmp(&a.posted_at))
        .then_with(|| a.company.cmp(&b.company))
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.description_snippet.cmp(&b.description_snippet))
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
