//! Latest-record post-filter.
//!
//! A "latest time" temporal filter passes every record on its own; only the
//! store, once it has all matches, can tell which ones are the newest of
//! their series. This pass keeps, for each group, every match whose
//! timestamp equals the group maximum, preserving the input order.

use std::collections::HashMap;
use std::hash::Hash;

use crate::types::Timestamp;

/// Keeps the newest matches of each group.
pub fn retain_latest<T, G>(
    items: Vec<T>,
    group_of: impl Fn(&T) -> G,
    time_of: impl Fn(&T) -> Timestamp,
) -> Vec<T>
where
    G: Eq + Hash,
{
    let mut newest: HashMap<G, Timestamp> = HashMap::new();
    for item in &items {
        let t = time_of(item);
        newest
            .entry(group_of(item))
            .and_modify(|max| *max = (*max).max(t))
            .or_insert(t);
    }
    items
        .into_iter()
        .filter(|item| newest.get(&group_of(item)) == Some(&time_of(item)))
        .collect()
}
