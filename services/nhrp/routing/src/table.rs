//! Longest-prefix-match tables

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

use crate::prefix::Prefix;
use crate::route::RibEntry;

/// Map from prefixes to values with longest-prefix-match lookup
#[derive(Debug, Clone)]
pub struct PrefixTable<T> {
    entries: HashMap<Prefix, T>,
}

impl<T> Default for PrefixTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PrefixTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the value for a prefix
    pub fn insert(&mut self, prefix: Prefix, value: T) -> Option<T> {
        self.entries.insert(prefix, value)
    }

    /// Remove a prefix
    pub fn remove(&mut self, prefix: &Prefix) -> Option<T> {
        self.entries.remove(prefix)
    }

    /// Exact match
    pub fn get(&self, prefix: &Prefix) -> Option<&T> {
        self.entries.get(prefix)
    }

    /// Most specific entry covering `addr`
    pub fn lookup(&self, addr: &IpAddr) -> Option<(Prefix, &T)> {
        let prefix = self.longest_match(addr)?;
        self.entries.get(&prefix).map(|value| (prefix, value))
    }

    /// Most specific prefix covering `addr`
    pub fn longest_match(&self, addr: &IpAddr) -> Option<Prefix> {
        let host = Prefix::host(*addr);
        (0..=host.len())
            .rev()
            .filter_map(|len| Prefix::new(*addr, len).ok())
            .find(|prefix| self.entries.contains_key(prefix))
    }

    /// Prefixes lying inside `outer`
    pub fn covered_by(&self, outer: &Prefix) -> Vec<Prefix> {
        self.entries
            .keys()
            .filter(|prefix| outer.contains_prefix(prefix))
            .copied()
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mirror of the routing information base
pub type RouteTable = PrefixTable<RibEntry>;

impl PrefixTable<RibEntry> {
    /// Apply an update from the routing subsystem; `None` withdraws
    ///
    /// Returns whether the table changed.
    pub fn update(&mut self, prefix: Prefix, entry: Option<RibEntry>) -> bool {
        match entry {
            Some(entry) => {
                debug!(
                    "Route update {} via {:?} dev {:?}",
                    prefix, entry.nexthop, entry.ifindex
                );
                self.insert(prefix, entry.clone()) != Some(entry)
            }
            None => {
                let removed = self.remove(&prefix).is_some();
                if removed {
                    debug!("Route withdraw {}", prefix);
                }
                removed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn a(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut table = RouteTable::new();
        table.update(p("0.0.0.0/0"), Some(RibEntry::via(1, a("192.0.2.254"))));
        table.update(p("10.0.0.0/8"), Some(RibEntry::connected(2)));
        table.update(p("10.1.0.0/16"), Some(RibEntry::via(3, a("10.0.0.1"))));

        let (prefix, entry) = table.lookup(&a("10.1.2.3")).unwrap();
        assert_eq!(prefix, p("10.1.0.0/16"));
        assert_eq!(entry.ifindex, Some(3));

        let (prefix, _) = table.lookup(&a("10.2.0.1")).unwrap();
        assert_eq!(prefix, p("10.0.0.0/8"));

        let (prefix, _) = table.lookup(&a("8.8.8.8")).unwrap();
        assert_eq!(prefix, p("0.0.0.0/0"));

        assert!(table.lookup(&a("fd00::1")).is_none());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_update_reports_changes() {
        let mut table = RouteTable::new();
        assert!(table.update(p("10.0.0.0/8"), Some(RibEntry::connected(2))));
        assert!(!table.update(p("10.0.0.0/8"), Some(RibEntry::connected(2))));
        assert!(table.update(p("10.0.0.0/8"), Some(RibEntry::connected(3))));
        assert!(table.update(p("10.0.0.0/8"), None));
        assert!(!table.update(p("10.0.0.0/8"), None));
        assert!(table.is_empty());
    }

    #[test]
    fn test_covered_by() {
        let mut table: PrefixTable<u32> = PrefixTable::new();
        table.insert(p("10.1.0.0/16"), 1);
        table.insert(p("10.1.2.3/32"), 2);
        table.insert(p("10.2.0.0/16"), 3);
        let mut covered = table.covered_by(&p("10.1.0.0/16"));
        covered.sort();
        assert_eq!(covered, vec![p("10.1.0.0/16"), p("10.1.2.3/32")]);
    }
}
