//! Reconciling directory entries of several containers that describe the
//! same logical object set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::zip::ZipEntry;

/// A directory entry as seen by the consolidation rule.
pub trait MemberEntry {
    fn path(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;
    /// Whether this entry deletes the member.
    fn is_tombstone(&self) -> bool;
}

impl MemberEntry for ZipEntry {
    fn path(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn is_tombstone(&self) -> bool {
        ZipEntry::is_tombstone(self)
    }
}

/// Keep one entry per path and drop deleted paths.
///
/// The most recent timestamp wins. On equal timestamps a tombstone beats
/// data, and otherwise the entry that comes later in `entries` wins. A
/// winning tombstone removes the path entirely. Survivors are returned in
/// the order their paths first appeared.
pub fn consolidate<E, I>(entries: I) -> Vec<E>
where
    E: MemberEntry,
    I: IntoIterator<Item = E>,
{
    let mut order: Vec<String> = vec![];
    let mut winners: HashMap<String, E> = HashMap::new();

    for entry in entries {
        match winners.get(entry.path()) {
            None => {
                order.push(entry.path().to_string());
                winners.insert(entry.path().to_string(), entry);
            }
            Some(current) => {
                let newer = (entry.timestamp(), entry.is_tombstone())
                    >= (current.timestamp(), current.is_tombstone());
                if newer {
                    winners.insert(entry.path().to_string(), entry);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|path| winners.remove(&path))
        .filter(|entry| {
            if entry.is_tombstone() {
                tracing::debug!(path = entry.path(), "member deleted by tombstone");
                false
            } else {
                true
            }
        })
        .collect()
}
