use std::collections::HashMap;

use crate::attrs;
use crate::urn::Urn;
use crate::value::Value;

/// Ordered multimap from attribute to values for one subject.
///
/// Attributes keep their first-insertion order, values keep insertion order
/// within an attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: Vec<(String, Vec<Value>)>,
}

impl PropertySet {
    pub fn new() -> PropertySet {
        PropertySet::default()
    }

    #[inline]
    fn position(&self, attr: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == attr)
    }

    pub fn get(&self, attr: &str) -> Option<&[Value]> {
        self.position(attr).map(|i| &*self.entries[i].1)
    }

    pub fn first(&self, attr: &str) -> Option<&Value> {
        self.get(attr).and_then(|values| values.first())
    }

    /// Replace all values of `attr`.
    pub fn set(&mut self, attr: &str, value: Value) {
        match self.position(attr) {
            Some(i) => self.entries[i].1 = vec![value],
            None => self.entries.push((attr.to_string(), vec![value])),
        }
    }

    /// Append `value` to `attr` unless it is already present. Returns whether
    /// the value was added.
    pub fn add(&mut self, attr: &str, value: Value) -> bool {
        match self.position(attr) {
            Some(i) => {
                let values = &mut self.entries[i].1;
                if values.contains(&value) {
                    false
                } else {
                    values.push(value);
                    true
                }
            }
            None => {
                self.entries.push((attr.to_string(), vec![value]));
                true
            }
        }
    }

    /// Remove one value from `attr`, dropping the attribute when it empties.
    pub fn remove_value(&mut self, attr: &str, value: &Value) {
        if let Some(i) = self.position(attr) {
            self.entries[i].1.retain(|v| v != value);
            if self.entries[i].1.is_empty() {
                self.entries.remove(i);
            }
        }
    }

    pub fn delete(&mut self, attr: &str) {
        if let Some(i) = self.position(attr) {
            self.entries.remove(i);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), &**v))
    }

    /// Copy of this set without volatile attributes.
    pub fn persistent(&self) -> PropertySet {
        PropertySet {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| !attrs::is_volatile(k))
                .cloned()
                .collect(),
        }
    }
}

/// In-memory map from subject URN to its property set.
#[derive(Debug, Default)]
pub struct AttributeStore {
    subjects: HashMap<Urn, PropertySet>,
}

impl AttributeStore {
    pub fn new() -> AttributeStore {
        AttributeStore::default()
    }

    pub fn set(&mut self, urn: &Urn, attr: &str, value: Value) {
        self.subjects
            .entry(urn.clone())
            .or_default()
            .set(attr, value);
    }

    pub fn add(&mut self, urn: &Urn, attr: &str, value: Value) -> bool {
        self.subjects
            .entry(urn.clone())
            .or_default()
            .add(attr, value)
    }

    pub fn delete(&mut self, urn: &Urn, attr: &str) {
        if let Some(set) = self.subjects.get_mut(urn) {
            set.delete(attr);
        }
    }

    pub fn remove_value(&mut self, urn: &Urn, attr: &str, value: &Value) {
        if let Some(set) = self.subjects.get_mut(urn) {
            set.remove_value(attr, value);
        }
    }

    /// Forget everything known about `urn`.
    pub fn delete_subject(&mut self, urn: &Urn) {
        self.subjects.remove(urn);
    }

    pub fn resolve(&self, urn: &Urn, attr: &str) -> Option<&Value> {
        self.subjects.get(urn)?.first(attr)
    }

    pub fn resolve_list(&self, urn: &Urn, attr: &str) -> &[Value] {
        self.subjects
            .get(urn)
            .and_then(|set| set.get(attr))
            .unwrap_or(&[])
    }

    pub fn properties(&self, urn: &Urn) -> Option<&PropertySet> {
        self.subjects.get(urn)
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.subjects.contains_key(urn)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Urn> {
        self.subjects.keys()
    }

    /// Subjects nested below `base` (e.g. the bevies of an image), sorted.
    pub fn subjects_under(&self, base: &Urn) -> Vec<Urn> {
        let mut out: Vec<_> = self
            .subjects
            .keys()
            .filter(|urn| urn.is_under(base))
            .cloned()
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_attribute_is_absent() {
        let store = AttributeStore::new();
        let urn = Urn::new("aff4://nothing");
        assert!(store.resolve(&urn, attrs::SIZE).is_none());
        assert!(store.resolve_list(&urn, attrs::CONTAINS).is_empty());
    }

    #[test]
    fn set_replaces_add_appends_deduplicated() {
        let mut store = AttributeStore::new();
        let urn = Urn::new("aff4://v");
        store.add(&urn, attrs::CONTAINS, Value::from(Urn::new("aff4://v/a")));
        store.add(&urn, attrs::CONTAINS, Value::from(Urn::new("aff4://v/b")));
        assert!(!store.add(&urn, attrs::CONTAINS, Value::from(Urn::new("aff4://v/a"))));
        assert_eq!(
            store.resolve_list(&urn, attrs::CONTAINS),
            &[
                Value::from(Urn::new("aff4://v/a")),
                Value::from(Urn::new("aff4://v/b"))
            ]
        );

        store.set(&urn, attrs::CONTAINS, Value::from(Urn::new("aff4://v/c")));
        assert_eq!(store.resolve_list(&urn, attrs::CONTAINS).len(), 1);

        store.delete(&urn, attrs::CONTAINS);
        assert!(store.resolve(&urn, attrs::CONTAINS).is_none());
    }

    #[test]
    fn persistent_drops_volatile() {
        let mut set = PropertySet::new();
        set.set(attrs::SIZE, Value::from(10u64));
        set.set(attrs::DIRTY, Value::from(1u64));
        let persistent = set.persistent();
        assert!(persistent.get(attrs::SIZE).is_some());
        assert!(persistent.get(attrs::DIRTY).is_none());
    }

    #[test]
    fn attribute_order_is_insertion_order() {
        let mut set = PropertySet::new();
        set.set(attrs::TYPE, Value::from("aff4:image"));
        set.set(attrs::SIZE, Value::from(1u64));
        set.set(attrs::TYPE, Value::from("aff4:map"));
        let keys: Vec<_> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![attrs::TYPE, attrs::SIZE]);
    }
}
