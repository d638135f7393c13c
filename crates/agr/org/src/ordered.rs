use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Insertion-ordered set: O(1) membership, O(log n) removal, iteration in
/// insertion order.
#[derive(Debug, Clone)]
pub(crate) struct OrderedSet<T: Eq + Hash + Clone> {
    index: HashMap<T, u64>,
    order: BTreeMap<u64, T>,
    next: u64,
}

impl<T: Eq + Hash + Clone> OrderedSet<T> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            order: BTreeMap::new(),
            next: 0,
        }
    }

    /// Returns false if the value was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if self.index.contains_key(&value) {
            return false;
        }
        let seq = self.next;
        self.next += 1;
        self.index.insert(value.clone(), seq);
        self.order.insert(seq, value);
        true
    }

    pub fn remove(&mut self, value: &T) -> bool {
        match self.index.remove(value) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Remove every value matching `pred`, returning them in insertion order.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let doomed: Vec<u64> = self
            .order
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(seq, _)| *seq)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for seq in doomed {
            if let Some(value) = self.order.remove(&seq) {
                self.index.remove(&value);
                removed.push(value);
            }
        }
        removed
    }

    pub fn contains(&self, value: &T) -> bool {
        self.index.contains_key(value)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.values()
    }
}

impl<T: Eq + Hash + Clone> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut set = OrderedSet::new();
        assert!(set.insert("b"));
        assert!(set.insert("a"));
        assert!(set.insert("c"));
        assert!(!set.insert("a"));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec!["b", "a", "c"]);

        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.insert("a"));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec!["b", "c", "a"]);
    }

    #[test]
    fn remove_where_returns_removed_in_order() {
        let mut set: OrderedSet<u32> = (1..=6).collect();
        let removed = set.remove_where(|v| v % 2 == 0);
        assert_eq!(removed, vec![2, 4, 6]);
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&4));
        assert!(set.contains(&5));
    }
}
