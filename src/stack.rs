/// LIFO ordering of "current" instances keyed by window handle.
///
/// Most recent entry on top. A key appears at most once; pushing an existing
/// key moves it to the top. Removing from the middle keeps the relative order
/// of everything else, because windows close in any order.
#[derive(Debug, Clone)]
pub struct InstanceStack<K, V> {
    // bottom .. top
    entries: Vec<(K, V)>,
}

impl<K, V> Default for InstanceStack<K, V> {
    fn default() -> Self {
        InstanceStack { entries: Vec::new() }
    }
}

impl<K: PartialEq + Copy, V> InstanceStack<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: K, value: V) {
        self.remove(&key);
        self.entries.push((key, value));
    }

    pub fn pop(&mut self) -> Option<(K, V)> {
        self.entries.pop()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        // The current window is the one that usually closes.
        if self.peek().map_or(false, |(k, _)| k == key) {
            return self.pop().map(|(_, v)| v);
        }
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn peek(&self) -> Option<(&K, &V)> {
        self.entries.last().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only entries for which `keep` returns true. Returns how many were dropped.
    pub fn retain<F: FnMut(&K, &V) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, v)| keep(k, v));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top(s: &InstanceStack<u32, &'static str>) -> Option<u32> {
        s.peek().map(|(k, _)| *k)
    }

    #[test]
    fn removing_from_the_middle_keeps_order() {
        let mut s = InstanceStack::new();
        s.push(1, "h1");
        s.push(2, "h2");
        s.push(3, "h3");
        assert_eq!(s.remove(&2), Some("h2"));
        assert_eq!(top(&s), Some(3));
        s.remove(&3);
        assert_eq!(top(&s), Some(1));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn push_existing_key_moves_it_to_top() {
        let mut s = InstanceStack::new();
        s.push(1, "a");
        s.push(2, "b");
        s.push(1, "c");
        assert_eq!(s.len(), 2);
        assert_eq!(s.peek(), Some((&1, &"c")));
        assert_eq!(s.pop(), Some((1, "c")));
        assert_eq!(top(&s), Some(2));
    }

    #[test]
    fn pop_and_remove_on_empty() {
        let mut s: InstanceStack<u32, &str> = InstanceStack::new();
        assert!(s.pop().is_none());
        assert!(s.remove(&9).is_none());
        assert!(s.peek().is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn retain_reports_dropped_count() {
        let mut s = InstanceStack::new();
        s.push(1, "dead");
        s.push(2, "live");
        s.push(3, "dead");
        assert_eq!(s.retain(|_, v| *v == "live"), 2);
        assert_eq!(s.peek(), Some((&2, &"live")));
        assert_eq!(s.len(), 1);
    }
}
