use std::mem::MaybeUninit;

/// A simple slab allocator.
///
/// A `Slab` stores values of type `T` in a contiguous array and
/// returns stable indices that can be reused after removal.
///
/// The reactor uses it as the table of in-flight operations: the index
/// doubles as the `epoll` token, so a completion event maps straight
/// back to the operation it belongs to.
///
/// Internally, it keeps track of:
/// - initialized slots,
/// - free indices,
/// - and uninitialized memory using [`MaybeUninit`].
pub(crate) struct Slab<T> {
    /// Storage for items (may contain uninitialized slots).
    items: Vec<MaybeUninit<T>>,
    /// Stack of free indices that can be reused.
    free: Vec<usize>,
    /// Marks whether a slot is currently initialized.
    used: Vec<bool>,
    /// Number of initialized slots.
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a new `Slab` with a fixed initial capacity.
    ///
    /// All slots are initially free and uninitialized.
    pub(crate) fn new(size: usize) -> Self {
        let items = (0..size).map(|_| MaybeUninit::<T>::uninit()).collect();
        // Reversed so that low indices are handed out first.
        let free = (0..size).rev().collect();
        let used = vec![false; size];

        Self {
            items,
            free,
            used,
            len: 0,
        }
    }

    /// Inserts a value into the slab and returns its index.
    ///
    /// If a free slot is available, it is reused.
    /// Otherwise, the slab grows exponentially.
    pub(crate) fn insert(&mut self, item: T) -> usize {
        let index = if let Some(i) = self.free.pop() {
            i
        } else {
            let len = self.items.len();
            let new_len = if len == 0 { 1 } else { 2 * len };

            self.items
                .extend((len..new_len).map(|_| MaybeUninit::<T>::uninit()));
            self.free.extend(((len + 1)..new_len).rev());
            self.used.resize(new_len, false);

            len
        };

        self.items[index] = MaybeUninit::new(item);
        self.used[index] = true;
        self.len += 1;

        index
    }

    /// Removes and returns the value stored at `index`.
    ///
    /// Returns `None` if the slot is out of range or not in use, so a
    /// stale token can never read a freed slot.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        if !self.contains(index) {
            return None;
        }

        self.free.push(index);
        self.used[index] = false;
        self.len -= 1;

        // SAFETY: `used[index]` was true, so the slot is initialized, and it is
        // marked free before anyone can observe it again.
        let item = unsafe { self.items[index].assume_init_read() };
        self.items[index] = MaybeUninit::uninit();

        Some(item)
    }

    /// Returns a mutable reference to the value at `index`, if the slot is in use.
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if !self.contains(index) {
            return None;
        }

        // SAFETY: checked above that the slot is initialized.
        Some(unsafe { self.items[index].assume_init_mut() })
    }

    /// Returns `true` if `index` refers to an initialized slot.
    pub(crate) fn contains(&self, index: usize) -> bool {
        self.used.get(index).copied().unwrap_or(false)
    }

    /// Iterates over `(index, &value)` for every initialized slot.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .zip(self.used.iter())
            .enumerate()
            .filter(|(_, (_, used))| **used)
            // SAFETY: filtered on `used`, so the slot is initialized.
            .map(|(i, (slot, _))| (i, unsafe { slot.assume_init_ref() }))
    }

    /// Number of values currently stored.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl<T> Drop for Slab<T> {
    /// Drops all initialized elements stored in the slab.
    ///
    /// Uninitialized slots are ignored.
    fn drop(&mut self) {
        for (slot, &used) in self.items.iter_mut().zip(self.used.iter()) {
            if used {
                unsafe {
                    slot.assume_init_drop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Slab;

    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[test]
    fn test_slab_reuses_freed_index() {
        let mut slab = Slab::new(2);
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_ne!(a, b);

        assert_eq!(slab.remove(a), Some("a"));
        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn test_slab_stale_index_is_rejected() {
        let mut slab = Slab::new(1);
        let a = slab.insert(1);
        assert_eq!(slab.remove(a), Some(1));

        assert_eq!(slab.remove(a), None);
        assert!(slab.get_mut(a).is_none());
        assert!(slab.get_mut(99).is_none());
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_slab_grows_from_zero() {
        let mut slab = Slab::new(0);
        let indices: Vec<_> = (0..5).map(|i| slab.insert(i)).collect();

        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);

        let values: Vec<_> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(values.len(), 5);
    }

    #[test]
    fn test_slab_drop_releases_live_values() {
        let marker = Rc::new(());
        {
            let mut slab = Slab::new(4);
            slab.insert(marker.clone());
            let i = slab.insert(marker.clone());
            slab.remove(i);
            assert_eq!(Rc::strong_count(&marker), 2);
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    proptest! {
        #[test]
        fn slab_matches_map_model(ops in prop::collection::vec((any::<bool>(), 0usize..16), 0..128)) {
            let mut slab = Slab::new(4);
            let mut model: BTreeMap<usize, usize> = BTreeMap::new();

            for (step, (insert, pick)) in ops.into_iter().enumerate() {
                if insert || model.is_empty() {
                    let index = slab.insert(step);
                    prop_assert!(!model.contains_key(&index));
                    model.insert(index, step);
                } else {
                    let key = *model.keys().nth(pick % model.len()).unwrap();
                    prop_assert_eq!(slab.remove(key), model.remove(&key));
                }

                prop_assert_eq!(slab.len(), model.len());
            }

            let live: BTreeMap<usize, usize> = slab.iter().map(|(i, v)| (i, *v)).collect();
            prop_assert_eq!(live, model);
        }
    }
}
