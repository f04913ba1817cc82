use std::sync::Arc;

/// Append-only handle table for objects referenced by one batch.
///
/// Every `cache` call hands out a new index, even for an object that is
/// already present. The table keeps each object alive until `clear`.
#[derive(Debug)]
pub struct CacheVector<T: ?Sized> {
    items: Vec<Arc<T>>,
}

impl<T: ?Sized> CacheVector<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn cache(&mut self, item: Arc<T>) -> usize {
        let index = self.items.len();
        self.items.push(item);
        index
    }

    pub fn get(&self, index: usize) -> &Arc<T> {
        match self.items.get(index) {
            Some(item) => item,
            None => panic!(
                "cache handle {index} out of range ({} entries)",
                self.items.len()
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: ?Sized> Default for CacheVector<T> {
    fn default() -> Self {
        Self::new()
    }
}
