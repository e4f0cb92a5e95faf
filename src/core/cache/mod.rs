use crate::core::model::CacheLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub layer: usize,
    pub position: usize,
}

impl CacheKey {
    pub fn new(layer: usize, position: usize) -> Self {
        Self { layer, position }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("kv cache overflow: {len} + {requested} > {capacity}")]
    Overflow {
        len: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("kv cache index out of range: layer {layer}, position {position}")]
    OutOfRange { layer: usize, position: usize },

    #[error("kv cache row width mismatch: expected {expected}, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },
}

/// Fixed-capacity key/value arena addressed by `(layer, position)`.
///
/// Both buffers are allocated once for `context_limit` positions and never
/// grow. Rows at positions `>= len()` may be written ahead of time and
/// become visible when [`KvCache::advance`] commits them.
pub struct KvCache {
    layers: usize,
    hidden_size: usize,
    capacity: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    len: usize,
}

impl KvCache {
    pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

    pub fn new(layout: CacheLayout, context_limit: usize) -> Self {
        let elements = layout.layers * context_limit * layout.hidden_size;
        Self {
            layers: layout.layers,
            hidden_size: layout.hidden_size,
            capacity: context_limit,
            keys: vec![0.0; elements],
            values: vec![0.0; elements],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of positions the arena can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    pub fn layout(&self) -> CacheLayout {
        CacheLayout {
            layers: self.layers,
            hidden_size: self.hidden_size,
        }
    }

    /// Bytes held by one of the two buffers.
    pub fn buffer_bytes(&self) -> usize {
        self.keys.len() * Self::ELEMENT_SIZE
    }

    fn offset(&self, key: CacheKey) -> Result<usize, CacheError> {
        if key.layer >= self.layers || key.position >= self.capacity {
            return Err(CacheError::OutOfRange {
                layer: key.layer,
                position: key.position,
            });
        }
        Ok((key.layer * self.capacity + key.position) * self.hidden_size)
    }

    pub fn write(&mut self, key: CacheKey, k: &[f32], v: &[f32]) -> Result<(), CacheError> {
        for row in [k, v] {
            if row.len() != self.hidden_size {
                return Err(CacheError::WidthMismatch {
                    expected: self.hidden_size,
                    actual: row.len(),
                });
            }
        }

        let start = self.offset(key)?;
        let end = start + self.hidden_size;
        self.keys[start..end].copy_from_slice(k);
        self.values[start..end].copy_from_slice(v);
        Ok(())
    }

    /// Committed key and value rows; `None` past `len()`.
    pub fn get(&self, key: CacheKey) -> Option<(&[f32], &[f32])> {
        if key.position >= self.len {
            return None;
        }
        let start = self.offset(key).ok()?;
        let end = start + self.hidden_size;
        Some((&self.keys[start..end], &self.values[start..end]))
    }

    /// All committed key rows of one layer, position-major.
    pub fn layer_keys(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.keys, layer)
    }

    pub fn layer_values(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.values, layer)
    }

    fn layer_slice<'a>(&self, buffer: &'a [f32], layer: usize) -> &'a [f32] {
        if layer >= self.layers {
            return &[];
        }
        let start = layer * self.capacity * self.hidden_size;
        &buffer[start..start + self.len * self.hidden_size]
    }

    /// Commits `positions` more rows.
    pub fn advance(&mut self, positions: usize) -> Result<(), CacheError> {
        if self.len + positions > self.capacity {
            return Err(CacheError::Overflow {
                len: self.len,
                requested: positions,
                capacity: self.capacity,
            });
        }
        self.len += positions;
        Ok(())
    }

    /// Forgets every position at or after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("layers", &self.layers)
            .field("hidden_size", &self.hidden_size)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> CacheLayout {
        CacheLayout {
            layers: 2,
            hidden_size: 3,
        }
    }

    #[test]
    fn test_capacity_is_fixed_at_construction() {
        let cache = KvCache::new(layout(), 16);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 16);
        assert_eq!(cache.buffer_bytes(), 2 * 16 * 3 * KvCache::ELEMENT_SIZE);
    }

    #[test]
    fn test_write_then_commit() {
        let mut cache = KvCache::new(layout(), 4);
        cache.write(CacheKey::new(1, 0), &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();

        assert!(cache.get(CacheKey::new(1, 0)).is_none());
        cache.advance(1).unwrap();

        let (k, v) = cache.get(CacheKey::new(1, 0)).unwrap();
        assert_eq!(k, &[1.0, 2.0, 3.0]);
        assert_eq!(v, &[4.0, 5.0, 6.0]);
        assert_eq!(cache.layer_keys(1), &[1.0, 2.0, 3.0]);
        assert_eq!(cache.layer_keys(0), &[0.0, 0.0, 0.0]);
        assert_eq!(cache.layer_values(1), &[4.0, 5.0, 6.0]);
        assert!(cache.layer_values(2).is_empty());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut cache = KvCache::new(layout(), 4);
        cache.advance(3).unwrap();
        assert_eq!(
            cache.advance(2),
            Err(CacheError::Overflow {
                len: 3,
                requested: 2,
                capacity: 4
            })
        );
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.remaining(), 1);
    }

    #[test]
    fn test_out_of_range_and_width() {
        let mut cache = KvCache::new(layout(), 4);
        assert!(matches!(
            cache.write(CacheKey::new(2, 0), &[0.0; 3], &[0.0; 3]),
            Err(CacheError::OutOfRange { .. })
        ));
        assert!(matches!(
            cache.write(CacheKey::new(0, 4), &[0.0; 3], &[0.0; 3]),
            Err(CacheError::OutOfRange { .. })
        ));
        assert!(matches!(
            cache.write(CacheKey::new(0, 0), &[0.0; 2], &[0.0; 3]),
            Err(CacheError::WidthMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_truncate_and_clear() {
        let mut cache = KvCache::new(layout(), 8);
        cache.advance(5).unwrap();
        cache.truncate(7);
        assert_eq!(cache.len(), 5);
        cache.truncate(2);
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 8);
    }
}
