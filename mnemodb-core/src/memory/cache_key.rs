/// Keys of the store's result caches.
///
/// Every key carries the category generation it was computed at. Any
/// write to a category bumps its generation, so entries from before the
/// write can no longer be hit and age out of the cache.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Query {
        category: String,
        generation: u64,
        k: usize,
        threshold_bits: u32,
        query_bits: Vec<u32>,
    },
    Record {
        category: String,
        generation: u64,
        memory_id: String,
    },
}

impl CacheKey {
    pub fn query(category: &str, generation: u64, query: &[f32], k: usize, threshold: f32) -> Self {
        CacheKey::Query {
            category: category.to_string(),
            generation,
            k,
            threshold_bits: threshold.to_bits(),
            query_bits: query.iter().map(|x| x.to_bits()).collect(),
        }
    }

    pub fn record(category: &str, generation: u64, memory_id: &str) -> Self {
        CacheKey::Record {
            category: category.to_string(),
            generation,
            memory_id: memory_id.to_string(),
        }
    }

    pub fn category(&self) -> &str {
        match self {
            CacheKey::Query { category, .. } | CacheKey::Record { category, .. } => category,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            CacheKey::Query { generation, .. } | CacheKey::Record { generation, .. } => *generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_and_generation_are_part_of_the_key() {
        let q = [0.1f32, 0.2];
        let base = CacheKey::query("episodic", 3, &q, 5, 0.5);
        assert_eq!(base, CacheKey::query("episodic", 3, &q, 5, 0.5));
        assert_ne!(base, CacheKey::query("episodic", 3, &q, 5, 0.6));
        assert_ne!(base, CacheKey::query("episodic", 4, &q, 5, 0.5));
        assert_ne!(base, CacheKey::query("semantic", 3, &q, 5, 0.5));
        assert_eq!(base.category(), "episodic");
        assert_eq!(base.generation(), 3);
    }
}
