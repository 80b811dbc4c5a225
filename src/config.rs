use crate::error::StorageError;

/// Sizing parameters of a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StorageConfig {
    /// Number of entries in a single sparse page.
    pub sparse_page_size: usize,
    /// Byte budget of an archetype chunk.
    pub chunk_bytes: usize,
    /// Upper bound on the number of entities in an archetype chunk.
    pub max_chunk_entities: usize,
    /// Number of values in a single `ComponentColumn` chunk.
    pub column_chunk_capacity: usize,
}

impl StorageConfig {
    pub const DEFAULT_SPARSE_PAGE_SIZE: usize = 1024;
    pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
    pub const DEFAULT_MAX_CHUNK_ENTITIES: usize = 1024;
    pub const DEFAULT_COLUMN_CHUNK_CAPACITY: usize = 1024;

    pub fn with_sparse_page_size(mut self, size: usize) -> Self {
        self.sparse_page_size = size;
        self
    }

    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes;
        self
    }

    pub fn with_max_chunk_entities(mut self, count: usize) -> Self {
        self.max_chunk_entities = count;
        self
    }

    pub fn with_column_chunk_capacity(mut self, count: usize) -> Self {
        self.column_chunk_capacity = count;
        self
    }

    /// Checks that every size is non-zero.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.sparse_page_size == 0 {
            return Err(StorageError::InvalidConfig("sparse_page_size must be non-zero"));
        }
        if self.chunk_bytes == 0 {
            return Err(StorageError::InvalidConfig("chunk_bytes must be non-zero"));
        }
        if self.max_chunk_entities == 0 {
            return Err(StorageError::InvalidConfig("max_chunk_entities must be non-zero"));
        }
        if self.column_chunk_capacity == 0 {
            return Err(StorageError::InvalidConfig("column_chunk_capacity must be non-zero"));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            sparse_page_size: Self::DEFAULT_SPARSE_PAGE_SIZE,
            chunk_bytes: Self::DEFAULT_CHUNK_BYTES,
            max_chunk_entities: Self::DEFAULT_MAX_CHUNK_ENTITIES,
            column_chunk_capacity: Self::DEFAULT_COLUMN_CHUNK_CAPACITY,
        }
    }
}
