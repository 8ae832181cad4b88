use std::fmt;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 1000-1099: Category/record errors
    UnknownCategory = 1001,
    CategoryExists = 1002,
    DuplicateMemoryId = 1003,
    NotFound = 1004,
    VectorDimensionMismatch = 1005,

    /// 1100-1199: Clustering errors
    InvalidClusterId = 1101,
    ClusterTooSmall = 1102,

    /// 1200-1299: Cache errors
    CapacityExceeded = 1201,

    /// 1300-1399: Collaborator errors
    EmbeddingUnavailable = 1301,
    CollaboratorUnavailable = 1302,

    /// 1400-1499: Persistence errors
    PersistenceFailure = 1401,

    /// 1500-1599: Background task errors
    AlreadyRunning = 1501,

    /// 1700-1799: Configuration errors
    ConfigError = 1701,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownCategory => "UNKNOWN_CATEGORY",
            ErrorCode::CategoryExists => "CATEGORY_EXISTS",
            ErrorCode::DuplicateMemoryId => "DUPLICATE_MEMORY_ID",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::VectorDimensionMismatch => "VECTOR_DIMENSION_MISMATCH",
            ErrorCode::InvalidClusterId => "INVALID_CLUSTER_ID",
            ErrorCode::ClusterTooSmall => "CLUSTER_TOO_SMALL",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::EmbeddingUnavailable => "EMBEDDING_UNAVAILABLE",
            ErrorCode::CollaboratorUnavailable => "COLLABORATOR_UNAVAILABLE",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Structural errors point at caller misuse and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownCategory
                | ErrorCode::InvalidClusterId
                | ErrorCode::ClusterTooSmall
                | ErrorCode::VectorDimensionMismatch
        )
    }
}

/// External services the store leans on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Embedding,
    Relevance,
    TaskBackend,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Embedding => write!(f, "embedding service"),
            Collaborator::Relevance => write!(f, "relevance service"),
            Collaborator::TaskBackend => write!(f, "task backend"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MnemoError {
    /// No index registered for the category
    UnknownCategory(String),
    /// Category registered twice
    CategoryExists(String),
    /// Cluster id absent from the category's cluster table
    InvalidClusterId { category: String, cluster_id: u64 },
    /// Split requested on a cluster with fewer than two live members
    ClusterTooSmall { cluster_id: u64, size: usize },
    /// Cache entry larger than the remaining budget
    CapacityExceeded { required: usize, budget: usize },
    /// Embedding/relevance/task backend failed
    CollaboratorUnavailable { collaborator: Collaborator, message: String },
    /// Save/load I/O or (de)serialization error
    PersistenceFailure(String),
    /// Vector length does not match the category's index
    VectorDimensionMismatch { expected: usize, got: usize },
    /// Memory id already live in the category
    DuplicateMemoryId(String),
    /// Record not found
    NotFound(String),
    /// Background task started twice
    AlreadyRunning(String),
    /// Invalid configuration
    ConfigError { message: String },
}

impl MnemoError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MnemoError::UnknownCategory(_) => ErrorCode::UnknownCategory,
            MnemoError::CategoryExists(_) => ErrorCode::CategoryExists,
            MnemoError::InvalidClusterId { .. } => ErrorCode::InvalidClusterId,
            MnemoError::ClusterTooSmall { .. } => ErrorCode::ClusterTooSmall,
            MnemoError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            MnemoError::CollaboratorUnavailable { collaborator: Collaborator::Embedding, .. } => {
                ErrorCode::EmbeddingUnavailable
            }
            MnemoError::CollaboratorUnavailable { .. } => ErrorCode::CollaboratorUnavailable,
            MnemoError::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            MnemoError::VectorDimensionMismatch { .. } => ErrorCode::VectorDimensionMismatch,
            MnemoError::DuplicateMemoryId(_) => ErrorCode::DuplicateMemoryId,
            MnemoError::NotFound(_) => ErrorCode::NotFound,
            MnemoError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            MnemoError::ConfigError { .. } => ErrorCode::ConfigError,
        }
    }

    pub(crate) fn persistence(context: &str, err: impl fmt::Display) -> Self {
        MnemoError::PersistenceFailure(format!("{}: {}", context, err))
    }

    pub(crate) fn collaborator(collaborator: Collaborator, err: impl fmt::Display) -> Self {
        MnemoError::CollaboratorUnavailable {
            collaborator,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for MnemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MnemoError::UnknownCategory(name) => {
                write!(f, "[{}] Unknown category: {}", self.code().as_str(), name)
            }
            MnemoError::CategoryExists(name) => {
                write!(f, "[{}] Category already exists: {}", self.code().as_str(), name)
            }
            MnemoError::InvalidClusterId { category, cluster_id } => {
                write!(f, "[{}] Cluster {} not found in category {}",
                    self.code().as_str(), cluster_id, category)
            }
            MnemoError::ClusterTooSmall { cluster_id, size } => {
                write!(f, "[{}] Cluster {} has {} live member(s), need at least 2",
                    self.code().as_str(), cluster_id, size)
            }
            MnemoError::CapacityExceeded { required, budget } => {
                write!(f, "[{}] Entry of {} bytes does not fit a {} byte budget",
                    self.code().as_str(), required, budget)
            }
            MnemoError::CollaboratorUnavailable { collaborator, message } => {
                write!(f, "[{}] {} unavailable: {}", self.code().as_str(), collaborator, message)
            }
            MnemoError::PersistenceFailure(msg) => {
                write!(f, "[{}] Persistence failure: {}", self.code().as_str(), msg)
            }
            MnemoError::VectorDimensionMismatch { expected, got } => {
                write!(f, "[{}] Vector dimension mismatch: expected {}, got {}",
                    self.code().as_str(), expected, got)
            }
            MnemoError::DuplicateMemoryId(id) => {
                write!(f, "[{}] Duplicate memory id: {}", self.code().as_str(), id)
            }
            MnemoError::NotFound(context) => {
                write!(f, "[{}] Not found: {}", self.code().as_str(), context)
            }
            MnemoError::AlreadyRunning(task) => {
                write!(f, "[{}] {} already running", self.code().as_str(), task)
            }
            MnemoError::ConfigError { message } => {
                write!(f, "[{}] Config error: {}", self.code().as_str(), message)
            }
        }
    }
}

impl std::error::Error for MnemoError {}

pub type Result<T> = std::result::Result<T, MnemoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_failure_has_its_own_code() {
        let err = MnemoError::collaborator(Collaborator::Embedding, "timeout");
        assert_eq!(err.code(), ErrorCode::EmbeddingUnavailable);

        let err = MnemoError::collaborator(Collaborator::Relevance, "timeout");
        assert_eq!(err.code(), ErrorCode::CollaboratorUnavailable);
    }

    #[test]
    fn test_display_carries_code() {
        let err = MnemoError::ClusterTooSmall { cluster_id: 7, size: 1 };
        let text = err.to_string();
        assert!(text.starts_with("[CLUSTER_TOO_SMALL]"));
        assert!(text.contains("7"));
    }

    #[test]
    fn test_structural_classification() {
        assert!(ErrorCode::UnknownCategory.is_structural());
        assert!(ErrorCode::ClusterTooSmall.is_structural());
        assert!(!ErrorCode::PersistenceFailure.is_structural());
        assert!(!ErrorCode::CollaboratorUnavailable.is_structural());
    }
}
