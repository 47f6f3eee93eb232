use crate::geometry::GeometryId;
use crate::job::JobId;
use thiserror::Error;

/// Failure reported by a build backend. Recoverable: a later frame may retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("invalid geometry {id}: {reason}")]
    InvalidGeometry { id: GeometryId, reason: String },

    #[error("instance count {count} exceeds limit {limit}")]
    InstanceLimit { count: usize, limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccelError {
    /// Geometry id does not fit the registry. This is a configuration bug and is never retried.
    #[error("geometry {id} exceeds registry capacity {capacity}")]
    CapacityExceeded { id: GeometryId, capacity: usize },

    #[error("build failed{}: {source}", for_geometry(.id))]
    Build {
        id: Option<GeometryId>,
        #[source]
        source: BuildError,
    },

    #[error("job {job} timed out waiting for dependencies ({filled}/{expected} filled)")]
    DependencyTimeout { job: JobId, filled: u32, expected: u32 },

    #[error("job {job} has no result for geometry {geometry} after all dependencies reported")]
    MissingSlot { job: JobId, geometry: GeometryId },

    #[error("job {job} was abandoned before reporting a result")]
    Abandoned { job: JobId },

    #[error("unknown structure set {0:?}")]
    UnknownSet(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    ConfigIo(String),
}

fn for_geometry(id: &Option<GeometryId>) -> String {
    id.map(|id| format!(" for geometry {}", id)).unwrap_or_default()
}

impl AccelError {
    /// Fatal errors stop further rebuild attempts for the affected structure set.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AccelError::CapacityExceeded { .. } | AccelError::InvalidConfig(_) | AccelError::UnknownSet(_)
        )
    }
}

impl From<BuildError> for AccelError {
    fn from(source: BuildError) -> Self {
        AccelError::Build { id: None, source }
    }
}
