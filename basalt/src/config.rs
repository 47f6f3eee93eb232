use crate::{error::AccelError, lifecycle::MAX_FRAMES_IN_FLIGHT};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub registry_capacity: usize,
    pub frames_in_flight: usize,
    /// Frames to wait after a publication before another spawn, twice the frames in flight if unset.
    pub cooldown_frames: Option<u32>,
    pub failure_cooldown_frames: u32,
    pub dependency_timeout_ms: u64,
    pub worker_threads: usize,
    pub max_concurrent_top_builds: usize,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            registry_capacity: 4096,
            frames_in_flight: 2,
            cooldown_frames: None,
            failure_cooldown_frames: 8,
            dependency_timeout_ms: 10_000,
            worker_threads: 4,
            max_concurrent_top_builds: 2,
        }
    }
}

impl AccelConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AccelError> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).map_err(|err| AccelError::ConfigIo(format!("{}: {}", path.display(), err)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, AccelError> {
        let config: Self = serde_json::from_str(text).map_err(|err| AccelError::InvalidConfig(err.to_string()))?;
        config.validated()
    }

    pub fn cooldown_frames(&self) -> u32 {
        self.cooldown_frames.unwrap_or(2 * self.frames_in_flight as u32)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn validated(self) -> Result<Self, AccelError> {
        let fail = |msg: String| {
            log::error!("invalid configuration: {}", msg);
            Err(AccelError::InvalidConfig(msg))
        };
        if self.registry_capacity == 0 {
            return fail("registry_capacity must be non-zero".to_owned());
        }
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return fail(format!(
                "frames_in_flight must be between 1 and {}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            ));
        }
        if self.dependency_timeout_ms == 0 {
            return fail("dependency_timeout_ms must be non-zero".to_owned());
        }
        if self.max_concurrent_top_builds == 0 || self.max_concurrent_top_builds >= self.worker_threads {
            return fail(format!(
                "max_concurrent_top_builds must be between 1 and worker_threads - 1 ({}), got {}",
                self.worker_threads.saturating_sub(1),
                self.max_concurrent_top_builds
            ));
        }
        Ok(self)
    }
}
