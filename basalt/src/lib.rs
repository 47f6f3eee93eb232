mod atomic_slot;
mod backend;
mod bottom;
mod config;
mod error;
mod geometry;
mod host_backend;
mod job;
mod lifecycle;
mod maths;
mod orchestrator;
mod registry;
mod resource;
mod system;
mod task;
mod top;

pub mod prelude {
    pub use crate::atomic_slot::*;
    pub use crate::backend::*;
    pub use crate::bottom::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::geometry::*;
    pub use crate::host_backend::*;
    pub use crate::job::*;
    pub use crate::lifecycle::*;
    pub use crate::maths::*;
    pub use crate::orchestrator::*;
    pub use crate::registry::*;
    pub use crate::resource::*;
    pub use crate::system::*;
    pub use crate::task::*;
    pub use crate::top::*;
}
