//! TaskRelay Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/MCP transport
//! - Storage
//! - Runtime specifics
//!
//! All types here represent the core business domain of TaskRelay:
//! tasks routed to external AI execution engines, the origin metadata
//! used to stop delegation loops, and the workload analyzer that ranks
//! engines for a request.

pub mod engine;
pub mod error;
pub mod ids;
pub mod origin;
pub mod status;
pub mod task;
pub mod workload;

// Re-export commonly used types
pub use engine::{Engine, EngineChoice};
pub use error::CoreError;
pub use ids::TaskId;
pub use origin::OriginContext;
pub use status::TaskStatus;
pub use task::{Task, TaskType};
pub use workload::{
    Complexity, PriorityLevel, Recommendation, SizeClass, WorkloadAnalyzer,
    WorkloadCharacteristics, WorkloadRequest,
};
