//! Cluster-wide cache bootstrap.
//!
//! After a restart or topology change one node wins the bootstrap lease and
//! walks the keyspace segment by segment, pulling users from the durable
//! store into the distributed cache. [`SegmentProgress`] records which
//! segments are done and is persisted after every window, so an interrupted
//! run resumes rather than restarts.

pub mod coordination;
pub mod coordinator;
pub mod observe;
pub mod segments;

pub use coordination::{InMemoryLeaderElection, InMemoryProgressStore, LeaderElection, ProgressStore};
pub use coordinator::{BootstrapReport, BulkLoadCoordinator};
pub use observe::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use segments::SegmentProgress;
