//! Domain types: stages, jobs, files and their state machines.

pub mod job;
pub mod keys;
pub mod stage;
pub mod state;

pub use job::{FileRef, Job, JobFile, WorkMessage};
pub use stage::{ChunkingParams, ChunkingStrategy, Stage, StageJob};
pub use state::{
    Advance, FileEvent, FileStatus, FileTally, JobEvent, JobStatus, TransitionError,
};
