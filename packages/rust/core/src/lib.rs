//! Core pipeline orchestration and domain logic for StreamDigest.
//!
//! This crate ties together ingestion, candidate generation, the selection
//! stage machine and newsletter assembly into [`DigestPipeline`].

pub mod assembler;
pub mod banner;
pub mod generation;
pub mod pipeline;
pub mod prompts;
pub mod ratelimit;
pub mod retry;
pub mod session;

pub use assembler::{
    Assembler, AssemblyInput, LinkCache, LinkResolver, image_extension, write_document,
};
pub use generation::{BatchProgress, Generator, NoBatchProgress};
pub use pipeline::{
    DigestPipeline, PipelineConfig, ProgressReporter, Services, SessionStarted, SilentProgress,
};
pub use ratelimit::{RateLimiters, TokenBucket};
pub use session::{SelectionSession, Transition, next_stage};
