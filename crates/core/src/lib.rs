//! Shared types for the Tinter colourisation pipeline.
//!
//! Holds the identifiers, the domain error type, and the progress event
//! envelope that flows from the ComfyUI detectors through the job
//! pipeline to the outward progress stream.

pub mod error;
pub mod job_events;
pub mod types;
