pub mod download;
pub mod jobs;
pub mod progress;
