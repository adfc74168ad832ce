pub mod errors;
pub mod events;
pub mod jobs;
pub mod operations;
pub mod runs;
