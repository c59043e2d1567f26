pub mod events;
pub mod job;
pub mod options;
pub mod runs;
