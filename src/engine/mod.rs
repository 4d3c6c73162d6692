pub mod adapter;
pub mod dedup;
pub mod healing;
pub mod queue;
pub mod runner;
pub mod scenario;
pub mod types;
