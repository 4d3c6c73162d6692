pub mod error_patterns;
pub mod runs;
