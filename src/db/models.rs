mod error_pattern;
mod run;

pub use error_pattern::*;
pub use run::*;
