pub mod catalog;
pub mod dataset;
pub mod jobs;

pub use catalog::*;
pub use dataset::*;
pub use jobs::*;
