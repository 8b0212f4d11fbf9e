pub mod compute;
pub mod config;
pub mod errors;
pub mod job;
pub mod records;
pub mod request;

pub use compute::*;
pub use config::*;
pub use errors::*;
pub use job::*;
pub use records::*;
pub use request::*;
