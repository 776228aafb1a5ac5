pub mod config;
pub mod errors;
pub mod observability;
pub mod session;
pub mod util;
