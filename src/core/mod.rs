pub mod config;
pub mod error;
pub mod restart;
pub mod secrets;
pub mod shared;
