pub mod common;
pub mod config;
pub mod decode;
pub mod replay;
pub mod scenario;
