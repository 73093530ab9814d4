pub mod config;
pub mod frame;
pub mod gpio;
pub mod signal;
