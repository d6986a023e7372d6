//! Service layer for vutf-server

pub mod sweeper;

pub use sweeper::Sweeper;
