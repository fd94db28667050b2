//! Small helpers shared by the walbouncer crates.

// logging setup
pub mod logging;

// Lsn type implements the log sequence number type
pub mod lsn;

// socket binding with the options we always want
pub mod tcp_listener;
