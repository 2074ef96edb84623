//! The sbclink daemon: SPI link between a single-board computer and
//! motion-control firmware, with a Unix-socket IPC surface for local
//! clients.

pub mod cmd;
pub mod config;
pub mod daemon;
pub mod exit;
pub mod ipc;
pub mod logging;
pub mod macros;
pub mod model;
