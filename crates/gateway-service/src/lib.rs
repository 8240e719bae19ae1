pub mod host;
pub mod ipc;
