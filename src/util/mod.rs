//! Small helpers shared by the binary and the bootstraps

pub mod time;
