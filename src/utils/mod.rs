//! Process-level helpers shared by bus components.

pub mod bootstrap;
pub mod retry;
