pub mod bmf;
pub mod config;
pub mod context;
pub mod label;
pub mod mrt;
pub mod peer;
pub mod queue;
pub mod rib;
pub mod session;
pub mod supervisor;
