pub mod backend;
pub mod controller;
pub mod ruleset;

pub use backend::*;
pub use controller::*;
pub use ruleset::*;

// nftables JSON emitter and applier for the egress filter table
