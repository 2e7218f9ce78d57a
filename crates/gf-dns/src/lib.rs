pub mod proxy;
pub mod upstream;
pub mod wire;

pub use proxy::*;
pub use upstream::*;

// transparent DNS proxy enforcing the egress policy per query
