pub mod replay;
pub mod shared_key;
pub mod ttl_map;

pub use replay::ReplayCache;
pub use shared_key::SharedKeyCache;
pub use ttl_map::TtlMap;
