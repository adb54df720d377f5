pub mod addr_range;
pub mod error;
pub mod packet;
pub mod port;
pub mod sim_object;
pub mod simulator;
pub mod stats;
