use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::packet::Address;
use crate::mem_soc::port::PortRole;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{field} must not be zero")]
    Zero { field: &'static str },

    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: u64 },

    #[error("cache size ({size} B) must equal its block size ({block_size} B), the cache holds a single block")]
    NotSingleBlock { size: usize, block_size: usize },

    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("invalid clock {0:?}")]
    InvalidClock(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unknown topology {0:?}")]
    UnknownTopology(String),

    #[error(transparent)]
    Json(#[from] json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error("only little endian images can be loaded")]
    BigEndian,

    #[error("section {name} at {address:#x} (+{size:#x}) is outside memory range {range}")]
    OutOfRange {
        name: String,
        address: Address,
        size: u64,
        range: AddrRange,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("object {object} has no port named {port}")]
    UnknownPort { object: String, port: String },

    #[error("port {object}.{port} is a {found:?} port, expected a {expected:?} port")]
    WrongPortRole {
        object: String,
        port: String,
        found: PortRole,
        expected: PortRole,
    },

    #[error("port {object}.{port} is already connected")]
    AlreadyConnected { object: String, port: String },

    #[error("port {object}.{port} is not connected")]
    NotConnected { object: String, port: String },

    #[error("ports cannot be connected after the simulation has started")]
    AlreadyStarted,

    #[error("the simulation has not been initialized")]
    NotStarted,

    #[error("walk through the port graph did not terminate after {0} hops")]
    PortGraphLoop(usize),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),
}
