use std::path::Path;

use json::JsonValue;

use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::error::ConfigError;
use crate::mem_soc::simulator::{Cycles, TICKS_PER_SECOND, Tick};
use crate::simple_objects::traffic_gen::Access;

/// Parameters of the single block cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// capacity in bytes, the cache holds exactly one block so this equals `block_size`
    pub size: usize,
    pub block_size: usize,
    /// cycles from request arrival to the response for hits and replayed misses
    pub latency: Cycles,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 64,
            block_size: 64,
            latency: 1,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_power_of_two("cache.size", self.size as u64)?;
        check_power_of_two("cache.block_size", self.block_size as u64)?;
        if self.size != self.block_size {
            return Err(ConfigError::NotSingleBlock {
                size: self.size,
                block_size: self.block_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemObjConfig {
    /// ranges the object forwards, `None` means whatever sits behind its memory port
    pub ranges: Option<Vec<AddrRange>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub forward_latency: Cycles,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { forward_latency: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub range: AddrRange,
    /// cycles between the end of the transfer and the response
    pub latency: Cycles,
    /// bytes transferred per cycle, shared by all requests
    pub bandwidth: usize,
    /// requests held at once before the memory starts rejecting
    pub queue_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            range: AddrRange::with_size(0, 1024 << 20),
            latency: 30,
            bandwidth: 16,
            queue_capacity: 4,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_zero("memory.bandwidth", self.bandwidth as u64)?;
        check_non_zero("memory.queue_capacity", self.queue_capacity as u64)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// generators -> single block cache -> bus -> memory
    Cache,
    /// generators -> blocking memory object -> bus -> memory
    MemObj,
}

impl std::str::FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Topology::Cache),
            "mem_obj" | "memobj" => Ok(Topology::MemObj),
            other => Err(ConfigError::UnknownTopology(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    /// accesses issued through the instruction side port, marked as instruction fetches
    pub inst: Vec<Access>,
    pub data: Vec<Access>,
    pub think_cycles: Cycles,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            inst: vec![
                Access::Read { addr: 0x100, size: 4 },
                Access::Read { addr: 0x108, size: 4 },
            ],
            data: vec![
                Access::Read { addr: 0x104, size: 4 },
                Access::Write { addr: 0x200, data: vec![0xEF, 0xBE, 0xAD, 0xDE] },
                Access::Read { addr: 0x200, size: 4 },
                Access::Read { addr: 0x100, size: 8 },
            ],
            think_cycles: 0,
        }
    }
}

impl WorkloadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for access in self.inst.iter().chain(self.data.iter()) {
            match access {
                Access::Read { size, .. } => check_non_zero("workload read size", *size as u64)?,
                Access::Write { data, .. } => check_non_zero("workload write size", data.len() as u64)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfig {
    pub clock_period: Tick,
    pub topology: Topology,
    pub cache: CacheConfig,
    pub mem_obj: MemObjConfig,
    pub bus: BusConfig,
    pub memory: MemoryConfig,
    pub workload: WorkloadConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            clock_period: 1000, // 1GHz
            topology: Topology::Cache,
            cache: CacheConfig::default(),
            mem_obj: MemObjConfig::default(),
            bus: BusConfig::default(),
            memory: MemoryConfig::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_zero("clock", self.clock_period)?;
        self.cache.validate()?;
        self.memory.validate()?;
        self.workload.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// every field is optional, missing ones keep their defaults
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let root = json::parse(text)?;
        let mut config = SystemConfig::default();

        if let Some(clock) = root["clock"].as_str() {
            config.clock_period = parse_clock(clock)?;
        }
        if let Some(topology) = root["topology"].as_str() {
            config.topology = topology.parse()?;
        }

        let cache = &root["cache"];
        if let Some(size) = field_u64(cache, "size")? {
            config.cache.size = size as usize;
            // a single block cache, the block defaults to the whole capacity
            config.cache.block_size = size as usize;
        }
        if let Some(block_size) = field_u64(cache, "block_size")? {
            config.cache.block_size = block_size as usize;
        }
        if let Some(latency) = field_u64(cache, "latency")? {
            config.cache.latency = latency;
        }

        if !root["mem_range"].is_null() {
            config.memory.range = parse_range(&root["mem_range"], "mem_range")?;
        }

        let mem_obj = &root["mem_obj"];
        if mem_obj["ranges"].is_array() {
            let ranges = mem_obj["ranges"]
                .members()
                .map(|r| parse_range(r, "mem_obj.ranges"))
                .collect::<Result<Vec<_>, _>>()?;
            config.mem_obj.ranges = Some(ranges);
        }

        if let Some(latency) = field_u64(&root["bus"], "forward_latency")? {
            config.bus.forward_latency = latency;
        }

        let memory = &root["memory"];
        if let Some(latency) = field_u64(memory, "latency")? {
            config.memory.latency = latency;
        }
        if let Some(bandwidth) = field_u64(memory, "bandwidth")? {
            config.memory.bandwidth = bandwidth as usize;
        }
        if let Some(capacity) = field_u64(memory, "queue_capacity")? {
            config.memory.queue_capacity = capacity as usize;
        }

        let workload = &root["workload"];
        if !workload.is_null() {
            config.workload = WorkloadConfig {
                inst: parse_accesses(&workload["inst"])?,
                data: parse_accesses(&workload["data"])?,
                think_cycles: field_u64(workload, "think_cycles")?.unwrap_or(0),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

fn check_non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn check_power_of_two(field: &'static str, value: u64) -> Result<(), ConfigError> {
    check_non_zero(field, value)?;
    if !value.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo { field, value });
    }
    Ok(())
}

/// `"1kB"`, `"1024MB"`, `"64B"`, `"0x100"` or a plain number, multiples are binary like in the wiring scripts
pub fn parse_size(text: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(text.to_string());
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid());
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: u64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "kB" | "KB" | "KiB" => 1 << 10,
        "MB" | "MiB" => 1 << 20,
        "GB" | "GiB" => 1 << 30,
        _ => return Err(invalid()),
    };
    number.checked_mul(multiplier).ok_or_else(invalid)
}

/// `"1GHz"`, `"500MHz"`, `"1ns"`, `"250ps"` into a clock period in ticks
pub fn parse_clock(text: &str) -> Result<Tick, ConfigError> {
    let invalid = || ConfigError::InvalidClock(text.to_string());
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;
    if number <= 0.0 {
        return Err(invalid());
    }

    let period = match unit.trim() {
        "Hz" => TICKS_PER_SECOND as f64 / number,
        "kHz" => TICKS_PER_SECOND as f64 / (number * 1e3),
        "MHz" => TICKS_PER_SECOND as f64 / (number * 1e6),
        "GHz" => TICKS_PER_SECOND as f64 / (number * 1e9),
        "s" => number * TICKS_PER_SECOND as f64,
        "ms" => number * 1e9,
        "us" => number * 1e6,
        "ns" => number * 1e3,
        "ps" => number,
        _ => return Err(invalid()),
    };
    let period = period.round() as Tick;
    if period == 0 {
        return Err(invalid());
    }
    Ok(period)
}

fn field_u64(object: &JsonValue, key: &'static str) -> Result<Option<u64>, ConfigError> {
    let value = &object[key];
    if value.is_null() {
        return Ok(None);
    }
    if let Some(number) = value.as_u64() {
        return Ok(Some(number));
    }
    if let Some(text) = value.as_str() {
        return parse_size(text).map(Some);
    }
    Err(ConfigError::InvalidValue {
        field: key.to_string(),
        reason: format!("expected a number or a size string, got {}", value.dump()),
    })
}

/// `{"start": "0x0", "size": "1024MB"}`, `{"start": 0, "end": 4096}` or just `"1024MB"` starting at zero
fn parse_range(value: &JsonValue, field: &str) -> Result<AddrRange, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    if let Some(text) = value.as_str() {
        let size = parse_size(text)?;
        check_non_zero("range size", size)?;
        return Ok(AddrRange::with_size(0, size));
    }

    let start = field_u64(value, "start")?.unwrap_or(0);
    let end = match (field_u64(value, "end")?, field_u64(value, "size")?) {
        (Some(end), None) => end,
        (None, Some(size)) => start.checked_add(size).ok_or_else(|| invalid("range overflows"))?,
        _ => return Err(invalid("expected exactly one of end or size")),
    };
    if end <= start {
        return Err(invalid("range is empty"));
    }
    Ok(AddrRange::new(start, end))
}

fn parse_accesses(value: &JsonValue) -> Result<Vec<Access>, ConfigError> {
    if value.is_null() {
        return Ok(vec![]);
    }
    if !value.is_array() {
        return Err(ConfigError::InvalidValue {
            field: "workload".to_string(),
            reason: "accesses must be a list".to_string(),
        });
    }
    value.members().map(parse_access).collect()
}

fn parse_access(value: &JsonValue) -> Result<Access, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        field: "workload access".to_string(),
        reason,
    };
    let addr = field_u64(value, "addr")?.ok_or_else(|| invalid("missing addr".to_string()))?;
    match value["op"].as_str() {
        Some("read") => {
            let size = field_u64(value, "size")?.unwrap_or(4) as usize;
            Ok(Access::Read { addr, size })
        }
        Some("write") => {
            let data = if value["data"].is_array() {
                value["data"]
                    .members()
                    .map(|b| b.as_u8().ok_or_else(|| invalid(format!("{} is not a byte", b.dump()))))
                    .collect::<Result<Vec<u8>, _>>()?
            } else {
                let word = field_u64(value, "value")?.ok_or_else(|| invalid("write needs data or value".to_string()))?;
                let size = field_u64(value, "size")?.unwrap_or(4) as usize;
                if size > 8 {
                    return Err(invalid(format!("value writes are at most 8 bytes, got {size}")));
                }
                word.to_le_bytes()[..size].to_vec()
            };
            Ok(Access::Write { addr, data })
        }
        other => Err(invalid(format!("unknown op {other:?}"))),
    }
}
