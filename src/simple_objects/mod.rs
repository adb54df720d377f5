pub mod memory_bus;
pub mod simple_cache;
pub mod simple_mem_obj;
pub mod simple_memory;
pub mod system;
pub mod traffic_gen;
