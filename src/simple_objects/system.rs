use crossbeam_channel::{Receiver, unbounded};

use crate::config::{SystemConfig, Topology};
use crate::mem_soc::error::SimError;
use crate::mem_soc::port::vector_port_name;
use crate::mem_soc::sim_object::{ObjectId, SimObject};
use crate::mem_soc::simulator::Simulator;
use crate::simple_objects::memory_bus::MemoryBus;
use crate::simple_objects::simple_cache::SingleBlockCache;
use crate::simple_objects::simple_mem_obj::BlockingMemoryObject;
use crate::simple_objects::simple_memory::SimpleMemory;
use crate::simple_objects::traffic_gen::{Completion, TrafficGen, TrafficGenConfig};

/// A wired but not yet initialized system
pub struct BuiltSystem {
    pub sim: Simulator,
    pub inst_gen: ObjectId,
    pub data_gen: ObjectId,
    /// the cache or the blocking memory object, depending on the topology
    pub hub: ObjectId,
    pub bus: ObjectId,
    pub memory: ObjectId,
    pub completions: Receiver<Completion>,
}

pub fn build_system(config: &SystemConfig) -> Result<BuiltSystem, SimError> {
    match config.topology {
        Topology::Cache => build_cache_system(config),
        Topology::MemObj => build_mem_obj_system(config),
    }
}

/// generators, then everything behind the hub, the hub itself is added by the caller
fn build_common(config: &SystemConfig, hub: Box<dyn SimObject>) -> Result<BuiltSystem, SimError> {
    config.validate()?;

    let mut sim = Simulator::new(config.clock_period);
    let (sender, completions) = unbounded();

    let inst_gen = sim.add_object(Box::new(TrafficGen::new(
        "system.cpu.inst_gen",
        config.workload.inst.clone(),
        TrafficGenConfig {
            think_cycles: config.workload.think_cycles,
            inst_fetch: true,
            ..TrafficGenConfig::default()
        },
        sender.clone(),
    )));
    let data_gen = sim.add_object(Box::new(TrafficGen::new(
        "system.cpu.data_gen",
        config.workload.data.clone(),
        TrafficGenConfig {
            think_cycles: config.workload.think_cycles,
            ..TrafficGenConfig::default()
        },
        sender,
    )));
    let hub = sim.add_object(hub);
    let bus = sim.add_object(Box::new(MemoryBus::new("system.membus", 1, 1, &config.bus)));
    let memory = sim.add_object(Box::new(SimpleMemory::new("system.mem_ctrl", &config.memory)));

    Ok(BuiltSystem {
        sim,
        inst_gen,
        data_gen,
        hub,
        bus,
        memory,
        completions,
    })
}

fn connect_memory_side(system: &mut BuiltSystem) -> Result<(), SimError> {
    let sim = &mut system.sim;
    sim.connect(system.hub, "mem_port", system.bus, "cpu_side_ports[0]")?;
    sim.connect(system.bus, "mem_side_ports[0]", system.memory, "port")?;
    Ok(())
}

/// inst and data generators -> single block cache -> bus -> memory
pub fn build_cache_system(config: &SystemConfig) -> Result<BuiltSystem, SimError> {
    let cache = SingleBlockCache::new("system.cache", 2, &config.cache);
    let mut system = build_common(config, Box::new(cache))?;
    for (i, generator) in [system.inst_gen, system.data_gen].into_iter().enumerate() {
        system
            .sim
            .connect(generator, "port", system.hub, &vector_port_name("cpu_ports", i))?;
    }
    connect_memory_side(&mut system)?;
    Ok(system)
}

/// inst and data generators -> blocking memory object -> bus -> memory
pub fn build_mem_obj_system(config: &SystemConfig) -> Result<BuiltSystem, SimError> {
    let mem_obj = BlockingMemoryObject::new("system.mem_obj", &config.mem_obj);
    let mut system = build_common(config, Box::new(mem_obj))?;
    system.sim.connect(system.inst_gen, "port", system.hub, "inst_port")?;
    system.sim.connect(system.data_gen, "port", system.hub, "data_port")?;
    connect_memory_side(&mut system)?;
    Ok(system)
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::VecDeque;

    use super::*;
    use crate::config::{CacheConfig, MemObjConfig, MemoryConfig, WorkloadConfig};
    use crate::mem_soc::addr_range::AddrRange;
    use crate::mem_soc::packet::{
        Address, MemoryRequest, MemoryRequestType, MemoryResponse, MemoryResponseType, RequestId, RequestorId,
    };
    use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
    use crate::mem_soc::simulator::{ExitCause, SimContext};
    use crate::simple_objects::simple_mem_obj::MemObjState;
    use crate::simple_objects::traffic_gen::Access;

    const SEND_NEXT: u64 = 0;

    /// Sends its next read as soon as the previous one is accepted, without waiting for responses
    struct Pipelined {
        accesses: VecDeque<(Address, usize)>,
        sent: Vec<RequestId>,
        responses: Vec<(RequestId, MemoryResponseType)>,
    }

    impl Pipelined {
        fn new(accesses: &[(Address, usize)]) -> Self {
            Self {
                accesses: accesses.iter().copied().collect(),
                sent: vec![],
                responses: vec![],
            }
        }

        fn send_next(&mut self, ctx: &mut SimContext) {
            let Some((address, size)) = self.accesses.pop_front() else {
                return;
            };
            let id = ctx.next_request_id();
            let request = MemoryRequest::read(id, ctx.requestor_id(), address, size);
            self.sent.push(id);
            ctx.send_timing_req(PortId(0), request);
        }

        fn response_ids(&self) -> Vec<RequestId> {
            self.responses.iter().map(|(id, _)| *id).collect()
        }

        fn statuses(&self) -> Vec<MemoryResponseType> {
            self.responses.iter().map(|(_, status)| *status).collect()
        }
    }

    impl SimObject for Pipelined {
        fn name(&self) -> &str {
            "pipelined"
        }

        fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
            (if_name == "port" && idx.is_none()).then_some((PortId(0), PortRole::Request))
        }

        fn startup(&mut self, ctx: &mut SimContext) {
            ctx.schedule(0, SEND_NEXT);
        }

        fn process_event(&mut self, ctx: &mut SimContext, _token: u64) {
            self.send_next(ctx);
        }

        fn recv_timing_resp(
            &mut self,
            _ctx: &mut SimContext,
            _port: PortId,
            response: MemoryResponse,
        ) -> Result<(), MemoryResponse> {
            self.responses.push((response.id(), response.status));
            Ok(())
        }

        fn send_outcome(&mut self, ctx: &mut SimContext, _port: PortId, outcome: SendOutcome) {
            if outcome == SendOutcome::Accepted {
                self.send_next(ctx);
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// pipelined requester, a bus and a memory at [0, 0x1000), the requester is not wired yet
    struct Rig {
        sim: Simulator,
        requester: ObjectId,
        bus: ObjectId,
    }

    fn rig(accesses: &[(Address, usize)]) -> Rig {
        let mut sim = Simulator::new(1000);
        let requester = sim.add_object(Box::new(Pipelined::new(accesses)));
        let bus = sim.add_object(Box::new(MemoryBus::new("bus", 1, 1, &Default::default())));
        let memory = sim.add_object(Box::new(SimpleMemory::new(
            "mem",
            &MemoryConfig {
                range: AddrRange::new(0, 0x1000),
                ..MemoryConfig::default()
            },
        )));
        sim.connect(bus, "mem_side_ports[0]", memory, "port").unwrap();
        Rig { sim, requester, bus }
    }

    fn put_in_front(rig: &mut Rig, hub: Box<dyn SimObject>, cpu_port: &str) -> ObjectId {
        let hub = rig.sim.add_object(hub);
        rig.sim.connect(rig.requester, "port", hub, cpu_port).unwrap();
        rig.sim.connect(hub, "mem_port", rig.bus, "cpu_side_ports[0]").unwrap();
        hub
    }

    fn run_rig(rig: &mut Rig) -> &Pipelined {
        rig.sim.init().unwrap();
        assert_eq!(rig.sim.run(None).unwrap(), ExitCause::QueueEmpty);
        let requester = rig.sim.object::<Pipelined>(rig.requester).unwrap();
        assert_eq!(requester.response_ids(), requester.sent);
        requester
    }

    fn config(topology: Topology, inst: Vec<Access>, data: Vec<Access>) -> SystemConfig {
        SystemConfig {
            topology,
            memory: MemoryConfig {
                range: AddrRange::new(0, 1 << 20),
                ..MemoryConfig::default()
            },
            workload: WorkloadConfig {
                inst,
                data,
                think_cycles: 0,
            },
            ..SystemConfig::default()
        }
    }

    fn read(addr: u64, size: usize) -> Access {
        Access::Read { addr, size }
    }

    fn write(addr: u64, data: &[u8]) -> Access {
        Access::Write { addr, data: data.to_vec() }
    }

    fn run(system: &mut BuiltSystem) -> Vec<Completion> {
        system.sim.init().unwrap();
        assert_eq!(system.sim.run(None).unwrap(), ExitCause::QueueEmpty);
        system.completions.try_iter().collect()
    }

    fn preload(system: &mut BuiltSystem, address: u64, data: &[u8]) {
        let memory = system.memory;
        system.sim.object_mut::<SimpleMemory>(memory).unwrap().init_mem(address, data);
    }

    fn cache(system: &BuiltSystem) -> &SingleBlockCache {
        system.sim.object::<SingleBlockCache>(system.hub).unwrap()
    }

    fn generator(system: &BuiltSystem, id: ObjectId) -> &TrafficGen {
        system.sim.object::<TrafficGen>(id).unwrap()
    }

    fn of<'a>(completions: &'a [Completion], generator: &str) -> Vec<&'a Completion> {
        completions.iter().filter(|c| c.generator.ends_with(generator)).collect()
    }

    #[test]
    fn test_miss_then_rejected_read_is_retried_once() {
        let mut system = build_system(&config(Topology::Cache, vec![read(0x100, 4)], vec![read(0x104, 4)])).unwrap();
        preload(&mut system, 0x100, &(0..64).collect::<Vec<u8>>());
        let completions = run(&mut system);

        assert_eq!(completions.len(), 2);
        let inst = of(&completions, "inst_gen");
        let data = of(&completions, "data_gen");
        assert_eq!(inst[0].data, vec![0, 1, 2, 3]);
        assert_eq!(data[0].data, vec![4, 5, 6, 7]);
        assert!(completions.iter().all(|c| c.status == MemoryResponseType::Valid));

        let cache = cache(&system);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.mem_side_sends(), 1);
        assert_eq!(cache.rejections(), 1);
        assert_eq!(cache.retries_sent(), 1);
        assert_eq!(cache.line().tag, 0x100);
        assert!(cache.line().valid);
        assert!(!cache.is_blocked());

        let data_gen = generator(&system, system.data_gen);
        assert_eq!(data_gen.rejections(), 1);
        assert_eq!(data_gen.retries(), 1);
        assert_eq!(generator(&system, system.inst_gen).rejections(), 0);
    }

    #[test]
    fn test_hit_does_not_touch_memory() {
        let mut system = build_system(&config(Topology::Cache, vec![], vec![read(0x100, 4), read(0x13C, 4)])).unwrap();
        let completions = run(&mut system);

        assert_eq!(completions.len(), 2);
        let cache = cache(&system);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.mem_side_sends(), 1);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut system = build_system(&config(
            Topology::Cache,
            vec![],
            vec![write(0x200, &[0xDE, 0xAD, 0xBE, 0xEF]), read(0x200, 4), read(0x202, 1)],
        ))
        .unwrap();
        let completions = run(&mut system);

        assert_eq!(completions.len(), 3);
        assert_eq!(completions[0].request_type, MemoryRequestType::WRITE);
        assert_eq!(completions[1].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(completions[2].data, vec![0xBE]);

        let cache = cache(&system);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 2);
        assert!(cache.line().dirty);
    }

    #[test]
    fn test_dirty_line_is_written_back_on_eviction() {
        let mut system = build_system(&config(
            Topology::Cache,
            vec![],
            vec![write(0x100, &[1, 2, 3, 4]), read(0x200, 4), read(0x100, 4)],
        ))
        .unwrap();
        let completions = run(&mut system);

        assert_eq!(completions.len(), 3);
        assert_eq!(completions[2].data, vec![1, 2, 3, 4]);

        let cache = cache(&system);
        assert_eq!(cache.misses(), 3);
        assert_eq!(cache.writebacks(), 1);
        assert_eq!(cache.mem_side_sends(), 4);
        assert!(!cache.line().dirty);

        let memory = system.sim.object::<SimpleMemory>(system.memory).unwrap();
        assert_eq!(memory.read_bytes(0x100, 4), vec![1, 2, 3, 4]);
        assert_eq!(memory.writes(), 1);
    }

    #[test]
    fn test_permanent_failures_are_not_retried() {
        let mut system = build_system(&config(
            Topology::Cache,
            vec![read(0x13E, 4)],
            vec![read(0x20_0000, 4), read(0x100, 4)],
        ))
        .unwrap();
        let completions = run(&mut system);

        assert_eq!(of(&completions, "inst_gen")[0].status, MemoryResponseType::UnalignedAddress);
        let data = of(&completions, "data_gen");
        assert_eq!(data[0].status, MemoryResponseType::InvalidAddress);
        assert_eq!(data[1].status, MemoryResponseType::Valid);

        let cache = cache(&system);
        assert_eq!(cache.address_errors(), 2);
        assert_eq!(cache.retries_sent(), 0);
        assert_eq!(cache.mem_side_sends(), 1);
    }

    #[test]
    fn test_refused_response_is_redelivered() {
        let mut system = build_system(&config(Topology::Cache, vec![], vec![read(0x100, 4), read(0x104, 4)])).unwrap();
        preload(&mut system, 0x100, &[9; 64]);
        let data_gen = system.data_gen;
        system
            .sim
            .object_mut::<TrafficGen>(data_gen)
            .unwrap()
            .reject_next_responses(1, 5);
        let completions = run(&mut system);

        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|c| c.data == vec![9; 4]));
        assert_eq!(generator(&system, data_gen).responses_rejected(), 1);
        assert!(generator(&system, data_gen).is_done());
    }

    #[test]
    fn test_functional_access_through_the_cache() {
        let mut system = build_system(&config(Topology::Cache, vec![], vec![write(0x200, &[7, 7])])).unwrap();
        preload(&mut system, 0x1000, &[1, 2, 3, 4]);
        run(&mut system);

        let data_gen = system.data_gen;
        let id = system.sim.next_request_id();
        let resident = system
            .sim
            .functional_access(data_gen, "port", MemoryRequest::read(id, RequestorId(0), 0x200, 2))
            .unwrap();
        assert_eq!(resident.data, vec![7, 7]);

        let id = system.sim.next_request_id();
        let from_memory = system
            .sim
            .functional_access(data_gen, "port", MemoryRequest::read(id, RequestorId(0), 0x1000, 4))
            .unwrap();
        assert_eq!(from_memory.data, vec![1, 2, 3, 4]);
        assert_eq!(cache(&system).line().tag, 0x200);
    }

    #[test]
    fn test_mem_obj_serializes_requests() {
        let mut system = build_system(&config(Topology::MemObj, vec![read(0x100, 4)], vec![read(0x200, 4)])).unwrap();
        preload(&mut system, 0x100, &[1, 1, 1, 1]);
        preload(&mut system, 0x200, &[2, 2, 2, 2]);
        let completions = run(&mut system);

        assert_eq!(of(&completions, "inst_gen")[0].data, vec![1; 4]);
        assert_eq!(of(&completions, "data_gen")[0].data, vec![2; 4]);
        // the data request is served strictly after the instruction fetch
        assert!(of(&completions, "data_gen")[0].completed_at > of(&completions, "inst_gen")[0].completed_at);

        let mem_obj = system.sim.object::<BlockingMemoryObject>(system.hub).unwrap();
        assert_eq!(mem_obj.forwarded(), 2);
        assert_eq!(mem_obj.rejections(), 1);
        assert_eq!(mem_obj.retries_sent(), 1);
        assert_eq!(generator(&system, system.data_gen).retries(), 1);
    }

    #[test]
    fn test_mem_obj_out_of_range() {
        let mut config = config(Topology::MemObj, vec![read(0x100, 4)], vec![read(0x5000, 4)]);
        config.mem_obj = MemObjConfig {
            ranges: Some(vec![AddrRange::new(0, 0x1000)]),
        };
        let mut system = build_system(&config).unwrap();
        let completions = run(&mut system);

        let data = of(&completions, "data_gen");
        assert_eq!(data[0].status, MemoryResponseType::InvalidAddress);
        // blocked behind the instruction fetch, then answered from Idle without forwarding
        assert!(data[0].completed_at > of(&completions, "inst_gen")[0].completed_at);

        let mem_obj = system.sim.object::<BlockingMemoryObject>(system.hub).unwrap();
        assert_eq!(mem_obj.forwarded(), 1);
        assert_eq!(mem_obj.address_errors(), 1);
        assert_eq!(mem_obj.rejections(), 1);
        assert_eq!(mem_obj.retries_sent(), 1);
        assert_eq!(generator(&system, system.data_gen).rejections(), 1);
    }

    #[test]
    fn test_mem_obj_keeps_port_order_for_out_of_range() {
        let mut rig = rig(&[(0x100, 4), (0x5000_0000, 4)]);
        let mem_obj = BlockingMemoryObject::new(
            "mem_obj",
            &MemObjConfig {
                ranges: Some(vec![AddrRange::new(0, 0x1000)]),
            },
        );
        let hub = put_in_front(&mut rig, Box::new(mem_obj), "inst_port");
        let requester = run_rig(&mut rig);
        assert_eq!(
            requester.statuses(),
            vec![MemoryResponseType::Valid, MemoryResponseType::InvalidAddress]
        );

        let mem_obj = rig.sim.object::<BlockingMemoryObject>(hub).unwrap();
        assert_eq!(mem_obj.forwarded(), 1);
        assert_eq!(mem_obj.rejections(), 1);
        assert_eq!(mem_obj.retries_sent(), 1);
        assert_eq!(mem_obj.state(), MemObjState::Idle);
    }

    #[test]
    fn test_cache_keeps_port_order_for_hits_behind_a_miss() {
        let mut rig = rig(&[(0x100, 4), (0x200, 4), (0x104, 4)]);
        let hub = put_in_front(
            &mut rig,
            Box::new(SingleBlockCache::new("cache", 1, &CacheConfig::default())),
            "cpu_ports[0]",
        );
        let requester = run_rig(&mut rig);
        assert!(requester.statuses().iter().all(|s| *s == MemoryResponseType::Valid));

        // 0x104 waits for the 0x200 fill, by then the line no longer holds it
        let cache = rig.sim.object::<SingleBlockCache>(hub).unwrap();
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 3);
        assert_eq!(cache.rejections(), 2);
        assert_eq!(cache.retries_sent(), 2);
        assert_eq!(cache.line().tag, 0x100);
    }

    #[test]
    fn test_bus_keeps_port_order_for_unmapped_address() {
        let mut rig = rig(&[(0x100, 4), (0x200, 4), (0x10_0000, 4)]);
        let bus = rig.bus;
        rig.sim.connect(rig.requester, "port", bus, "cpu_side_ports[0]").unwrap();
        let requester = run_rig(&mut rig);
        assert_eq!(
            requester.statuses(),
            vec![
                MemoryResponseType::Valid,
                MemoryResponseType::Valid,
                MemoryResponseType::InvalidAddress
            ]
        );

        let bus = rig.sim.object::<MemoryBus>(bus).unwrap();
        assert_eq!(bus.forwarded(), 2);
        assert_eq!(bus.invalid_addresses(), 1);
    }

    #[test]
    fn test_bus_rejects_unmapped_address() {
        let mut config = config(Topology::MemObj, vec![], vec![read(0x18_0000, 4)]);
        config.mem_obj = MemObjConfig {
            ranges: Some(vec![AddrRange::new(0, 2 << 20)]),
        };
        let mut system = build_system(&config).unwrap();
        let completions = run(&mut system);

        assert_eq!(completions[0].status, MemoryResponseType::InvalidAddress);
        assert_eq!(system.sim.object::<MemoryBus>(system.bus).unwrap().invalid_addresses(), 1);
    }

    #[test]
    fn test_full_memory_rejects_and_retries() {
        let mut sim = Simulator::new(1000);
        let (sender, completions) = unbounded();
        let gen_a = sim.add_object(Box::new(TrafficGen::new(
            "gen_a",
            vec![read(0x0, 8)],
            TrafficGenConfig::default(),
            sender.clone(),
        )));
        let gen_b = sim.add_object(Box::new(TrafficGen::new(
            "gen_b",
            vec![read(0x40, 8)],
            TrafficGenConfig::default(),
            sender,
        )));
        let bus = sim.add_object(Box::new(MemoryBus::new("bus", 2, 1, &Default::default())));
        let memory = sim.add_object(Box::new(SimpleMemory::new(
            "mem",
            &MemoryConfig {
                range: AddrRange::new(0, 0x1000),
                queue_capacity: 1,
                ..MemoryConfig::default()
            },
        )));
        sim.connect(gen_a, "port", bus, "cpu_side_ports[0]").unwrap();
        sim.connect(gen_b, "port", bus, "cpu_side_ports[1]").unwrap();
        sim.connect(bus, "mem_side_ports[0]", memory, "port").unwrap();
        sim.init().unwrap();
        sim.run(None).unwrap();

        let done: Vec<Completion> = completions.try_iter().collect();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.status == MemoryResponseType::Valid));

        let memory = sim.object::<SimpleMemory>(memory).unwrap();
        assert_eq!(memory.rejections(), 1);
        assert_eq!(memory.retries_sent(), 1);
        assert_eq!(memory.reads(), 2);
    }

    #[test]
    fn test_default_workload_runs_to_completion() {
        let mut system = build_system(&SystemConfig::default()).unwrap();
        let completions = run(&mut system);
        assert_eq!(completions.len(), 6);
        assert!(completions.iter().all(|c| c.status == MemoryResponseType::Valid));
        assert!(system.sim.dump_stats().contains("system.cache.hit_ratio"));
    }

    #[test]
    fn test_wiring_errors() {
        let mut system = build_system(&config(Topology::Cache, vec![], vec![])).unwrap();
        let (bus, memory) = (system.bus, system.memory);
        assert!(matches!(
            system.sim.connect(bus, "mem_side_ports[0]", memory, "port"),
            Err(SimError::AlreadyConnected { .. })
        ));
        assert!(matches!(
            system.sim.connect(memory, "port", bus, "cpu_side_ports[0]"),
            Err(SimError::WrongPortRole { .. })
        ));
        system.sim.init().unwrap();
        assert!(matches!(
            system.sim.connect(bus, "mem_side_ports[1]", memory, "port"),
            Err(SimError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_invalid_cache_config_fails_the_build() {
        let mut config = config(Topology::Cache, vec![], vec![]);
        config.cache = CacheConfig {
            size: 128,
            block_size: 64,
            latency: 1,
        };
        assert!(matches!(build_system(&config), Err(SimError::Config(_))));
    }
}
