use std::any::Any;
use std::collections::VecDeque;

use ahash::AHashMap;

use crate::config::BusConfig;
use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::packet::{Address, MemoryRequest, MemoryResponse, MemoryResponseType, RequestId};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::sim_object::{FunctionalResult, RangeQuery, SimObject};
use crate::mem_soc::simulator::{Cycles, SimContext};
use crate::mem_soc::stats::StatsGroup;

/// Crossbar between requestors and memory devices
///
/// Requests are forwarded to the device whose range contains the address, responses are
/// routed back by request id. Device ranges are learned when the system is initialized and
/// are not allowed to overlap. A CPU side port with unanswered forwards can only keep
/// sending to the same device, anything else waits until its responses have drained.
pub struct MemoryBus {
    name: String,
    n_cpu: usize,
    n_mem: usize,
    forward_latency: Cycles,
    memmap: Vec<(AddrRange, usize)>,
    routes: AHashMap<RequestId, usize>,
    /// per device side port, the cpu side ports that were rejected because it was busy
    req_retry_waiting: Vec<VecDeque<usize>>,
    /// per cpu side port, the device side ports whose response was rejected because it was busy
    resp_retry_waiting: Vec<VecDeque<usize>>,
    /// per cpu side port, the device its unanswered forwards went to and how many there are
    in_flight: Vec<Option<(usize, usize)>>,
    /// cpu side ports rejected until their own responses drain
    blocked: Vec<bool>,

    forwarded: u64,
    responses: u64,
    invalid_addresses: u64,
    req_rejections: u64,
    resp_rejections: u64,
}

impl MemoryBus {
    pub fn new(name: &str, n_cpu: usize, n_mem: usize, config: &BusConfig) -> Self {
        assert!(n_cpu > 0 && n_mem > 0, "a bus needs at least one port on each side");
        Self {
            name: name.to_string(),
            n_cpu,
            n_mem,
            forward_latency: config.forward_latency,
            memmap: vec![],
            routes: AHashMap::new(),
            req_retry_waiting: vec![VecDeque::new(); n_mem],
            resp_retry_waiting: vec![VecDeque::new(); n_cpu],
            in_flight: vec![None; n_cpu],
            blocked: vec![false; n_cpu],
            forwarded: 0,
            responses: 0,
            invalid_addresses: 0,
            req_rejections: 0,
            resp_rejections: 0,
        }
    }

    #[inline]
    fn mem_port(&self, device: usize) -> PortId {
        PortId(self.n_cpu + device)
    }

    #[inline]
    fn is_cpu_port(&self, port: PortId) -> bool {
        port.0 < self.n_cpu
    }

    fn find_device(&self, address: Address) -> Option<usize> {
        self.memmap
            .iter()
            .find(|(range, _)| range.contains(address))
            .map(|(_, device)| *device)
    }

    pub fn invalid_addresses(&self) -> u64 {
        self.invalid_addresses
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn memmap(&self) -> &[(AddrRange, usize)] {
        &self.memmap
    }
}

impl SimObject for MemoryBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
        match (if_name, idx) {
            ("cpu_side_ports", Some(i)) if i < self.n_cpu => Some((PortId(i), PortRole::Response)),
            ("mem_side_ports", Some(j)) if j < self.n_mem => Some((self.mem_port(j), PortRole::Request)),
            _ => None,
        }
    }

    fn recv_range_change(&mut self, port: PortId, ranges: Vec<AddrRange>) {
        let device = port.0 - self.n_cpu;
        self.memmap.retain(|(_, d)| *d != device);
        for range in ranges {
            if let Some((other, other_device)) = self.memmap.iter().find(|(r, _)| r.overlaps(&range)) {
                panic!(
                    "{}: range {range} behind mem_side_ports[{device}] overlaps {other} behind mem_side_ports[{other_device}]",
                    self.name
                );
            }
            self.memmap.push((range, device));
        }
        self.memmap.sort_by_key(|(range, _)| range.start());
    }

    fn recv_timing_req(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        request: MemoryRequest,
    ) -> Result<(), MemoryRequest> {
        let cpu = port.0;
        let device = self.find_device(request.data_address);
        let overtakes = match self.in_flight[cpu] {
            Some((pending, _)) => device != Some(pending),
            None => false,
        };
        if overtakes || (device.is_none() && ctx.is_resp_port_busy(port)) {
            self.req_rejections += 1;
            self.blocked[cpu] = true;
            tracing::trace!("@{} {}: holding {} until {} drains", ctx.cur_tick(), self.name, request, ctx.describe_port(port));
            return Err(request);
        }

        let Some(device) = device else {
            self.invalid_addresses += 1;
            tracing::warn!("{}: no device serves {}", self.name, request);
            let response = request.make_error_response(MemoryResponseType::InvalidAddress);
            ctx.send_timing_resp_in(port, response, self.forward_latency);
            return Ok(());
        };

        let mem_port = self.mem_port(device);
        if ctx.is_req_port_busy(mem_port) {
            self.req_rejections += 1;
            if !self.req_retry_waiting[device].contains(&cpu) {
                self.req_retry_waiting[device].push_back(cpu);
            }
            tracing::trace!("@{} {}: {} busy, rejecting {}", ctx.cur_tick(), self.name, ctx.describe_port(mem_port), request);
            return Err(request);
        }

        self.routes.insert(request.id, cpu);
        let count = self.in_flight[cpu].map_or(0, |(_, count)| count);
        self.in_flight[cpu] = Some((device, count + 1));
        self.forwarded += 1;
        ctx.send_timing_req(mem_port, request);
        Ok(())
    }

    fn recv_timing_resp(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        response: MemoryResponse,
    ) -> Result<(), MemoryResponse> {
        let device = port.0 - self.n_cpu;
        let Some(&cpu) = self.routes.get(&response.id()) else {
            panic!(
                "protocol violation: {} got a response to {} that was never forwarded",
                ctx.describe_port(port),
                response.request
            );
        };

        if ctx.is_resp_port_busy(PortId(cpu)) {
            self.resp_rejections += 1;
            if !self.resp_retry_waiting[cpu].contains(&device) {
                self.resp_retry_waiting[cpu].push_back(device);
            }
            return Err(response);
        }

        self.routes.remove(&response.id());
        self.in_flight[cpu] = match self.in_flight[cpu] {
            Some((device, count)) if count > 1 => Some((device, count - 1)),
            _ => None,
        };
        self.responses += 1;
        ctx.send_timing_resp_in(PortId(cpu), response, self.forward_latency);
        Ok(())
    }

    fn send_outcome(&mut self, ctx: &mut SimContext, port: PortId, outcome: SendOutcome) {
        if outcome != SendOutcome::Accepted {
            tracing::trace!("@{} {}: {:?} on {}", ctx.cur_tick(), self.name, outcome, ctx.describe_port(port));
            return;
        }

        if self.is_cpu_port(port) {
            let cpu = port.0;
            if let Some(device) = self.resp_retry_waiting[cpu].pop_front() {
                ctx.send_retry_resp(self.mem_port(device));
            }
            if self.blocked[cpu] && self.in_flight[cpu].is_none() {
                self.blocked[cpu] = false;
                ctx.send_retry_req(port);
            }
        } else {
            let device = port.0 - self.n_cpu;
            if let Some(cpu) = self.req_retry_waiting[device].pop_front() {
                ctx.send_retry_req(PortId(cpu));
            }
        }
    }

    fn recv_functional(&mut self, _port: PortId, request: MemoryRequest) -> FunctionalResult {
        match self.find_device(request.data_address) {
            Some(device) => FunctionalResult::Forward(self.mem_port(device), request),
            None => FunctionalResult::Done(request.make_error_response(MemoryResponseType::InvalidAddress)),
        }
    }

    fn addr_ranges(&self, _port: PortId) -> RangeQuery {
        RangeQuery::Downstream((0..self.n_mem).map(|j| self.mem_port(j)).collect())
    }

    fn stats(&self) -> Option<StatsGroup> {
        Some(
            StatsGroup::new(&self.name)
                .count("forwarded", self.forwarded, "Requests forwarded to a device")
                .count("responses", self.responses, "Responses routed back")
                .count("invalid_addresses", self.invalid_addresses, "Requests no device serves")
                .count("req_rejections", self.req_rejections, "Requests rejected on a busy link")
                .count("resp_rejections", self.resp_rejections, "Responses rejected on a busy link"),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        let bus = MemoryBus::new("bus", 2, 1, &BusConfig::default());
        assert_eq!(bus.get_port("cpu_side_ports", Some(1)), Some((PortId(1), PortRole::Response)));
        assert_eq!(bus.get_port("mem_side_ports", Some(0)), Some((PortId(2), PortRole::Request)));
        assert_eq!(bus.get_port("cpu_side_ports", Some(2)), None);
        assert_eq!(bus.get_port("mem_side_ports", None), None);
    }

    #[test]
    fn test_memmap() {
        let mut bus = MemoryBus::new("bus", 1, 2, &BusConfig::default());
        bus.recv_range_change(PortId(2), vec![AddrRange::new(0x1000, 0x2000)]);
        bus.recv_range_change(PortId(1), vec![AddrRange::new(0, 0x1000)]);
        assert_eq!(bus.find_device(0x10), Some(0));
        assert_eq!(bus.find_device(0x1800), Some(1));
        assert_eq!(bus.find_device(0x2000), None);
        assert_eq!(bus.memmap()[0], (AddrRange::new(0, 0x1000), 0));
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_devices() {
        let mut bus = MemoryBus::new("bus", 1, 2, &BusConfig::default());
        bus.recv_range_change(PortId(1), vec![AddrRange::new(0, 0x1000)]);
        bus.recv_range_change(PortId(2), vec![AddrRange::new(0x800, 0x2000)]);
    }
}
