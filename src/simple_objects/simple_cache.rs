use std::any::Any;
use std::collections::VecDeque;

use ahash::AHashSet;

use crate::config::CacheConfig;
use crate::mem_soc::addr_range::{AddrRange, ranges_contain};
use crate::mem_soc::packet::{Address, MemoryRequest, MemoryResponse, MemoryResponseType, RequestId};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::sim_object::{FunctionalResult, RangeQuery, SimObject};
use crate::mem_soc::simulator::{Cycles, SimContext, Tick};
use crate::mem_soc::stats::{Histogram, StatsGroup, hit_ratio};

/// The only line of the cache
#[derive(Debug, Clone)]
pub struct CacheLine {
    /// block aligned address of the resident block
    pub tag: Address,
    pub valid: bool,
    pub dirty: bool,
    pub data: Vec<u8>,
}

impl CacheLine {
    fn empty(block_size: usize) -> Self {
        Self {
            tag: 0,
            valid: false,
            dirty: false,
            data: vec![0; block_size],
        }
    }

    #[inline]
    fn holds(&self, block_address: Address) -> bool {
        self.valid && self.tag == block_address
    }
}

/// The miss being served, the CPU request is held until its block arrives
#[derive(Debug)]
struct Outstanding {
    request: MemoryRequest,
    port: PortId,
    fetch_id: RequestId,
    miss_time: Tick,
}

/// Blocking cache with a single line between any number of CPU side ports and one memory port
///
/// Write allocate and write back. While a miss is outstanding every CPU request is rejected,
/// hit or miss, and retried once the fill is back. Replacing a dirty line queues a full block
/// write back ahead of any later fetch.
pub struct SingleBlockCache {
    name: String,
    block_size: usize,
    latency: Cycles,
    n_cpu: usize,
    mem_port: PortId,
    line: CacheLine,
    ranges: Vec<AddrRange>,
    outstanding: Option<Outstanding>,
    /// requests waiting for the memory port, write backs and fetches in issue order
    mem_queue: VecDeque<MemoryRequest>,
    writeback_ids: AHashSet<RequestId>,
    /// CPU side ports owed a retry, in the order they were rejected
    retry_queue: VecDeque<PortId>,
    /// the fill was refused because its CPU side port was busy
    fill_retry_owed: bool,

    hits: u64,
    misses: u64,
    miss_latency: Histogram,
    mem_side_sends: u64,
    writebacks: u64,
    rejections: u64,
    retries_sent: u64,
    address_errors: u64,
}

impl SingleBlockCache {
    pub fn new(name: &str, n_cpu: usize, config: &CacheConfig) -> Self {
        assert!(n_cpu > 0, "a cache needs at least one CPU side port");
        Self {
            name: name.to_string(),
            block_size: config.block_size,
            latency: config.latency,
            n_cpu,
            mem_port: PortId(n_cpu),
            line: CacheLine::empty(config.block_size),
            ranges: vec![],
            outstanding: None,
            mem_queue: VecDeque::new(),
            writeback_ids: AHashSet::new(),
            retry_queue: VecDeque::new(),
            fill_retry_owed: false,
            hits: 0,
            misses: 0,
            miss_latency: Histogram::new(16),
            mem_side_sends: 0,
            writebacks: 0,
            rejections: 0,
            retries_sent: 0,
            address_errors: 0,
        }
    }

    pub fn line(&self) -> &CacheLine {
        &self.line
    }

    pub fn is_blocked(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn mem_side_sends(&self) -> u64 {
        self.mem_side_sends
    }

    pub fn writebacks(&self) -> u64 {
        self.writebacks
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    pub fn retries_sent(&self) -> u64 {
        self.retries_sent
    }

    pub fn address_errors(&self) -> u64 {
        self.address_errors
    }

    /// permanent failures, answered without touching the line
    fn check_request(&self, request: &MemoryRequest) -> Option<MemoryResponseType> {
        if !ranges_contain(&self.ranges, request.data_address, request.data_size) {
            Some(MemoryResponseType::InvalidAddress)
        } else if !request.fits_in_block(self.block_size) {
            Some(MemoryResponseType::UnalignedAddress)
        } else {
            None
        }
    }

    /// serve a request against the resident line, the caller made sure it is a hit
    fn access_line(&mut self, request: MemoryRequest) -> MemoryResponse {
        debug_assert!(self.line.holds(request.block_address(self.block_size)));
        if request.is_write() {
            request.write_into_block(&mut self.line.data, self.line.tag);
            self.line.dirty = true;
            request.make_response(vec![])
        } else {
            let data = request.read_from_block(&self.line.data, self.line.tag);
            request.make_response(data)
        }
    }

    fn reject(&mut self, ctx: &SimContext, port: PortId, request: MemoryRequest) -> Result<(), MemoryRequest> {
        self.rejections += 1;
        if !self.retry_queue.contains(&port) {
            self.retry_queue.push_back(port);
        }
        tracing::trace!("@{} {} rejecting {} on {}", ctx.cur_tick(), self.name, request, ctx.describe_port(port));
        Err(request)
    }

    fn try_send_mem(&mut self, ctx: &mut SimContext) {
        if ctx.is_req_port_busy(self.mem_port) {
            return;
        }
        if let Some(request) = self.mem_queue.pop_front() {
            self.mem_side_sends += 1;
            ctx.send_timing_req(self.mem_port, request);
        }
    }

    /// retries wait until the miss is resolved, ports still sending a response keep their turn
    fn issue_retries(&mut self, ctx: &mut SimContext) {
        if self.outstanding.is_some() {
            return;
        }
        let mut still_waiting = VecDeque::new();
        while let Some(port) = self.retry_queue.pop_front() {
            if ctx.is_resp_port_busy(port) {
                still_waiting.push_back(port);
                continue;
            }
            self.retries_sent += 1;
            tracing::trace!("@{} {} sends retry on {}", ctx.cur_tick(), self.name, ctx.describe_port(port));
            ctx.send_retry_req(port);
        }
        self.retry_queue = still_waiting;
    }

    /// install a fetched block, queueing a write back of the dirty line it replaces
    fn install(&mut self, ctx: &mut SimContext, tag: Address, data: Vec<u8>) {
        assert!(
            data.len() == self.block_size,
            "protocol violation: {} got a fill of {} bytes for a {} byte block",
            self.name,
            data.len(),
            self.block_size
        );
        if self.line.valid && self.line.dirty {
            let id = ctx.next_request_id();
            let writeback = MemoryRequest::write(id, ctx.requestor_id(), self.line.tag, self.line.data.clone());
            tracing::debug!("@{} {} writes back block {:#x}", ctx.cur_tick(), self.name, self.line.tag);
            self.writeback_ids.insert(id);
            self.writebacks += 1;
            self.mem_queue.push_back(writeback);
        }
        self.line = CacheLine {
            tag,
            valid: true,
            dirty: false,
            data,
        };
    }
}

impl SimObject for SingleBlockCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
        match (if_name, idx) {
            ("cpu_ports", Some(i)) if i < self.n_cpu => Some((PortId(i), PortRole::Response)),
            ("mem_port", None) => Some((self.mem_port, PortRole::Request)),
            _ => None,
        }
    }

    fn recv_range_change(&mut self, _port: PortId, ranges: Vec<AddrRange>) {
        self.ranges = ranges;
    }

    fn recv_timing_req(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        request: MemoryRequest,
    ) -> Result<(), MemoryRequest> {
        if self.outstanding.is_some() || ctx.is_resp_port_busy(port) {
            return self.reject(ctx, port, request);
        }

        if let Some(status) = self.check_request(&request) {
            self.address_errors += 1;
            tracing::warn!("{}: {} failed with {:?}", self.name, request, status);
            ctx.send_timing_resp_in(port, request.make_error_response(status), self.latency);
            return Ok(());
        }

        let block = request.block_address(self.block_size);
        if self.line.holds(block) {
            self.hits += 1;
            tracing::trace!("@{} {} hit {}", ctx.cur_tick(), self.name, request);
            let response = self.access_line(request);
            ctx.send_timing_resp_in(port, response, self.latency);
            return Ok(());
        }

        self.misses += 1;
        let fetch_id = ctx.next_request_id();
        let fetch = MemoryRequest::read(fetch_id, ctx.requestor_id(), block, self.block_size)
            .with_inst_fetch(request.inst_fetch);
        tracing::debug!("@{} {} miss {}, fetching block {:#x}", ctx.cur_tick(), self.name, request, block);
        self.outstanding = Some(Outstanding {
            request,
            port,
            fetch_id,
            miss_time: ctx.cur_tick(),
        });
        self.mem_queue.push_back(fetch);
        self.try_send_mem(ctx);
        Ok(())
    }

    fn recv_timing_resp(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        response: MemoryResponse,
    ) -> Result<(), MemoryResponse> {
        if self.writeback_ids.remove(&response.id()) {
            if !response.is_ok() {
                tracing::warn!("{}: write back {} failed with {:?}", self.name, response.request, response.status);
            }
            return Ok(());
        }

        let Some(outstanding) = self.outstanding.take_if(|o| o.fetch_id == response.id()) else {
            panic!(
                "protocol violation: {} got a response to {} that no miss is waiting for",
                ctx.describe_port(port),
                response.request
            );
        };
        let cpu_port = outstanding.port;
        if ctx.is_resp_port_busy(cpu_port) {
            self.fill_retry_owed = true;
            self.outstanding = Some(outstanding);
            return Err(response);
        }

        self.miss_latency
            .sample((ctx.cur_tick() - outstanding.miss_time) / ctx.clock_period());

        let reply = if response.is_ok() {
            self.install(ctx, response.request.data_address, response.data);
            self.access_line(outstanding.request)
        } else {
            tracing::warn!("{}: fill for {} failed with {:?}", self.name, outstanding.request, response.status);
            outstanding.request.make_error_response(response.status)
        };
        ctx.send_timing_resp_in(cpu_port, reply, self.latency);

        self.try_send_mem(ctx);
        self.issue_retries(ctx);
        Ok(())
    }

    fn send_outcome(&mut self, ctx: &mut SimContext, port: PortId, outcome: SendOutcome) {
        if outcome != SendOutcome::Accepted {
            return;
        }
        if port == self.mem_port {
            self.try_send_mem(ctx);
            return;
        }

        if self.fill_retry_owed {
            if let Some(outstanding) = &self.outstanding {
                if outstanding.port == port {
                    self.fill_retry_owed = false;
                    ctx.send_retry_resp(self.mem_port);
                    return;
                }
            }
        }
        self.issue_retries(ctx);
    }

    fn recv_functional(&mut self, port: PortId, request: MemoryRequest) -> FunctionalResult {
        if port == self.mem_port {
            panic!("{}: functional requests only enter through cpu_ports", self.name);
        }
        if let Some(status) = self.check_request(&request) {
            return FunctionalResult::Done(request.make_error_response(status));
        }
        if self.line.holds(request.block_address(self.block_size)) {
            FunctionalResult::Done(self.access_line(request))
        } else {
            FunctionalResult::Forward(self.mem_port, request)
        }
    }

    fn addr_ranges(&self, _port: PortId) -> RangeQuery {
        RangeQuery::Downstream(vec![self.mem_port])
    }

    fn stats(&self) -> Option<StatsGroup> {
        Some(
            StatsGroup::new(&self.name)
                .count("hits", self.hits, "Number of hits")
                .count("misses", self.misses, "Number of misses")
                .distribution("miss_latency", &self.miss_latency, "Ticks for misses to the cache, in cycles")
                .ratio("hit_ratio", hit_ratio(self.hits, self.misses), "The ratio of hits to the total accesses to the cache")
                .count("mem_side_sends", self.mem_side_sends, "Requests sent on the memory port")
                .count("writebacks", self.writebacks, "Dirty blocks written back")
                .count("rejections", self.rejections, "Requests rejected on CPU side ports")
                .count("retries_sent", self.retries_sent, "Retries sent to CPU side ports")
                .count("address_errors", self.address_errors, "Requests failed with an address error"),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
