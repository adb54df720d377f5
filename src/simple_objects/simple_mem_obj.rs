use std::any::Any;
use std::collections::VecDeque;

use crate::config::MemObjConfig;
use crate::mem_soc::addr_range::{AddrRange, ranges_contain};
use crate::mem_soc::packet::{MemoryRequest, MemoryResponse, MemoryResponseType, RequestId};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::sim_object::{FunctionalResult, RangeQuery, SimObject};
use crate::mem_soc::simulator::SimContext;
use crate::mem_soc::stats::StatsGroup;

pub const INST_PORT: PortId = PortId(0);
pub const DATA_PORT: PortId = PortId(1);
pub const MEM_PORT: PortId = PortId(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemObjState {
    Idle,
    /// the request that came in on `port` was forwarded and has not been answered yet
    RequestSent { id: RequestId, port: PortId },
}

/// Pass-through between the two CPU side ports and one memory side port
/// At most one request is in flight, anything arriving meanwhile is rejected and retried
/// in the order the rejections happened once the response is back.
pub struct BlockingMemoryObject {
    name: String,
    configured_ranges: Option<Vec<AddrRange>>,
    ranges: Vec<AddrRange>,
    state: MemObjState,
    retry_queue: VecDeque<PortId>,
    /// set when a memory response was refused because its CPU side port was busy
    resp_retry_owed: bool,

    forwarded: u64,
    rejections: u64,
    retries_sent: u64,
    address_errors: u64,
}

impl BlockingMemoryObject {
    pub fn new(name: &str, config: &MemObjConfig) -> Self {
        Self {
            name: name.to_string(),
            configured_ranges: config.ranges.clone(),
            ranges: config.ranges.clone().unwrap_or_default(),
            state: MemObjState::Idle,
            retry_queue: VecDeque::new(),
            resp_retry_owed: false,
            forwarded: 0,
            rejections: 0,
            retries_sent: 0,
            address_errors: 0,
        }
    }

    pub fn state(&self) -> MemObjState {
        self.state
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
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

    fn port_name(port: PortId) -> &'static str {
        match port {
            INST_PORT => "inst_port",
            DATA_PORT => "data_port",
            _ => "mem_port",
        }
    }

    fn reject(&mut self, ctx: &SimContext, port: PortId, request: MemoryRequest) -> Result<(), MemoryRequest> {
        self.rejections += 1;
        if !self.retry_queue.contains(&port) {
            self.retry_queue.push_back(port);
        }
        tracing::trace!(
            "@{} {} blocked, rejecting {} on {}",
            ctx.cur_tick(),
            self.name,
            request,
            Self::port_name(port)
        );
        Err(request)
    }

    /// retry every waiting port whose response channel is free, in arrival order
    fn issue_retries(&mut self, ctx: &mut SimContext) {
        if self.state != MemObjState::Idle {
            return;
        }
        let mut still_waiting = VecDeque::new();
        while let Some(port) = self.retry_queue.pop_front() {
            if ctx.is_resp_port_busy(port) {
                still_waiting.push_back(port);
                continue;
            }
            self.retries_sent += 1;
            ctx.send_retry_req(port);
        }
        self.retry_queue = still_waiting;
    }
}

impl SimObject for BlockingMemoryObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
        match (if_name, idx) {
            ("inst_port", None) => Some((INST_PORT, PortRole::Response)),
            ("data_port", None) => Some((DATA_PORT, PortRole::Response)),
            ("mem_port", None) => Some((MEM_PORT, PortRole::Request)),
            _ => None,
        }
    }

    fn recv_range_change(&mut self, _port: PortId, ranges: Vec<AddrRange>) {
        if self.configured_ranges.is_none() {
            self.ranges = ranges;
        }
    }

    fn recv_timing_req(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        request: MemoryRequest,
    ) -> Result<(), MemoryRequest> {
        if self.state != MemObjState::Idle || ctx.is_resp_port_busy(port) {
            return self.reject(ctx, port, request);
        }

        if !ranges_contain(&self.ranges, request.data_address, request.data_size) {
            self.address_errors += 1;
            tracing::warn!("{}: {} is outside the forwarded ranges", self.name, request);
            ctx.send_timing_resp(port, request.make_error_response(MemoryResponseType::InvalidAddress));
            return Ok(());
        }

        tracing::debug!("@{} {} forwards {} from {}", ctx.cur_tick(), self.name, request, Self::port_name(port));
        self.state = MemObjState::RequestSent { id: request.id, port };
        self.forwarded += 1;
        ctx.send_timing_req(MEM_PORT, request);
        Ok(())
    }

    fn recv_timing_resp(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        response: MemoryResponse,
    ) -> Result<(), MemoryResponse> {
        let cpu_port = match self.state {
            MemObjState::RequestSent { id, port } if id == response.id() => port,
            _ => panic!(
                "protocol violation: {} got a response to {} while in {:?}",
                ctx.describe_port(port),
                response.request,
                self.state
            ),
        };

        if ctx.is_resp_port_busy(cpu_port) {
            self.resp_retry_owed = true;
            return Err(response);
        }

        self.state = MemObjState::Idle;
        ctx.send_timing_resp(cpu_port, response);
        self.issue_retries(ctx);
        Ok(())
    }

    fn send_outcome(&mut self, ctx: &mut SimContext, port: PortId, outcome: SendOutcome) {
        if port == MEM_PORT || outcome != SendOutcome::Accepted {
            return;
        }
        // a response left one of the CPU side ports
        if self.resp_retry_owed {
            if let MemObjState::RequestSent { port: waiting, .. } = self.state {
                if waiting == port {
                    self.resp_retry_owed = false;
                    ctx.send_retry_resp(MEM_PORT);
                    return;
                }
            }
        }
        self.issue_retries(ctx);
    }

    fn recv_functional(&mut self, port: PortId, request: MemoryRequest) -> FunctionalResult {
        if port != MEM_PORT && !ranges_contain(&self.ranges, request.data_address, request.data_size) {
            return FunctionalResult::Done(request.make_error_response(MemoryResponseType::InvalidAddress));
        }
        FunctionalResult::Forward(MEM_PORT, request)
    }

    fn addr_ranges(&self, _port: PortId) -> RangeQuery {
        match &self.configured_ranges {
            Some(ranges) => RangeQuery::Owned(ranges.clone()),
            None => RangeQuery::Downstream(vec![MEM_PORT]),
        }
    }

    fn stats(&self) -> Option<StatsGroup> {
        Some(
            StatsGroup::new(&self.name)
                .count("forwarded", self.forwarded, "Requests forwarded to memory")
                .count("rejections", self.rejections, "Requests rejected while blocked")
                .count("retries_sent", self.retries_sent, "Retries sent to CPU side ports")
                .count("address_errors", self.address_errors, "Requests outside the forwarded ranges"),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
