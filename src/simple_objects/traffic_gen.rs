use std::any::Any;
use std::collections::VecDeque;

use crossbeam_channel::Sender;

use crate::mem_soc::packet::{Address, MemoryRequest, MemoryRequestType, MemoryResponse, MemoryResponseType, RequestId};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::sim_object::SimObject;
use crate::mem_soc::simulator::{Cycles, SimContext, Tick};
use crate::mem_soc::stats::{Histogram, StatsGroup};

pub const PORT: PortId = PortId(0);

const ISSUE: u64 = 0;
const RESP_RETRY: u64 = 1;

/// One scripted access
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Read { addr: Address, size: usize },
    Write { addr: Address, data: Vec<u8> },
}

/// Reported for every response the generator accepts
#[derive(Debug, Clone)]
pub struct Completion {
    pub generator: String,
    pub id: RequestId,
    pub address: Address,
    pub request_type: MemoryRequestType,
    pub data: Vec<u8>,
    pub status: MemoryResponseType,
    pub issued_at: Tick,
    pub completed_at: Tick,
}

#[derive(Debug, Clone, Default)]
pub struct TrafficGenConfig {
    /// idle cycles between a response and the next request
    pub think_cycles: Cycles,
    /// mark every request as an instruction fetch
    pub inst_fetch: bool,
    /// refuse this many responses before accepting one
    pub reject_responses: usize,
    /// cycles to wait before asking for a refused response again
    pub response_stall: Cycles,
}

/// Stand-in for a CPU side port: replays a script, one outstanding request at a time
pub struct TrafficGen {
    name: String,
    config: TrafficGenConfig,
    script: VecDeque<Access>,
    in_flight: Option<(RequestId, Tick)>,
    completions: Sender<Completion>,

    issued: u64,
    completed: u64,
    rejections: u64,
    retries: u64,
    responses_rejected: u64,
    latency: Histogram,
}

impl TrafficGen {
    pub fn new(name: &str, script: Vec<Access>, config: TrafficGenConfig, completions: Sender<Completion>) -> Self {
        Self {
            name: name.to_string(),
            config,
            script: script.into(),
            in_flight: None,
            completions,
            issued: 0,
            completed: 0,
            rejections: 0,
            retries: 0,
            responses_rejected: 0,
            latency: Histogram::new(16),
        }
    }

    /// refuse the next `count` responses, each refusal is followed by a response retry after `stall` cycles
    pub fn reject_next_responses(&mut self, count: usize, stall: Cycles) {
        self.config.reject_responses = count;
        self.config.response_stall = stall;
    }

    pub fn is_done(&self) -> bool {
        self.script.is_empty() && self.in_flight.is_none()
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// rejections observed on the request port
    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    /// retries observed on the request port
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn responses_rejected(&self) -> u64 {
        self.responses_rejected
    }

    fn issue_next(&mut self, ctx: &mut SimContext) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(access) = self.script.pop_front() else {
            return;
        };
        let id = ctx.next_request_id();
        let request = match access {
            Access::Read { addr, size } => MemoryRequest::read(id, ctx.requestor_id(), addr, size),
            Access::Write { addr, data } => MemoryRequest::write(id, ctx.requestor_id(), addr, data),
        }
        .with_inst_fetch(self.config.inst_fetch);

        tracing::debug!("@{} {} issues {}", ctx.cur_tick(), self.name, request);
        self.in_flight = Some((id, ctx.cur_tick()));
        self.issued += 1;
        ctx.send_timing_req(PORT, request);
    }
}

impl SimObject for TrafficGen {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
        match (if_name, idx) {
            ("port", None) => Some((PORT, PortRole::Request)),
            _ => None,
        }
    }

    fn startup(&mut self, ctx: &mut SimContext) {
        if !self.script.is_empty() {
            ctx.schedule(0, ISSUE);
        }
    }

    fn recv_timing_resp(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        response: MemoryResponse,
    ) -> Result<(), MemoryResponse> {
        if self.config.reject_responses > 0 {
            self.config.reject_responses -= 1;
            self.responses_rejected += 1;
            tracing::debug!("@{} {} refuses response to {}", ctx.cur_tick(), self.name, response.request);
            ctx.schedule(self.config.response_stall, RESP_RETRY);
            return Err(response);
        }

        let issued_at = match self.in_flight.take() {
            Some((id, issued_at)) if id == response.id() => issued_at,
            _ => panic!(
                "protocol violation: {} got a response to {} it is not waiting for",
                ctx.describe_port(port),
                response.request
            ),
        };

        let completed_at = ctx.cur_tick();
        self.completed += 1;
        self.latency.sample((completed_at - issued_at) / ctx.clock_period());
        tracing::debug!(
            "@{} {} completed {} ({:?})",
            completed_at,
            self.name,
            response.request,
            response.status
        );

        let completion = Completion {
            generator: self.name.clone(),
            id: response.id(),
            address: response.address(),
            request_type: response.request.request_type,
            data: response.data,
            status: response.status,
            issued_at,
            completed_at,
        };
        if self.completions.send(completion).is_err() {
            tracing::trace!("{}: nobody listens for completions", self.name);
        }

        if !self.script.is_empty() {
            ctx.schedule(self.config.think_cycles, ISSUE);
        }
        Ok(())
    }

    fn send_outcome(&mut self, ctx: &mut SimContext, _port: PortId, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Accepted => {}
            SendOutcome::Rejected => {
                self.rejections += 1;
                tracing::trace!("@{} {} request rejected, waiting for retry", ctx.cur_tick(), self.name);
            }
            SendOutcome::Retrying => {
                self.retries += 1;
                tracing::trace!("@{} {} got a retry", ctx.cur_tick(), self.name);
            }
        }
    }

    fn process_event(&mut self, ctx: &mut SimContext, token: u64) {
        match token {
            ISSUE => self.issue_next(ctx),
            RESP_RETRY => ctx.send_retry_resp(PORT),
            _ => unreachable!("unknown event {token} for {}", self.name),
        }
    }

    fn stats(&self) -> Option<StatsGroup> {
        Some(
            StatsGroup::new(&self.name)
                .count("issued", self.issued, "Requests issued")
                .count("completed", self.completed, "Responses accepted")
                .count("rejections", self.rejections, "Requests rejected by the peer")
                .count("retries", self.retries, "Retries received from the peer")
                .count("responses_rejected", self.responses_rejected, "Responses refused on purpose")
                .distribution("latency", &self.latency, "Request to response latency in cycles"),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
