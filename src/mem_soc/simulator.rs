use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ahash::AHashMap;

use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::error::SimError;
use crate::mem_soc::packet::{MemoryRequest, MemoryResponse, RequestId, RequestorId};
use crate::mem_soc::port::{Endpoint, Link, LinkId, PortId, PortRole, SendOutcome, parse_port_name};
use crate::mem_soc::sim_object::{FunctionalResult, ObjectId, RangeQuery, SimObject};

/// simulation time in picoseconds
pub type Tick = u64;
/// number of periods of the system clock
pub type Cycles = u64;

pub const TICKS_PER_SECOND: Tick = 1_000_000_000_000;

/// upper bound for walks through the port graph (functional accesses, range discovery)
const MAX_HOPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    DeliverReq { link: LinkId, retried: bool },
    DeliverResp { link: LinkId, retried: bool },
    Timer { object: ObjectId, token: u64 },
}

#[derive(Debug)]
struct ScheduledEvent {
    when: Tick,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// nothing left to do, every accepted request got its response
    QueueEmpty,
    TickLimit(Tick),
}

/// Links, bindings and the event queue
/// Kept apart from the object table so that a handler can own `&mut self` while talking to the fabric
pub struct Fabric {
    tick: Tick,
    clock_period: Tick,
    seq: u64,
    next_request_id: RequestId,
    queue: BinaryHeap<Reverse<ScheduledEvent>>,
    links: Vec<Link>,
    bindings: AHashMap<(ObjectId, PortId), LinkId>,
    object_names: Vec<String>,
    port_names: AHashMap<(ObjectId, PortId), String>,
}

impl Fabric {
    fn new(clock_period: Tick) -> Self {
        Self {
            tick: 0,
            clock_period,
            seq: 0,
            next_request_id: 0,
            queue: BinaryHeap::new(),
            links: vec![],
            bindings: AHashMap::new(),
            object_names: vec![],
            port_names: AHashMap::new(),
        }
    }

    fn schedule(&mut self, when: Tick, kind: EventKind) {
        assert!(when >= self.tick, "cannot schedule an event in the past");
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(ScheduledEvent { when, seq, kind }));
    }

    fn describe(&self, object: ObjectId, port: PortId) -> String {
        let object_name = &self.object_names[object.0];
        match self.port_names.get(&(object, port)) {
            Some(port_name) => format!("{object_name}.{port_name}"),
            None => format!("{object_name}.port{}", port.0),
        }
    }

    fn link_of(&self, object: ObjectId, port: PortId) -> LinkId {
        match self.bindings.get(&(object, port)) {
            Some(link) => *link,
            None => panic!("protocol violation: {} is not connected", self.describe(object, port)),
        }
    }
}

/// The only window a handler has on the rest of the system
pub struct SimContext<'a> {
    fabric: &'a mut Fabric,
    object: ObjectId,
}

impl<'a> SimContext<'a> {
    fn new(fabric: &'a mut Fabric, object: ObjectId) -> Self {
        Self { fabric, object }
    }

    #[inline]
    pub fn cur_tick(&self) -> Tick {
        self.fabric.tick
    }

    #[inline]
    pub fn clock_period(&self) -> Tick {
        self.fabric.clock_period
    }

    #[inline]
    pub fn cycles_to_ticks(&self, cycles: Cycles) -> Tick {
        cycles * self.fabric.clock_period
    }

    /// token that routes responses back to this object
    pub fn requestor_id(&self) -> RequestorId {
        RequestorId(self.object.0)
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.fabric.next_request_id;
        self.fabric.next_request_id += 1;
        id
    }

    pub fn describe_port(&self, port: PortId) -> String {
        self.fabric.describe(self.object, port)
    }

    fn request_link(&self, port: PortId) -> LinkId {
        let link = self.fabric.link_of(self.object, port);
        let requestor = self.fabric.links[link.0].requestor;
        assert!(
            requestor == (Endpoint { object: self.object, port }),
            "protocol violation: {} is not a request port",
            self.describe_port(port)
        );
        link
    }

    fn response_link(&self, port: PortId) -> LinkId {
        let link = self.fabric.link_of(self.object, port);
        let responder = self.fabric.links[link.0].responder;
        assert!(
            responder == (Endpoint { object: self.object, port }),
            "protocol violation: {} is not a response port",
            self.describe_port(port)
        );
        link
    }

    /// true while a request sent on this port has not been accepted yet
    pub fn is_req_port_busy(&self, port: PortId) -> bool {
        let link = self.request_link(port);
        !self.fabric.links[link.0].req.is_idle()
    }

    /// true while a response sent on this port has not been accepted yet
    pub fn is_resp_port_busy(&self, port: PortId) -> bool {
        let link = self.response_link(port);
        !self.fabric.links[link.0].resp.is_idle()
    }

    pub fn send_timing_req(&mut self, port: PortId, request: MemoryRequest) {
        let link = self.request_link(port);
        if let Err(request) = self.fabric.links[link.0].req.send(request) {
            panic!(
                "protocol violation: {} sent {request} while the previous request was not accepted",
                self.describe_port(port)
            );
        }
        let now = self.fabric.tick;
        self.fabric.schedule(now, EventKind::DeliverReq { link, retried: false });
    }

    pub fn send_timing_resp(&mut self, port: PortId, response: MemoryResponse) {
        self.send_timing_resp_in(port, response, 0);
    }

    /// the link is occupied right away, the peer sees the response `cycles` later
    pub fn send_timing_resp_in(&mut self, port: PortId, response: MemoryResponse, cycles: Cycles) {
        let link = self.response_link(port);
        if let Err(response) = self.fabric.links[link.0].resp.send(response) {
            panic!(
                "protocol violation: {} sent a response for {} while the previous one was not accepted",
                self.describe_port(port),
                response.request
            );
        }
        let when = self.fabric.tick + self.cycles_to_ticks(cycles);
        self.fabric.schedule(when, EventKind::DeliverResp { link, retried: false });
    }

    /// tell the peer of a response port to resend the request this object rejected
    pub fn send_retry_req(&mut self, port: PortId) {
        let link = self.response_link(port);
        if !self.fabric.links[link.0].req.retry() {
            panic!(
                "protocol violation: {} sent a retry but no request is waiting for one",
                self.describe_port(port)
            );
        }
        let now = self.fabric.tick;
        self.fabric.schedule(now, EventKind::DeliverReq { link, retried: true });
    }

    /// tell the peer of a request port to resend the response this object rejected
    pub fn send_retry_resp(&mut self, port: PortId) {
        let link = self.request_link(port);
        if !self.fabric.links[link.0].resp.retry() {
            panic!(
                "protocol violation: {} sent a response retry but no response is waiting for one",
                self.describe_port(port)
            );
        }
        let now = self.fabric.tick;
        self.fabric.schedule(now, EventKind::DeliverResp { link, retried: true });
    }

    pub fn schedule(&mut self, cycles: Cycles, token: u64) {
        let when = self.fabric.tick + self.cycles_to_ticks(cycles);
        self.schedule_at(when, token);
    }

    pub fn schedule_at(&mut self, when: Tick, token: u64) {
        let object = self.object;
        self.fabric.schedule(when, EventKind::Timer { object, token });
    }
}

/// Owns every object of the system and drives them through the event queue
pub struct Simulator {
    objects: Vec<Box<dyn SimObject>>,
    fabric: Fabric,
    started: bool,
}

impl Simulator {
    pub fn new(clock_period: Tick) -> Self {
        assert!(clock_period > 0, "clock period must not be zero");
        Self {
            objects: vec![],
            fabric: Fabric::new(clock_period),
            started: false,
        }
    }

    pub fn add_object(&mut self, object: Box<dyn SimObject>) -> ObjectId {
        let id = ObjectId(self.objects.len());
        self.fabric.object_names.push(object.name().to_string());
        self.objects.push(object);
        id
    }

    pub fn cur_tick(&self) -> Tick {
        self.fabric.tick
    }

    pub fn clock_period(&self) -> Tick {
        self.fabric.clock_period
    }

    pub fn object<T: SimObject>(&self, id: ObjectId) -> Option<&T> {
        self.objects.get(id.0)?.as_any().downcast_ref::<T>()
    }

    pub fn object_mut<T: SimObject>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.objects.get_mut(id.0)?.as_any_mut().downcast_mut::<T>()
    }

    fn resolve_port(&self, object: ObjectId, port_name: &str, expected: PortRole) -> Result<PortId, SimError> {
        let target = &self.objects[object.0];
        let unknown = || SimError::UnknownPort {
            object: target.name().to_string(),
            port: port_name.to_string(),
        };
        let (if_name, idx) = parse_port_name(port_name).ok_or_else(unknown)?;
        let (port, role) = target.get_port(if_name, idx).ok_or_else(unknown)?;
        if role != expected {
            return Err(SimError::WrongPortRole {
                object: target.name().to_string(),
                port: port_name.to_string(),
                found: role,
                expected,
            });
        }
        if self.fabric.bindings.contains_key(&(object, port)) {
            return Err(SimError::AlreadyConnected {
                object: target.name().to_string(),
                port: port_name.to_string(),
            });
        }
        Ok(port)
    }

    /// bind a request port to a response port, only allowed before `init`
    pub fn connect(
        &mut self,
        requestor: ObjectId,
        req_port: &str,
        responder: ObjectId,
        resp_port: &str,
    ) -> Result<LinkId, SimError> {
        if self.started {
            return Err(SimError::AlreadyStarted);
        }
        let req = self.resolve_port(requestor, req_port, PortRole::Request)?;
        let resp = self.resolve_port(responder, resp_port, PortRole::Response)?;

        let link = LinkId(self.fabric.links.len());
        let requestor = Endpoint { object: requestor, port: req };
        let responder = Endpoint { object: responder, port: resp };
        self.fabric.links.push(Link::new(requestor, responder));
        self.fabric.bindings.insert((requestor.object, requestor.port), link);
        self.fabric.bindings.insert((responder.object, responder.port), link);
        self.fabric
            .port_names
            .insert((requestor.object, requestor.port), req_port.to_string());
        self.fabric
            .port_names
            .insert((responder.object, responder.port), resp_port.to_string());

        tracing::debug!(
            "Connected {} -> {}",
            self.fabric.describe(requestor.object, requestor.port),
            self.fabric.describe(responder.object, responder.port)
        );
        Ok(link)
    }

    fn ranges_behind(&self, responder: Endpoint, hops: usize) -> Result<Vec<AddrRange>, SimError> {
        if hops > MAX_HOPS {
            return Err(SimError::PortGraphLoop(hops));
        }
        match self.objects[responder.object.0].addr_ranges(responder.port) {
            RangeQuery::Owned(ranges) => Ok(ranges),
            RangeQuery::Downstream(ports) => {
                let mut ranges = vec![];
                for port in ports {
                    if let Some(link) = self.fabric.bindings.get(&(responder.object, port)) {
                        let next = self.fabric.links[link.0].responder;
                        ranges.extend(self.ranges_behind(next, hops + 1)?);
                    }
                }
                Ok(ranges)
            }
        }
    }

    /// propagate address ranges to every request port and start the objects
    pub fn init(&mut self) -> Result<(), SimError> {
        if self.started {
            return Err(SimError::AlreadyStarted);
        }

        let mut changes = Vec::with_capacity(self.fabric.links.len());
        for link in &self.fabric.links {
            changes.push((link.requestor, self.ranges_behind(link.responder, 0)?));
        }
        for (requestor, ranges) in changes {
            tracing::debug!(
                "Ranges behind {}: {:?}",
                self.fabric.describe(requestor.object, requestor.port),
                ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>()
            );
            self.objects[requestor.object.0].recv_range_change(requestor.port, ranges);
        }

        self.started = true;
        for (index, object) in self.objects.iter_mut().enumerate() {
            let mut ctx = SimContext::new(&mut self.fabric, ObjectId(index));
            object.startup(&mut ctx);
        }
        tracing::info!("Initialized {} objects and {} links", self.objects.len(), self.fabric.links.len());
        Ok(())
    }

    /// run until the event queue drains or the next event lies beyond `max_tick`
    pub fn run(&mut self, max_tick: Option<Tick>) -> Result<ExitCause, SimError> {
        if !self.started {
            return Err(SimError::NotStarted);
        }
        while let Some(Reverse(next)) = self.fabric.queue.peek() {
            if let Some(limit) = max_tick {
                if next.when > limit {
                    self.fabric.tick = limit;
                    return Ok(ExitCause::TickLimit(limit));
                }
            }
            self.step();
        }
        Ok(ExitCause::QueueEmpty)
    }

    /// process a single event, false if the queue was empty
    pub fn step(&mut self) -> bool {
        let Some(Reverse(event)) = self.fabric.queue.pop() else {
            return false;
        };
        self.fabric.tick = event.when;
        match event.kind {
            EventKind::DeliverReq { link, retried } => self.deliver_req(link, retried),
            EventKind::DeliverResp { link, retried } => self.deliver_resp(link, retried),
            EventKind::Timer { object, token } => {
                let mut ctx = SimContext::new(&mut self.fabric, object);
                self.objects[object.0].process_event(&mut ctx, token);
            }
        }
        true
    }

    fn notify(&mut self, endpoint: Endpoint, outcome: SendOutcome) {
        let mut ctx = SimContext::new(&mut self.fabric, endpoint.object);
        self.objects[endpoint.object.0].send_outcome(&mut ctx, endpoint.port, outcome);
    }

    fn deliver_req(&mut self, link: LinkId, retried: bool) {
        let (requestor, responder) = {
            let l = &self.fabric.links[link.0];
            (l.requestor, l.responder)
        };
        if retried {
            self.notify(requestor, SendOutcome::Retrying);
        }
        let Some(request) = self.fabric.links[link.0].req.take_pending() else {
            panic!(
                "protocol violation: nothing to deliver on {}",
                self.fabric.describe(requestor.object, requestor.port)
            );
        };
        tracing::trace!(
            "@{} {} -> {}: {}",
            self.fabric.tick,
            self.fabric.describe(requestor.object, requestor.port),
            self.fabric.describe(responder.object, responder.port),
            request
        );

        let result = {
            let mut ctx = SimContext::new(&mut self.fabric, responder.object);
            self.objects[responder.object.0].recv_timing_req(&mut ctx, responder.port, request)
        };
        match result {
            Ok(()) => self.notify(requestor, SendOutcome::Accepted),
            Err(request) => {
                tracing::trace!("@{} request {} rejected, waiting for retry", self.fabric.tick, request);
                self.fabric.links[link.0].req.reject(request);
                self.notify(requestor, SendOutcome::Rejected);
            }
        }
    }

    fn deliver_resp(&mut self, link: LinkId, retried: bool) {
        let (requestor, responder) = {
            let l = &self.fabric.links[link.0];
            (l.requestor, l.responder)
        };
        if retried {
            self.notify(responder, SendOutcome::Retrying);
        }
        let Some(response) = self.fabric.links[link.0].resp.take_pending() else {
            panic!(
                "protocol violation: nothing to deliver on {}",
                self.fabric.describe(responder.object, responder.port)
            );
        };
        tracing::trace!(
            "@{} {} -> {}: response to {}",
            self.fabric.tick,
            self.fabric.describe(responder.object, responder.port),
            self.fabric.describe(requestor.object, requestor.port),
            response.request
        );

        let result = {
            let mut ctx = SimContext::new(&mut self.fabric, requestor.object);
            self.objects[requestor.object.0].recv_timing_resp(&mut ctx, requestor.port, response)
        };
        match result {
            Ok(()) => self.notify(responder, SendOutcome::Accepted),
            Err(response) => {
                self.fabric.links[link.0].resp.reject(response);
                self.notify(responder, SendOutcome::Rejected);
            }
        }
    }

    /// zero time access entering the system through a request port of `object`
    pub fn functional_access(
        &mut self,
        object: ObjectId,
        port_name: &str,
        request: MemoryRequest,
    ) -> Result<MemoryResponse, SimError> {
        let target = &self.objects[object.0];
        let unknown = || SimError::UnknownPort {
            object: target.name().to_string(),
            port: port_name.to_string(),
        };
        let (if_name, idx) = parse_port_name(port_name).ok_or_else(unknown)?;
        let (port, _) = target.get_port(if_name, idx).ok_or_else(unknown)?;

        let mut current = Endpoint { object, port };
        let mut request = request;
        for _ in 0..MAX_HOPS {
            let Some(link) = self.fabric.bindings.get(&(current.object, current.port)) else {
                return Err(SimError::NotConnected {
                    object: self.fabric.object_names[current.object.0].clone(),
                    port: format!("port{}", current.port.0),
                });
            };
            let next = self.fabric.links[link.0].responder;
            match self.objects[next.object.0].recv_functional(next.port, request) {
                FunctionalResult::Done(response) => return Ok(response),
                FunctionalResult::Forward(port, forwarded) => {
                    current = Endpoint { object: next.object, port };
                    request = forwarded;
                }
            }
        }
        Err(SimError::PortGraphLoop(MAX_HOPS))
    }

    /// new request id for requests created outside of any handler (functional accesses)
    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.fabric.next_request_id;
        self.fabric.next_request_id += 1;
        id
    }

    pub fn dump_stats(&self) -> String {
        self.objects
            .iter()
            .filter_map(|object| object.stats())
            .map(|group| group.to_string())
            .collect()
    }
}
