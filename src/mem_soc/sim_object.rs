use std::any::Any;

use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::packet::{MemoryRequest, MemoryResponse};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::simulator::SimContext;
use crate::mem_soc::stats::StatsGroup;

/// Index of an object inside the simulator that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub usize);

/// Answer to a functional (zero time) access
pub enum FunctionalResult {
    Done(MemoryResponse),
    /// keep walking the port graph through one of this object's request ports
    Forward(PortId, MemoryRequest),
}

/// Answer to an address range query on a response port
pub enum RangeQuery {
    Owned(Vec<AddrRange>),
    /// whatever is reachable behind these request ports
    Downstream(Vec<PortId>),
}

/// Every component of the memory system (caches, buses, memories, requestors) implements this
///
/// All handlers run synchronously on the simulator thread and may only talk to the outside
/// through the `SimContext` they receive. Anything they send is delivered later as an event,
/// so a handler never observes another handler running underneath it.
pub trait SimObject: Any {
    fn name(&self) -> &str;

    /// resolve a port by its interface name and optional vector index
    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)>;

    /// called once from `Simulator::init`, after all ports are bound and ranges propagated
    fn startup(&mut self, _ctx: &mut SimContext) {}

    /// a timing request arrived on a response port
    /// returning the request back means it was rejected, the object then owes the port a retry
    fn recv_timing_req(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        request: MemoryRequest,
    ) -> Result<(), MemoryRequest> {
        panic!(
            "protocol violation: {} received request {request} on {} but does not accept requests",
            self.name(),
            ctx.describe_port(port)
        )
    }

    /// a timing response arrived on a request port, same rejection semantics as requests
    fn recv_timing_resp(
        &mut self,
        ctx: &mut SimContext,
        port: PortId,
        response: MemoryResponse,
    ) -> Result<(), MemoryResponse> {
        panic!(
            "protocol violation: {} received response to {} on {} but never sends requests",
            self.name(),
            response.request,
            ctx.describe_port(port)
        )
    }

    fn send_outcome(&mut self, _ctx: &mut SimContext, _port: PortId, _outcome: SendOutcome) {}

    fn recv_functional(&mut self, _port: PortId, request: MemoryRequest) -> FunctionalResult {
        panic!("{} does not support functional access ({request})", self.name())
    }

    fn addr_ranges(&self, _port: PortId) -> RangeQuery {
        RangeQuery::Owned(vec![])
    }

    /// ranges reachable behind one of the object's request ports
    fn recv_range_change(&mut self, _port: PortId, _ranges: Vec<AddrRange>) {}

    /// an event the object scheduled for itself fired
    fn process_event(&mut self, _ctx: &mut SimContext, _token: u64) {}

    fn stats(&self) -> Option<StatsGroup> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
