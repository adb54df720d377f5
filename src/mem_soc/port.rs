use crate::mem_soc::packet::{MemoryRequest, MemoryResponse};
use crate::mem_soc::sim_object::ObjectId;

/// Index of a port inside the object that declares it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub usize);

/// A request port issues requests and receives responses, a response port does the opposite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Request,
    Response,
}

/// What happened to a packet the object sent on one of its ports
/// Request ports get these for requests, response ports for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// the peer refused the packet, the link holds it until the peer sends a retry
    Rejected,
    /// the peer signaled a retry, the held packet is being delivered again
    Retrying,
}

/// State of one direction of a link
///
/// ```text
///   Idle --send--> PendingAcceptance --accept--> Idle
///                        |    ^
///                 reject |    | retry
///                        v    |
///                   WaitingForRetry
/// ```
#[derive(Debug)]
pub enum LinkState<T> {
    Idle,
    PendingAcceptance(T),
    WaitingForRetry(T),
}

#[derive(Debug)]
pub struct Channel<T> {
    state: LinkState<T>,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self { state: LinkState::Idle }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, LinkState::Idle)
    }

    #[inline]
    pub fn is_waiting_for_retry(&self) -> bool {
        matches!(self.state, LinkState::WaitingForRetry(_))
    }

    /// hand a packet to the link, gives it back if the link still carries another one
    pub fn send(&mut self, packet: T) -> Result<(), T> {
        if !self.is_idle() {
            return Err(packet);
        }
        self.state = LinkState::PendingAcceptance(packet);
        Ok(())
    }

    /// take the packet out for delivery, the link stays idle unless the receiver rejects it
    pub fn take_pending(&mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::PendingAcceptance(packet) => Some(packet),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn reject(&mut self, packet: T) {
        debug_assert!(self.is_idle());
        self.state = LinkState::WaitingForRetry(packet);
    }

    /// move a rejected packet back to pending, false if nothing was waiting for a retry
    pub fn retry(&mut self) -> bool {
        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::WaitingForRetry(packet) => {
                self.state = LinkState::PendingAcceptance(packet);
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub object: ObjectId,
    pub port: PortId,
}

/// Binding between a request port and a response port, established once before the simulation starts
#[derive(Debug)]
pub struct Link {
    pub requestor: Endpoint,
    pub responder: Endpoint,
    pub req: Channel<MemoryRequest>,
    pub resp: Channel<MemoryResponse>,
}

impl Link {
    pub fn new(requestor: Endpoint, responder: Endpoint) -> Self {
        Self {
            requestor,
            responder,
            req: Channel::new(),
            resp: Channel::new(),
        }
    }
}

/// split `cpu_ports[1]` into the interface name and the vector index
pub fn parse_port_name(name: &str) -> Option<(&str, Option<usize>)> {
    let name = name.trim();
    match name.find('[') {
        Some(open) => {
            let idx = name[open + 1..].strip_suffix(']')?.trim().parse().ok()?;
            Some((&name[..open], Some(idx)))
        }
        None if !name.is_empty() => Some((name, None)),
        None => None,
    }
}

pub fn vector_port_name(if_name: &str, idx: usize) -> String {
    format!("{if_name}[{idx}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transitions() {
        let mut channel = Channel::new();
        assert!(channel.send(1u32).is_ok());
        assert_eq!(channel.send(2u32), Err(2));

        let packet = channel.take_pending().unwrap();
        assert!(channel.is_idle());
        channel.reject(packet);
        assert!(channel.is_waiting_for_retry());
        assert_eq!(channel.take_pending(), None);
        assert!(channel.is_waiting_for_retry());

        assert!(channel.retry());
        assert!(!channel.retry());
        assert_eq!(channel.take_pending(), Some(1));
        assert!(channel.is_idle());
    }

    #[test]
    fn test_parse_port_name() {
        assert_eq!(parse_port_name("cpu_ports[1]"), Some(("cpu_ports", Some(1))));
        assert_eq!(parse_port_name("mem_port"), Some(("mem_port", None)));
        assert_eq!(parse_port_name("cpu_ports[x]"), None);
        assert_eq!(parse_port_name(""), None);
        assert_eq!(vector_port_name("mem_side_ports", 3), "mem_side_ports[3]");
    }
}
