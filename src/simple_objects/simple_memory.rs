use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Write;
use std::path::Path;

use ahash::AHashMap;
use object::read::elf::{FileHeader, SectionHeader};
use object::{Endianness, elf};

use crate::config::MemoryConfig;
use crate::mem_soc::addr_range::AddrRange;
use crate::mem_soc::error::LoadError;
use crate::mem_soc::packet::{Address, MemoryRequest, MemoryResponse, MemoryResponseType};
use crate::mem_soc::port::{PortId, PortRole, SendOutcome};
use crate::mem_soc::sim_object::{FunctionalResult, RangeQuery, SimObject};
use crate::mem_soc::simulator::{Cycles, SimContext, Tick};
use crate::mem_soc::stats::StatsGroup;

pub const PORT: PortId = PortId(0);

const SEND: u64 = 0;
const PAGE_SIZE: usize = 4096;

/// Sections worth placing in memory when loading a binary
const LOADABLE_SECTIONS: [&str; 6] = [".text", ".data", ".sdata", ".rodata", ".bss", ".sbss"];

/// Backing memory with a fixed latency and a shared transfer bandwidth
///
/// Storage is sparse, pages are allocated on first write and unwritten bytes read as zero.
/// Accesses take effect when the request is accepted, the response leaves once the
/// transfer and the latency have elapsed. Responses leave in acceptance order.
pub struct SimpleMemory {
    name: String,
    range: AddrRange,
    latency: Cycles,
    bandwidth: usize,
    queue_capacity: usize,
    pages: AHashMap<u64, Box<[u8; PAGE_SIZE]>>,
    /// responses waiting for their ready tick or for the port
    pending: VecDeque<(Tick, MemoryResponse)>,
    busy_until: Tick,
    need_retry: bool,

    reads: u64,
    writes: u64,
    bytes_read: u64,
    bytes_written: u64,
    rejections: u64,
    retries_sent: u64,
    address_errors: u64,
}

impl SimpleMemory {
    pub fn new(name: &str, config: &MemoryConfig) -> Self {
        Self {
            name: name.to_string(),
            range: config.range,
            latency: config.latency,
            bandwidth: config.bandwidth,
            queue_capacity: config.queue_capacity,
            pages: AHashMap::new(),
            pending: VecDeque::new(),
            busy_until: 0,
            need_retry: false,
            reads: 0,
            writes: 0,
            bytes_read: 0,
            bytes_written: 0,
            rejections: 0,
            retries_sent: 0,
            address_errors: 0,
        }
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    pub fn retries_sent(&self) -> u64 {
        self.retries_sent
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn read_bytes(&self, address: Address, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        for a in address..address + size as Address {
            let page = a / PAGE_SIZE as u64;
            let offset = (a % PAGE_SIZE as u64) as usize;
            out.push(self.pages.get(&page).map_or(0, |p| p[offset]));
        }
        out
    }

    pub fn write_bytes(&mut self, address: Address, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let a = address + i as Address;
            let page = a / PAGE_SIZE as u64;
            let offset = (a % PAGE_SIZE as u64) as usize;
            self.pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]))[offset] = *byte;
        }
    }

    /// place a raw image at `address`, which is a physical address inside the memory range
    pub fn init_mem(&mut self, address: Address, data: &[u8]) {
        assert!(
            self.range.contains_span(address, data.len()),
            "image at {address:#x} (+{:#x}) does not fit {}",
            data.len(),
            self.range
        );
        self.write_bytes(address, data);
    }

    /// load the code and data sections of a 32 bit little endian ELF, returns how many sections were placed
    pub fn load_elf(&mut self, path: &Path) -> Result<usize, LoadError> {
        let data = std::fs::read(path)?;
        self.load_elf_bytes(&data)
    }

    pub fn load_elf_bytes(&mut self, data: &[u8]) -> Result<usize, LoadError> {
        let header = elf::FileHeader32::<Endianness>::parse(data)?;
        let endian = header.endian()?;
        if endian != Endianness::Little {
            return Err(LoadError::BigEndian);
        }

        let sections = header.sections(endian, data)?;
        let mut loaded = 0;
        for section in sections.iter() {
            let name = String::from_utf8_lossy(sections.section_name(endian, section)?).into_owned();
            if !LOADABLE_SECTIONS.iter().any(|s| name.contains(s)) {
                continue;
            }
            let address = section.sh_addr(endian) as Address;
            let size = section.sh_size(endian) as u64;
            if size == 0 {
                continue;
            }
            if !self.range.contains_span(address, size as usize) {
                return Err(LoadError::OutOfRange {
                    name,
                    address,
                    size,
                    range: self.range,
                });
            }

            if section.sh_type(endian) == elf::SHT_NOBITS {
                self.write_bytes(address, &vec![0; size as usize]);
            } else {
                self.write_bytes(address, section.data(endian, data)?);
            }
            tracing::debug!("Loaded {name} @{address:#x} (+{size:#x}) into {}", self.name);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// hex dump of `[start, end)`, sixteen bytes per line
    pub fn debug(&self, start: Address, end: Address) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Memory {} {}: {{", self.name, self.range);
        let mut line = start & !0xF;
        while line < end {
            let _ = write!(out, "{line:08X}:");
            for (i, byte) in self.read_bytes(line, 16).iter().enumerate() {
                if i % 4 == 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02X}");
            }
            out.push('\n');
            line += 16;
        }
        out.push('}');
        out
    }

    /// perform the access right away, data is captured at acceptance
    fn access(&mut self, request: MemoryRequest) -> MemoryResponse {
        if !self.range.contains_span(request.data_address, request.data_size) {
            self.address_errors += 1;
            tracing::warn!("{}: {} is outside {}", self.name, request, self.range);
            return request.make_error_response(MemoryResponseType::InvalidAddress);
        }
        if request.is_write() {
            self.write_bytes(request.data_address, request.payload());
            self.writes += 1;
            self.bytes_written += request.data_size as u64;
            request.make_response(vec![])
        } else {
            let data = self.read_bytes(request.data_address, request.data_size);
            self.reads += 1;
            self.bytes_read += request.data_size as u64;
            request.make_response(data)
        }
    }

    fn try_send_next(&mut self, ctx: &mut SimContext) {
        if ctx.is_resp_port_busy(PORT) {
            // the Accepted outcome brings us back here
            return;
        }
        let Some((ready, _)) = self.pending.front() else {
            return;
        };
        if *ready > ctx.cur_tick() {
            ctx.schedule_at(*ready, SEND);
            return;
        }

        let Some((_, response)) = self.pending.pop_front() else {
            return;
        };
        ctx.send_timing_resp(PORT, response);

        if self.need_retry && self.pending.len() < self.queue_capacity {
            self.need_retry = false;
            self.retries_sent += 1;
            tracing::trace!("@{} {} has room again, sending retry", ctx.cur_tick(), self.name);
            ctx.send_retry_req(PORT);
        }
    }
}

impl SimObject for SimpleMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_port(&self, if_name: &str, idx: Option<usize>) -> Option<(PortId, PortRole)> {
        match (if_name, idx) {
            ("port", None) => Some((PORT, PortRole::Response)),
            _ => None,
        }
    }

    fn recv_timing_req(
        &mut self,
        ctx: &mut SimContext,
        _port: PortId,
        request: MemoryRequest,
    ) -> Result<(), MemoryRequest> {
        if self.pending.len() >= self.queue_capacity {
            self.need_retry = true;
            self.rejections += 1;
            tracing::trace!("@{} {} is full, rejecting {}", ctx.cur_tick(), self.name, request);
            return Err(request);
        }

        let transfer = (request.data_size.max(1)).div_ceil(self.bandwidth) as Cycles;
        let start = self.busy_until.max(ctx.cur_tick());
        self.busy_until = start + ctx.cycles_to_ticks(transfer);
        let ready = self.busy_until + ctx.cycles_to_ticks(self.latency);

        let response = self.access(request);
        self.pending.push_back((ready, response));
        if self.pending.len() == 1 {
            ctx.schedule_at(ready, SEND);
        }
        Ok(())
    }

    fn send_outcome(&mut self, ctx: &mut SimContext, _port: PortId, outcome: SendOutcome) {
        if outcome == SendOutcome::Accepted {
            self.try_send_next(ctx);
        }
    }

    fn process_event(&mut self, ctx: &mut SimContext, token: u64) {
        match token {
            SEND => self.try_send_next(ctx),
            _ => unreachable!("unknown event {token} for {}", self.name),
        }
    }

    fn recv_functional(&mut self, _port: PortId, request: MemoryRequest) -> FunctionalResult {
        if !self.range.contains_span(request.data_address, request.data_size) {
            return FunctionalResult::Done(request.make_error_response(MemoryResponseType::InvalidAddress));
        }
        if request.is_write() {
            self.write_bytes(request.data_address, request.payload());
            FunctionalResult::Done(request.make_response(vec![]))
        } else {
            let data = self.read_bytes(request.data_address, request.data_size);
            FunctionalResult::Done(request.make_response(data))
        }
    }

    fn addr_ranges(&self, _port: PortId) -> RangeQuery {
        RangeQuery::Owned(vec![self.range])
    }

    fn stats(&self) -> Option<StatsGroup> {
        Some(
            StatsGroup::new(&self.name)
                .count("reads", self.reads, "Read requests served")
                .count("writes", self.writes, "Write requests served")
                .count("bytes_read", self.bytes_read, "Bytes read")
                .count("bytes_written", self.bytes_written, "Bytes written")
                .count("rejections", self.rejections, "Requests rejected with a full queue")
                .count("retries_sent", self.retries_sent, "Retries sent after a slot freed")
                .count("address_errors", self.address_errors, "Requests outside the memory range"),
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
    use crate::mem_soc::packet::RequestorId;

    fn memory() -> SimpleMemory {
        SimpleMemory::new(
            "mem",
            &MemoryConfig {
                range: AddrRange::new(0, 0x10000),
                ..MemoryConfig::default()
            },
        )
    }

    #[test]
    fn test_sparse_storage() {
        let mut mem = memory();
        assert_eq!(mem.read_bytes(0x2000, 4), vec![0; 4]);
        mem.write_bytes(0xFFE, &[1, 2, 3, 4]);
        assert_eq!(mem.read_bytes(0xFFE, 4), vec![1, 2, 3, 4]);
        assert_eq!(mem.pages.len(), 2);
    }

    #[test]
    fn test_functional_access() {
        let mut mem = memory();
        let write = MemoryRequest::write(0, RequestorId(0), 0x40, vec![0xAA, 0xBB]);
        assert!(matches!(mem.recv_functional(PORT, write), FunctionalResult::Done(r) if r.is_ok()));

        let read = MemoryRequest::read(1, RequestorId(0), 0x40, 2);
        match mem.recv_functional(PORT, read) {
            FunctionalResult::Done(response) => assert_eq!(response.data, vec![0xAA, 0xBB]),
            FunctionalResult::Forward(..) => panic!("memory never forwards"),
        }

        let outside = MemoryRequest::read(2, RequestorId(0), 0xFFFF, 2);
        match mem.recv_functional(PORT, outside) {
            FunctionalResult::Done(response) => assert_eq!(response.status, MemoryResponseType::InvalidAddress),
            FunctionalResult::Forward(..) => panic!("memory never forwards"),
        }
    }

    #[test]
    fn test_address_at_top_of_address_space() {
        let mut mem = memory();
        let read = MemoryRequest::read(3, RequestorId(0), Address::MAX - 1, 4);
        let response = mem.access(read);
        assert_eq!(response.status, MemoryResponseType::InvalidAddress);
        assert_eq!(mem.address_errors, 1);
    }

    #[test]
    #[should_panic(expected = "carries no data")]
    fn test_write_without_payload() {
        let write = MemoryRequest {
            data: None,
            ..MemoryRequest::write(4, RequestorId(0), 0x40, vec![0xAA])
        };
        memory().access(write);
    }

    #[test]
    fn test_debug_dump() {
        let mut mem = memory();
        mem.init_mem(0x10, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let dump = mem.debug(0x10, 0x20);
        assert!(dump.contains("00000010: DEADBEEF 00000000"));
    }

    #[test]
    fn test_rejects_garbage_elf() {
        let mut mem = memory();
        assert!(matches!(mem.load_elf_bytes(b"definitely not an elf"), Err(LoadError::Object(_))));
        assert!(matches!(
            mem.load_elf(Path::new("/nonexistent/image.elf")),
            Err(LoadError::Io(_))
        ));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_init_outside_range() {
        memory().init_mem(0xFFFE, &[0; 4]);
    }
}
