use std::fmt::Display;

pub type Address = u64;

/// unique per simulator, handed out by the fabric when a request is created
pub type RequestId = u64;

/// Token identifying the object that created a request
/// Responses travel back towards it, every component on the way uses it (or the request id) for routing
#[derive(Debug, Eq, Hash, PartialEq, Clone, Copy)]
pub struct RequestorId(pub usize);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MemoryRequestType {
    READ,
    WRITE,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MemoryResponseType {
    Valid,
    /// the address is not covered by any range behind the port, permanent failure
    InvalidAddress,
    /// the access crosses a block boundary, permanent failure
    UnalignedAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRequest {
    pub id: RequestId,
    pub requestor: RequestorId,
    pub request_type: MemoryRequestType,
    pub data_address: Address,
    pub data_size: usize,
    pub data: Option<Vec<u8>>,
    pub inst_fetch: bool,
}

impl MemoryRequest {
    pub fn read(id: RequestId, requestor: RequestorId, data_address: Address, data_size: usize) -> Self {
        Self {
            id,
            requestor,
            request_type: MemoryRequestType::READ,
            data_address,
            data_size,
            data: None,
            inst_fetch: false,
        }
    }

    pub fn write(id: RequestId, requestor: RequestorId, data_address: Address, data: Vec<u8>) -> Self {
        Self {
            id,
            requestor,
            request_type: MemoryRequestType::WRITE,
            data_address,
            data_size: data.len(),
            data: Some(data),
            inst_fetch: false,
        }
    }

    pub fn with_inst_fetch(mut self, inst_fetch: bool) -> Self {
        self.inst_fetch = inst_fetch;
        self
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        self.request_type == MemoryRequestType::READ
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.request_type == MemoryRequestType::WRITE
    }

    /// address of the block containing the first byte, `block_size` must be a power of two
    #[inline]
    pub fn block_address(&self, block_size: usize) -> Address {
        self.data_address & !(block_size as Address - 1)
    }

    /// true if the whole access lives inside a single block
    pub fn fits_in_block(&self, block_size: usize) -> bool {
        let offset = (self.data_address - self.block_address(block_size)) as usize;
        offset + self.data_size.max(1) <= block_size
    }

    /// copy the requested bytes out of a block that starts at `block_base`
    pub fn read_from_block(&self, block: &[u8], block_base: Address) -> Vec<u8> {
        let offset = (self.data_address - block_base) as usize;
        assert!(offset + self.data_size <= block.len(), "read does not fit the block");
        block[offset..offset + self.data_size].to_vec()
    }

    /// bytes carried by a write
    pub fn payload(&self) -> &[u8] {
        match &self.data {
            Some(data) => data,
            None => panic!("protocol violation: write {self} carries no data"),
        }
    }

    /// store the write payload into a block that starts at `block_base`
    pub fn write_into_block(&self, block: &mut [u8], block_base: Address) {
        let data = self.payload();
        let offset = (self.data_address - block_base) as usize;
        assert!(offset + data.len() <= block.len(), "write does not fit the block");
        block[offset..offset + data.len()].copy_from_slice(data);
    }

    /// turn this request into its response, consuming it
    pub fn make_response(self, data: Vec<u8>) -> MemoryResponse {
        MemoryResponse {
            request: self,
            data,
            status: MemoryResponseType::Valid,
        }
    }

    pub fn make_error_response(self, status: MemoryResponseType) -> MemoryResponse {
        debug_assert!(status != MemoryResponseType::Valid);
        MemoryResponse {
            request: self,
            data: vec![],
            status,
        }
    }
}

impl Display for MemoryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {:?} [{:#x}+{}]",
            self.id,
            self.request_type,
            self.data_address,
            self.data_size
        )
    }
}

/// Always produced for exactly one request, which it carries back to the requestor
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResponse {
    pub request: MemoryRequest,
    pub data: Vec<u8>,
    pub status: MemoryResponseType,
}

impl MemoryResponse {
    #[inline]
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.request.data_address
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == MemoryResponseType::Valid
    }
}
