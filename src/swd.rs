use crate::{DapError, link::DapLink, transport::DapTransport};

#[derive(Debug, thiserror::Error)]
pub enum SwdError {
    #[error("Dap inner error")]
    Dap(#[from] DapError),
    #[error("Transfer executed {executed} of {requested} requests (ack {ack:#05b}).")]
    TransferMismatch { requested: u8, executed: u8, ack: u8 },
    #[error("Transfer response too short: {0:02x?}")]
    ShortResponse(Vec<u8>),
    #[error("Transfer of {requests} requests does not fit a {packet_size} byte packet.")]
    BatchTooLarge { requests: usize, packet_size: usize },
}

/// Register offsets. A[3:2] of the SWD request.
pub mod reg {
    pub const DP_IDCODE: u8 = 0x0;
    pub const DP_CTRL_STAT: u8 = 0x4;
    pub const DP_SELECT: u8 = 0x8;
    pub const DP_RDBUFF: u8 = 0xC;
    pub const AP_CSW: u8 = 0x0;
    pub const AP_TAR: u8 = 0x4;
    pub const AP_DRW: u8 = 0xC;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdAddr {
    Dp(u8),
    Ap(u8),
}

/// Register-select byte of a DAP_Transfer request.
///
/// LSB Format: [RnW, APnDP, A[3:2], reserved(4)]
#[bitfield_struct::bitfield(u8, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct RegisterSelect {
    /// 1 = read, 0 = write
    pub read: bool,
    /// 1 = access port, 0 = debug port
    pub ap: bool,
    #[bits(2)]
    pub bank: u8,
    #[bits(4)]
    _reserved: u8,
}

impl RegisterSelect {
    pub fn encode(is_read: bool, addr: SwdAddr) -> Self {
        let (ap, offset) = match addr {
            SwdAddr::Dp(offset) => (false, offset),
            SwdAddr::Ap(offset) => (true, offset),
        };
        Self::new()
            .with_read(is_read)
            .with_ap(ap)
            .with_bank((offset >> 2) & 0b11)
    }
}

/// AP Control/Status Word.
#[bitfield_struct::bitfield(u32, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct Csw {
    /// 0b010 = 32 bit
    #[bits(3)]
    pub size: u8,
    _r0: bool,
    /// 0b00 = no auto increment
    #[bits(2)]
    pub addr_inc: u8,
    pub device_en: bool,
    pub tr_in_prog: bool,
    #[bits(4)]
    pub mode: u8,
    #[bits(4)]
    pub kind: u8,
    #[bits(7)]
    _r1: u8,
    pub spiden: bool,
    #[bits(7)]
    pub prot: u8,
    pub dbg_sw_enable: bool,
}

impl Csw {
    /// 32-bit, non-incrementing, privileged debug access.
    pub const WORD: Csw = Csw::new().with_size(0b010).with_addr_inc(0).with_prot(0x23);
}

/// A batch of register accesses sent as one DAP_Transfer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    requests: Vec<(RegisterSelect, Option<u32>)>,
}

impl TransferRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, addr: SwdAddr) -> &mut Self {
        self.requests.push((RegisterSelect::encode(true, addr), None));
        self
    }

    pub fn write(&mut self, addr: SwdAddr, value: u32) -> &mut Self {
        self.requests
            .push((RegisterSelect::encode(false, addr), Some(value)));
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn reads(&self) -> usize {
        self.requests.iter().filter(|(r, _)| r.read()).count()
    }

    /// `[dap_index, count, (select, value LE)...]`
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.requests.len() * 5);
        payload.push(0); // dap index, ignored in SWD mode
        payload.push(self.requests.len() as u8);
        for (select, value) in &self.requests {
            payload.push(select.into_bits());
            if let Some(value) = value {
                payload.extend_from_slice(&value.to_le_bytes());
            }
        }
        payload
    }
}

/// Outcome of a DAP_Transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub executed: u8,
    /// Acknowledge of the last executed request
    pub ack: u8,
    /// Read data in request order
    pub data: Vec<u32>,
}

impl TransferResult {
    /// Parses `[id, executed, ack, words LE...]`.
    pub fn decode(response: &[u8]) -> Result<Self, SwdError> {
        let [_, executed, ack, words @ ..] = response else {
            return Err(SwdError::ShortResponse(response.to_vec()));
        };
        let data = words
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Self {
            executed: *executed,
            ack: *ack,
            data,
        })
    }
}

/// 32-bit word access to target memory.
pub trait MemoryAccess {
    fn read_word(&mut self, address: u32) -> Result<u32, SwdError>;
    fn write_word(&mut self, address: u32, value: u32) -> Result<(), SwdError>;
}

/// Serial Wire Debug access through a CMSIS-DAP probe.
///
/// Memory goes through AP 0 (MEM-AP): SELECT, CSW, TAR, then DRW.
pub struct SwdAccess<T: DapTransport> {
    link: DapLink<T>,
    csw: Csw,
}

impl<T: DapTransport> SwdAccess<T> {
    pub fn new(link: DapLink<T>, csw: Csw) -> Self {
        Self { link, csw }
    }

    pub fn link(&mut self) -> &mut DapLink<T> {
        &mut self.link
    }

    pub fn into_link(self) -> DapLink<T> {
        self.link
    }

    /// Runs one batch. Anything short of full execution is an error.
    pub fn transfer(&mut self, request: &TransferRequest) -> Result<TransferResult, SwdError> {
        // 1 byte command id, 2 bytes header, 1 + 4 bytes per request
        let packet_size = self.link.packet_size();
        let payload = request.encode();
        let out_len = 1 + payload.len();
        let in_len = 3 + request.reads() * 4;
        if request.len() > u8::MAX as usize || out_len > packet_size || in_len > packet_size {
            return Err(SwdError::BatchTooLarge {
                requests: request.len(),
                packet_size,
            });
        }

        let command = self.link.commands().transfer;
        let response = self.link.command(command, &payload)?;
        let mut result = TransferResult::decode(&response)?;
        let requested = request.len() as u8;
        if result.executed != requested {
            log::debug!(
                "Transfer stopped after {} of {requested} requests, ack {:#05b}",
                result.executed,
                result.ack
            );
            return Err(SwdError::TransferMismatch {
                requested,
                executed: result.executed,
                ack: result.ack,
            });
        }
        if result.data.len() < request.reads() {
            return Err(SwdError::ShortResponse(response));
        }
        // some probes pad the response to a full packet
        result.data.truncate(request.reads());
        Ok(result)
    }

    pub fn read(&mut self, addr: SwdAddr) -> Result<u32, SwdError> {
        let mut request = TransferRequest::new();
        request.read(addr);
        let result = self.transfer(&request)?;
        Ok(result.data[0])
    }

    pub fn write(&mut self, addr: SwdAddr, value: u32) -> Result<(), SwdError> {
        let mut request = TransferRequest::new();
        request.write(addr, value);
        self.transfer(&request)?;
        Ok(())
    }

    pub fn read_dp(&mut self, reg: u8) -> Result<u32, SwdError> {
        self.read(SwdAddr::Dp(reg))
    }

    pub fn write_dp(&mut self, reg: u8, value: u32) -> Result<(), SwdError> {
        self.write(SwdAddr::Dp(reg), value)
    }

    pub fn read_ap(&mut self, reg: u8) -> Result<u32, SwdError> {
        self.read(SwdAddr::Ap(reg))
    }

    pub fn write_ap(&mut self, reg: u8, value: u32) -> Result<(), SwdError> {
        self.write(SwdAddr::Ap(reg), value)
    }

    fn address_word(&self, request: &mut TransferRequest, address: u32) {
        // APSEL 0, APBANKSEL 0
        request
            .write(SwdAddr::Dp(reg::DP_SELECT), 0)
            .write(SwdAddr::Ap(reg::AP_CSW), self.csw.into_bits())
            .write(SwdAddr::Ap(reg::AP_TAR), address);
    }
}

impl<T: DapTransport> MemoryAccess for SwdAccess<T> {
    fn read_word(&mut self, address: u32) -> Result<u32, SwdError> {
        let mut request = TransferRequest::new();
        self.address_word(&mut request, address);
        request.read(SwdAddr::Ap(reg::AP_DRW));
        let result = self.transfer(&request)?;
        log::trace!("read {address:#010x} = {:#010x}", result.data[0]);
        Ok(result.data[0])
    }

    fn write_word(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        let mut request = TransferRequest::new();
        self.address_word(&mut request, address);
        request.write(SwdAddr::Ap(reg::AP_DRW), value);
        self.transfer(&request)?;
        log::trace!("write {address:#010x} = {value:#010x}");
        Ok(())
    }
}
