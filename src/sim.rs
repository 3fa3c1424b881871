//! In-memory CMSIS-DAP probe attached to a simulated STM32F4 for tests.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use crate::{
    DapError,
    link::{CommandSet, InfoId},
    swd::{MemoryAccess, SwdError, reg},
    target::{FlashCr, FlashSr, TargetConfig},
    transport::{DapTransport, frame},
};

const TARGET: TargetConfig = TargetConfig::STM32F4;
const ACK_OK: u8 = 0b001;
const ACK_FAULT: u8 = 0b100;

pub struct SimTarget {
    /// Command ids in the order they arrived
    pub commands: Vec<u8>,
    pub clock_hz: Option<u32>,
    pub transfer_config: Option<[u8; 5]>,
    pub swd_config: Option<u8>,
    pub transport_dropped: bool,

    pub connect_status: u8,
    /// Status byte answered for a command id instead of 0
    pub status_overrides: HashMap<u8, u8>,
    pub echo_override: Option<u8>,
    /// Raw DAP_Info answer after the echoed id, keyed by info id
    pub info_overrides: HashMap<u8, Vec<u8>>,
    pub advertised_packet_size: u16,
    /// Stop every transfer after this many requests
    pub execute_limit: Option<u8>,

    pub idcode: u32,
    pub select: u32,
    pub csw: u32,
    pub tar: u32,
    /// Select byte and write value of every request in the last transfer
    pub last_transfer: Vec<(u8, Option<u32>)>,
    /// Memory accesses that reached the target
    pub accesses: usize,
    /// Memory accesses to this address answer FAULT
    pub fault_at: Option<u32>,

    /// Words written so far; unwritten flash reads erased
    pub memory: HashMap<u32, u32>,
    /// Values returned instead of `memory` on read
    pub corrupt: HashMap<u32, u32>,

    pub locked: bool,
    pub refuse_keys: bool,
    pub keyr_writes: Vec<u32>,
    pub cr: u32,
    pub sr: u32,
    pub sr_reads: usize,
    /// SR reads reporting BSY after each operation
    pub busy_polls: u32,
    busy_remaining: u32,
    pub stuck_busy: bool,
    /// SR flags raised by every erase or program operation
    pub error_after_op: u32,
    /// Programming this address raises PGSERR and stores nothing
    pub program_error_at: Option<u32>,
    pub erased_sectors: Vec<u32>,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            clock_hz: None,
            transfer_config: None,
            swd_config: None,
            transport_dropped: false,
            connect_status: 1,
            status_overrides: HashMap::new(),
            echo_override: None,
            info_overrides: HashMap::new(),
            advertised_packet_size: 64,
            execute_limit: None,
            idcode: 0x2BA0_1477,
            select: 0,
            csw: 0,
            tar: 0,
            last_transfer: Vec::new(),
            accesses: 0,
            fault_at: None,
            memory: HashMap::new(),
            corrupt: HashMap::new(),
            locked: true,
            refuse_keys: false,
            keyr_writes: Vec::new(),
            cr: 0,
            sr: 0,
            sr_reads: 0,
            busy_polls: 0,
            busy_remaining: 0,
            stuck_busy: false,
            error_after_op: 0,
            program_error_at: None,
            erased_sectors: Vec::new(),
        }
    }
}

fn in_flash(address: u32) -> bool {
    TARGET.sectors.sector_index(address).is_some()
}

impl SimTarget {
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Stores consecutive words starting at `address`.
    pub fn fill(&mut self, address: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.memory.insert(address + i as u32 * 4, *word);
        }
    }

    /// Memory content without side effects.
    pub fn peek(&self, address: u32) -> u32 {
        match self.memory.get(&address) {
            Some(word) => *word,
            None if in_flash(address) => 0xFFFF_FFFF,
            None => 0,
        }
    }

    fn start_operation(&mut self) {
        self.busy_remaining = self.busy_polls;
        self.sr |= self.error_after_op;
    }

    pub fn read(&mut self, address: u32) -> u32 {
        self.accesses += 1;
        let flash = TARGET.flash;
        if address == flash.cr {
            let lock = if self.locked { 1 << 31 } else { 0 };
            self.cr | lock
        } else if address == flash.sr {
            self.sr_reads += 1;
            let busy = self.stuck_busy || self.busy_remaining > 0;
            self.busy_remaining = self.busy_remaining.saturating_sub(1);
            FlashSr::from_bits(self.sr).with_bsy(busy).into_bits()
        } else if let Some(word) = self.corrupt.get(&address) {
            *word
        } else {
            self.peek(address)
        }
    }

    pub fn write(&mut self, address: u32, value: u32) {
        self.accesses += 1;
        let flash = TARGET.flash;
        if address == flash.keyr {
            self.keyr_writes.push(value);
            let keys = [flash.key1, flash.key2];
            if !self.refuse_keys && self.keyr_writes.ends_with(&keys) {
                self.locked = false;
            }
        } else if address == flash.sr {
            self.sr &= !value;
        } else if address == flash.cr {
            self.write_cr(FlashCr::from_bits(value));
        } else if in_flash(address) {
            self.program(address, value);
        } else {
            self.memory.insert(address, value);
        }
    }

    fn write_cr(&mut self, cr: FlashCr) {
        if self.locked {
            return;
        }
        if cr.lock() {
            self.locked = true;
            self.cr = cr.with_lock(false).into_bits();
            return;
        }
        self.cr = cr.with_strt(false).into_bits();
        if cr.ser() && cr.strt() {
            let sector = cr.snb() as u32;
            let start = TARGET.sectors.sector_address(sector);
            let end = start + TARGET.sectors.sector_size;
            self.memory.retain(|address, _| !(start..end).contains(address));
            self.erased_sectors.push(sector);
            self.start_operation();
        }
    }

    fn program(&mut self, address: u32, value: u32) {
        let cr = FlashCr::from_bits(self.cr);
        if self.locked || !cr.pg() || self.program_error_at == Some(address) {
            self.sr |= FlashSr::new().with_pgserr(true).into_bits();
            return;
        }
        let old = self.peek(address);
        self.memory.insert(address, old & value);
        self.start_operation();
    }

    fn dp_read(&mut self, offset: u8) -> u32 {
        match offset {
            reg::DP_IDCODE => self.idcode,
            reg::DP_SELECT => self.select,
            _ => 0,
        }
    }

    fn ap_read(&mut self, offset: u8) -> u32 {
        match offset {
            reg::AP_CSW => self.csw,
            reg::AP_TAR => self.tar,
            reg::AP_DRW => self.read(self.tar),
            _ => 0,
        }
    }

    fn ap_write(&mut self, offset: u8, value: u32) {
        match offset {
            reg::AP_CSW => self.csw = value,
            reg::AP_TAR => self.tar = value,
            reg::AP_DRW => self.write(self.tar, value),
            _ => {}
        }
    }

    /// Runs a DAP_Transfer payload, returns `[executed, ack, words...]`.
    fn transfer(&mut self, payload: &[u8]) -> Vec<u8> {
        let count = payload.get(1).copied().unwrap_or(0);
        let mut rest = payload.get(2..).unwrap_or(&[]);
        let mut requests = Vec::new();
        for _ in 0..count {
            let Some((&select, tail)) = rest.split_first() else {
                break;
            };
            if select & 1 == 1 {
                requests.push((select, None));
                rest = tail;
            } else {
                let value = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
                requests.push((select, Some(value)));
                rest = &tail[4..];
            }
        }
        self.last_transfer = requests.clone();

        let limit = self.execute_limit.unwrap_or(u8::MAX);
        let mut executed = 0u8;
        let mut ack = ACK_OK;
        let mut data = Vec::new();
        for (select, value) in requests {
            if executed == limit {
                ack = 0b010;
                break;
            }
            let ap = select & 0b10 != 0;
            let offset = (select >> 2 & 0b11) << 2;
            if ap && offset == reg::AP_DRW && self.fault_at == Some(self.tar) {
                ack = ACK_FAULT;
                break;
            }
            match (ap, value) {
                (false, None) => data.push(self.dp_read(offset)),
                (false, Some(value)) => {
                    if offset == reg::DP_SELECT {
                        self.select = value;
                    }
                }
                (true, None) => data.push(self.ap_read(offset)),
                (true, Some(value)) => self.ap_write(offset, value),
            }
            executed += 1;
        }

        let mut response = vec![executed, ack];
        for word in data {
            response.extend_from_slice(&word.to_le_bytes());
        }
        response
    }

    fn info(&self, id: u8) -> Vec<u8> {
        if let Some(raw) = self.info_overrides.get(&id) {
            return raw.clone();
        }
        let value: Vec<u8> = match id {
            x if x == InfoId::Product as u8 => b"Simulated CMSIS-DAP\0".to_vec(),
            x if x == InfoId::PacketSize as u8 => self.advertised_packet_size.to_le_bytes().to_vec(),
            x if x == InfoId::PacketCount as u8 => vec![1],
            _ => Vec::new(),
        };
        let mut response = vec![value.len() as u8];
        response.extend(value);
        response
    }

    fn status(&self, command: u8) -> u8 {
        self.status_overrides.get(&command).copied().unwrap_or(0)
    }

    fn handle(&mut self, command: u8, payload: &[u8]) -> Vec<u8> {
        let ids = CommandSet::default();
        self.commands.push(command);
        let body = match command {
            c if c == ids.info => self.info(payload.first().copied().unwrap_or(0)),
            c if c == ids.connect => vec![self.connect_status],
            c if c == ids.swj_clock => {
                if let Ok(hz) = payload.try_into() {
                    self.clock_hz = Some(u32::from_le_bytes(hz));
                }
                vec![self.status(command)]
            }
            c if c == ids.transfer_configure => {
                self.transfer_config = payload.try_into().ok();
                vec![self.status(command)]
            }
            c if c == ids.swd_configure => {
                self.swd_config = payload.first().copied();
                vec![self.status(command)]
            }
            c if c == ids.transfer => self.transfer(payload),
            _ => vec![self.status(command)],
        };
        let mut response = vec![self.echo_override.unwrap_or(command)];
        response.extend(body);
        response
    }
}

/// Transport wired straight to a [`SimTarget`].
pub struct SimProbe {
    target: Rc<RefCell<SimTarget>>,
}

impl SimProbe {
    pub fn new(target: Rc<RefCell<SimTarget>>) -> Self {
        Self { target }
    }
}

impl DapTransport for SimProbe {
    fn send(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, DapError> {
        let packet = frame(command, payload, self.packet_size())?;
        let (command, payload) = (packet[0], &packet[1..=payload.len()]);
        Ok(self.target.borrow_mut().handle(command, payload))
    }

    fn packet_size(&self) -> usize {
        64
    }
}

impl Drop for SimProbe {
    fn drop(&mut self) {
        self.target.borrow_mut().transport_dropped = true;
    }
}

/// Direct memory access to a [`SimTarget`], bypassing the DAP framing.
pub struct SimMemory(pub Rc<RefCell<SimTarget>>);

impl MemoryAccess for SimMemory {
    fn read_word(&mut self, address: u32) -> Result<u32, SwdError> {
        let mut target = self.0.borrow_mut();
        if target.fault_at == Some(address) {
            return Err(SwdError::TransferMismatch {
                requested: 4,
                executed: 3,
                ack: ACK_FAULT,
            });
        }
        Ok(target.read(address))
    }

    fn write_word(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        let mut target = self.0.borrow_mut();
        if target.fault_at == Some(address) {
            return Err(SwdError::TransferMismatch {
                requested: 4,
                executed: 3,
                ack: ACK_FAULT,
            });
        }
        target.write(address, value);
        Ok(())
    }
}
