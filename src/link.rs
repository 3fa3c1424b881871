//! Probe lifecycle: connect, configure, reset and release.

use crate::{DapError, transport::DapTransport};

/// Command ids of the CMSIS-DAP subset used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    pub info: u8,
    pub connect: u8,
    pub disconnect: u8,
    pub reset_target: u8,
    pub swj_clock: u8,
    pub swd_configure: u8,
    pub transfer_configure: u8,
    pub transfer: u8,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            info: 0x00,
            connect: 0x02,
            disconnect: 0x03,
            reset_target: 0x0A,
            swj_clock: 0x13,
            swd_configure: 0x15,
            transfer_configure: 0x16,
            transfer: 0x17,
        }
    }
}

/// DAP_Info ids
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoId {
    Vendor = 0x01,
    Product = 0x02,
    SerialNumber = 0x03,
    FirmwareVersion = 0x04,
    PacketCount = 0xFE,
    PacketSize = 0xFF,
}

/// Link parameters negotiated right after connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// SWCLK frequency in Hz
    pub clock_hz: u32,
    /// Idle cycles after each transfer
    pub idle_cycles: u8,
    /// Retries on a WAIT acknowledge
    pub wait_retry: u16,
    /// Retries on a value mismatch read
    pub match_retry: u16,
    /// SWD_Configure byte: turnaround period in bits 0..1, data phase in bit 2
    pub swd_config: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            clock_hz: 2_000_000,
            idle_cycles: 0,
            wait_retry: 64,
            match_retry: 8,
            swd_config: 0x00,
        }
    }
}

const PORT_SWD: u8 = 1;
const DAP_OK: u8 = 0;

/// An open CMSIS-DAP probe.
///
/// The probe is disconnected and its transport dropped exactly once, either by
/// [`DapLink::release`] or when the link goes out of scope.
pub struct DapLink<T: DapTransport> {
    transport: T,
    commands: CommandSet,
    /// Usable bytes per packet, the smaller of the USB and the advertised size
    packet_size: usize,
    released: bool,
}

impl<T: DapTransport> DapLink<T> {
    pub fn new(transport: T, commands: CommandSet) -> Self {
        let packet_size = transport.packet_size();
        Self {
            transport,
            commands,
            packet_size,
            released: false,
        }
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Sends a command and checks that the response echoes its id.
    pub fn command(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, DapError> {
        let response = self.transport.send(command, payload)?;
        if response.first() != Some(&command) {
            return Err(DapError::UnexpectedResponse { command, response });
        }
        Ok(response)
    }

    /// Sends a command answered by `[id, status]` and requires status 0.
    fn status_command(&mut self, command: u8, payload: &[u8]) -> Result<(), DapError> {
        let response = self.command(command, payload)?;
        match response.get(1) {
            Some(&DAP_OK) => Ok(()),
            Some(&status) => Err(DapError::ConfigureFailed { command, status }),
            None => Err(DapError::UnexpectedResponse { command, response }),
        }
    }

    /// Raw DAP_Info answer, without the id and length bytes.
    pub fn info(&mut self, id: InfoId) -> Result<Vec<u8>, DapError> {
        let command = self.commands.info;
        let response = self.command(command, &[id as u8])?;
        let Some(&len) = response.get(1) else {
            return Err(DapError::UnexpectedResponse { command, response });
        };
        let end = 2 + len as usize;
        if response.len() < end {
            return Err(DapError::UnexpectedResponse { command, response });
        }
        Ok(response[2..end].to_vec())
    }

    /// DAP_Info string, `None` when the probe does not provide it.
    pub fn info_string(&mut self, id: InfoId) -> Result<Option<String>, DapError> {
        let raw = self.info(id)?;
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches('\0');
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    /// Asks the probe for its packet size and shrinks the usable size if the
    /// probe advertises less than the USB endpoint carries.
    pub fn negotiate_packet_size(&mut self) -> Result<usize, DapError> {
        let raw = self.info(InfoId::PacketSize)?;
        if let [lo, hi] = raw[..] {
            let advertised = u16::from_le_bytes([lo, hi]) as usize;
            if advertised > 0 {
                self.packet_size = advertised.min(self.transport.packet_size());
            }
            log::debug!(
                "Probe packet size {advertised} bytes, using {}",
                self.packet_size
            );
        } else {
            log::warn!("Probe did not report its packet size, using {}", self.packet_size);
        }
        Ok(self.packet_size)
    }

    /// Connects in SWD mode.
    pub fn connect(&mut self) -> Result<(), DapError> {
        let command = self.commands.connect;
        let response = self.command(command, &[PORT_SWD])?;
        match response.get(1) {
            Some(&PORT_SWD) => {
                log::info!("Connected (SWD)");
                Ok(())
            }
            Some(&port) => Err(DapError::ConnectFailed(port)),
            None => Err(DapError::UnexpectedResponse { command, response }),
        }
    }

    /// Sets clock, transfer retries and SWD line parameters, in that order.
    /// Stops at the first command the probe rejects.
    pub fn configure(&mut self, config: &LinkConfig) -> Result<(), DapError> {
        self.status_command(self.commands.swj_clock, &config.clock_hz.to_le_bytes())?;
        log::debug!("SWCLK set to {}Hz", config.clock_hz);

        let mut transfer = [0u8; 5];
        transfer[0] = config.idle_cycles;
        transfer[1..3].copy_from_slice(&config.wait_retry.to_le_bytes());
        transfer[3..5].copy_from_slice(&config.match_retry.to_le_bytes());
        self.status_command(self.commands.transfer_configure, &transfer)?;

        self.status_command(self.commands.swd_configure, &[config.swd_config])?;
        log::info!("Link configured");
        Ok(())
    }

    /// Resets the target through the probe.
    pub fn reset_target(&mut self) -> Result<(), DapError> {
        let command = self.commands.reset_target;
        let response = self.command(command, &[])?;
        match response.get(1) {
            Some(&DAP_OK) => Ok(()),
            Some(&status) => Err(DapError::ResetFailed(status)),
            None => Err(DapError::UnexpectedResponse { command, response }),
        }
    }

    fn disconnect(&mut self) -> Result<(), DapError> {
        self.status_command(self.commands.disconnect, &[])
    }

    /// Disconnects and gives the USB interface back to the system.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.disconnect() {
            log::warn!("Disconnect failed: {e}");
        }
        log::debug!("Probe released");
    }
}

impl<T: DapTransport> Drop for DapLink<T> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
