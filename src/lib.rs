//! Native CMSIS-DAP flasher for STM32F4 targets
//!
//! This crate talks to a CMSIS-DAP v2 debug probe over USB bulk endpoints and
//! drives the target's flash controller through SWD memory accesses. No
//! OpenOCD or other debug backend is involved: every packet on the wire is
//! built here.
//!
//! # Quickstart
//!
//! * Linux users only: add an udev rule granting access to the probe.
//! * `cargo run --example flash -- firmware.bin`
//!
//! # Limitations
//!
//! * Only SWD, only single-core Cortex-M4 targets.
//! * Only the fixed 12 x 64 KiB sector table described by [`target::TargetConfig::STM32F4`].
//! * When several probes share the same VID/PID the first one found is used.

#![forbid(unsafe_code)]

pub mod delay;
pub mod flash;
pub mod image;
pub mod link;
mod list;
pub use list::{ProbeInfo, discover, list_all_probes};
pub mod session;
#[cfg(test)]
mod sim;
pub mod swd;
pub mod target;
pub mod transport;

pub use flash::FlashError;
pub use image::FirmwareImage;
pub use session::{FlashOptions, FlashReport, flash_file, flash_firmware, program_target};

/// USB identity of a CMSIS-DAP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeId {
    pub vid: u16,
    pub pid: u16,
}

impl ProbeId {
    /// Horco CMSIS-DAP
    pub const HORCO: ProbeId = ProbeId {
        vid: 0xfaed,
        pid: 0x4870,
    };
}

impl Default for ProbeId {
    fn default() -> Self {
        Self::HORCO
    }
}

impl std::fmt::Display for ProbeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("A USB transport error occurred.")]
    ///
    /// This variant is used for all errors reported by the operating system when performing a USB
    /// operation. It may indicate that the USB device was unplugged, that another application or an
    /// operating system driver is currently using it, or that the current user does not have
    /// permission to access it.
    Usb(#[from] std::io::Error),

    #[error("No CMSIS-DAP probe found with id {0}")]
    DeviceNotFound(ProbeId),

    #[error("Endpoint resolution failed: {0}")]
    /// The probe exposes no interface with both a bulk OUT and a bulk IN endpoint.
    EndpointResolutionFailed(String),

    #[error("Packet of {len} bytes exceeds the probe packet size of {max} bytes")]
    PacketTooLarge { len: usize, max: usize },

    #[error("Unexpected response to command {command:#04x}: {response:02x?}")]
    /// The response is empty, too short, or does not echo the command id.
    UnexpectedResponse { command: u8, response: Vec<u8> },

    #[error("SWD connect failed, probe reported port {0}")]
    ConnectFailed(u8),

    #[error("Command {command:#04x} failed with status {status:#04x}")]
    ConfigureFailed { command: u8, status: u8 },

    #[error("Target reset failed with status {0:#04x}")]
    ResetFailed(u8),
}
