use async_io::Timer;
use futures_lite::{FutureExt, future::block_on};
use nusb::transfer::{Direction, EndpointType, RequestBuffer};
use std::{io, time::Duration};

use crate::{DapError, list::ProbeInfo};

/// Default bound on a single USB transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Request/response channel to a CMSIS-DAP probe.
///
/// One call is one command packet out and one response packet in. The first
/// byte of the response echoes the command id; checking it is left to the
/// caller.
pub trait DapTransport {
    fn send(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, DapError>;

    /// Size of one USB packet in bytes.
    fn packet_size(&self) -> usize;
}

/// One endpoint as read from the interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDesc {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub max_packet_size: usize,
}

/// The bulk endpoint pair a CMSIS-DAP v2 interface talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface: u8,
    pub out_ep: u8,
    pub in_ep: u8,
    pub max_packet_size: usize,
}

impl BulkEndpoints {
    /// Picks the first bulk OUT and the first bulk IN endpoint of an interface.
    pub fn resolve(
        interface: u8,
        endpoints: impl IntoIterator<Item = EndpointDesc>,
    ) -> Option<Self> {
        let mut out_ep = None;
        let mut in_ep = None;
        for ep in endpoints {
            if ep.transfer_type != EndpointType::Bulk {
                continue;
            }
            match ep.direction {
                Direction::Out if out_ep.is_none() => out_ep = Some(ep),
                Direction::In if in_ep.is_none() => in_ep = Some(ep),
                _ => {}
            }
        }
        let (out_ep, in_ep) = (out_ep?, in_ep?);
        Some(Self {
            interface,
            out_ep: out_ep.address,
            in_ep: in_ep.address,
            max_packet_size: in_ep.max_packet_size.min(out_ep.max_packet_size),
        })
    }
}

/// `[command] ++ payload`, zero-padded to one full packet.
pub fn frame(command: u8, payload: &[u8], packet_size: usize) -> Result<Vec<u8>, DapError> {
    let len = payload.len() + 1;
    if len > packet_size {
        return Err(DapError::PacketTooLarge {
            len,
            max: packet_size,
        });
    }
    let mut packet = Vec::with_capacity(packet_size);
    packet.push(command);
    packet.extend_from_slice(payload);
    packet.resize(packet_size, 0);
    Ok(packet)
}

/// CMSIS-DAP v2 transport over USB bulk endpoints.
///
/// Dropping it releases the claimed interface and closes the device.
pub struct UsbTransport {
    /// Claimed USB interface
    handle: nusb::Interface,
    endpoints: BulkEndpoints,
    timeout: Duration,
}

impl UsbTransport {
    /// Opens the probe, selects its configuration and claims the first
    /// interface carrying a bulk OUT/IN endpoint pair.
    pub fn claim(probe: &ProbeInfo, timeout: Duration) -> Result<Self, DapError> {
        let device = probe.usb_device.open()?;
        let config = match device.active_configuration() {
            Ok(config) => config,
            Err(_) => {
                log::debug!("Device unconfigured, selecting configuration 1");
                device.set_configuration(1)?;
                device
                    .active_configuration()
                    .map_err(|e| DapError::Usb(e.into()))?
            }
        };
        let endpoints = config
            .interface_alt_settings()
            .find_map(|alt| {
                let descs = alt.endpoints().map(|ep| EndpointDesc {
                    address: ep.address(),
                    direction: ep.direction(),
                    transfer_type: ep.transfer_type(),
                    max_packet_size: ep.max_packet_size(),
                });
                BulkEndpoints::resolve(alt.interface_number(), descs)
            })
            .ok_or(DapError::EndpointResolutionFailed(format!(
                "no bulk OUT/IN endpoint pair on {}",
                probe.id
            )))?;
        let handle = device.detach_and_claim_interface(endpoints.interface)?;
        log::info!(
            "Claimed interface {} (OUT {:#04x}, IN {:#04x}, {} byte packets)",
            endpoints.interface,
            endpoints.out_ep,
            endpoints.in_ep,
            endpoints.max_packet_size
        );
        Ok(Self {
            handle,
            endpoints,
            timeout,
        })
    }

    async fn timeout<T>(&self) -> io::Result<T> {
        Timer::after(self.timeout).await;
        Err(io::ErrorKind::TimedOut.into())
    }
}

impl DapTransport for UsbTransport {
    fn send(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, DapError> {
        let packet_size = self.endpoints.max_packet_size;
        let packet = frame(command, payload, packet_size)?;
        log::trace!("OUT {:02x?}", &packet[..payload.len() + 1]);

        let write = async {
            self.handle
                .bulk_out(self.endpoints.out_ep, packet)
                .await
                .into_result()
                .map_err(io::Error::from)?;
            Ok::<_, io::Error>(())
        };
        block_on(write.or(self.timeout()))?;

        let read = async {
            let response = self
                .handle
                .bulk_in(self.endpoints.in_ep, RequestBuffer::new(packet_size))
                .await
                .into_result()
                .map_err(io::Error::from)?;
            Ok::<_, io::Error>(response)
        };
        let response = block_on(read.or(self.timeout()))?;
        log::trace!("IN  {:02x?}", response);
        Ok(response)
    }

    fn packet_size(&self) -> usize {
        self.endpoints.max_packet_size
    }
}
