use nusb::DeviceInfo;

use crate::{DapError, ProbeId};

/// Known CMSIS-DAP v2 probes.
#[derive(Debug, Clone, Copy)]
struct KnownProbe {
    id: ProbeId,
    name: &'static str,
}

static KNOWN_PROBES: &[KnownProbe] = &[
    KnownProbe {
        id: ProbeId::HORCO,
        name: "Horco CMSIS-DAP",
    },
    // Arm DAPLink
    KnownProbe {
        id: ProbeId {
            vid: 0x0d28,
            pid: 0x0204,
        },
        name: "DAPLink",
    },
    // Raspberry Pi Debug Probe
    KnownProbe {
        id: ProbeId {
            vid: 0x2e8a,
            pid: 0x000c,
        },
        name: "Raspberry Pi Debug Probe",
    },
];

pub struct ProbeInfo {
    pub usb_device: DeviceInfo,
    pub id: ProbeId,
    pub name: &'static str,
}

impl ProbeInfo {
    fn new(usb_device: DeviceInfo) -> Self {
        let id = ProbeId {
            vid: usb_device.vendor_id(),
            pid: usb_device.product_id(),
        };
        let name = KNOWN_PROBES
            .iter()
            .find(|probe| probe.id == id)
            .map_or("CMSIS-DAP", |probe| probe.name);
        Self {
            usb_device,
            id,
            name,
        }
    }
}

/// Lists every attached device matching one of the known CMSIS-DAP identities.
pub fn list_all_probes() -> Result<Vec<ProbeInfo>, DapError> {
    fn filter_map(info: DeviceInfo) -> Option<ProbeInfo> {
        let id = (info.vendor_id(), info.product_id());
        KNOWN_PROBES
            .iter()
            .any(|probe| (probe.id.vid, probe.id.pid) == id)
            .then(|| ProbeInfo::new(info))
    }
    Ok(nusb::list_devices()?.filter_map(filter_map).collect())
}

/// Finds the probe with the given identity.
///
/// Several attached probes with the same VID/PID are not told apart: the
/// first one reported by the operating system is returned and a warning is
/// logged.
pub fn discover(id: ProbeId) -> Result<ProbeInfo, DapError> {
    let mut matches: Vec<DeviceInfo> = nusb::list_devices()?
        .filter(|info| info.vendor_id() == id.vid && info.product_id() == id.pid)
        .collect();
    if matches.len() > 1 {
        log::warn!(
            "Found {} probes with id {id}, using the first one (bus {} address {})",
            matches.len(),
            matches[0].bus_number(),
            matches[0].device_address()
        );
    }
    if matches.is_empty() {
        return Err(DapError::DeviceNotFound(id));
    }
    let probe = ProbeInfo::new(matches.swap_remove(0));
    log::info!(
        "Find {}:[{:#06x?},{:#06x?}]",
        probe.name,
        probe.id.vid,
        probe.id.pid
    );
    Ok(probe)
}
