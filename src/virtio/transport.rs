//! Virtio transport controller.
//!
//! `Transport` is the controller half of the transport contract: it owns
//! the virtqueue table, runs feature negotiation policy, forwards
//! config-space accesses, and latches the device-to-driver interrupt. The
//! surrounding register file (MMIO or PCI) stays outside this crate; it
//! drives the transport through `queue_setup`/`queue_teardown` and the
//! negotiation calls and samples `irq_pending`.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{AddressRange, Dmi};

use super::message::Message;
use super::queue::Virtqueue;
use super::{feature, DeviceDesc, QueueDesc, VirtioController, VirtioDevice, VirtioStatus};

/// Feature bits the transport offers on top of whatever the device
/// supports. INDIRECT_DESC is deliberately absent: the queue engine
/// rejects indirect tables.
const TRANSPORT_FEATURES: u64 =
    feature::VERSION_1 | feature::RING_EVENT_IDX | feature::RING_PACKED;

pub struct Transport {
    device_desc: DeviceDesc,
    queues: BTreeMap<u32, Virtqueue>,
    dmi: Dmi,

    device_features: u64,
    driver_features: u64,

    irq_pending: bool,
}

impl Transport {
    pub fn new(dmi: Dmi) -> Self {
        Self {
            device_desc: DeviceDesc::default(),
            queues: BTreeMap::new(),
            dmi,
            device_features: 0,
            driver_features: 0,
            irq_pending: false,
        }
    }

    /// Identify the attached device and cache its queue requests.
    pub fn setup(&mut self, device: &mut dyn VirtioDevice) {
        self.device_desc.reset();
        device.identify(&mut self.device_desc);
        self.device_features = device.read_features() | TRANSPORT_FEATURES;
        debug!(
            "transport: device {} vendor {:#x}, {} virtqueues",
            self.device_desc.device_id,
            self.device_desc.vendor_id,
            self.device_desc.virtqueues.len()
        );
    }

    pub fn device_desc(&self) -> &DeviceDesc {
        &self.device_desc
    }

    /// Union of device and transport feature bits.
    pub fn read_features(&self) -> u64 {
        self.device_features
    }

    /// Negotiate the driver's feature selection: accepted iff a subset of
    /// what was offered and the device agrees.
    pub fn write_features(&mut self, device: &mut dyn VirtioDevice, features: u64) -> Result<()> {
        if features & !self.device_features != 0 {
            warn!(
                "transport: driver requested unoffered features {:#018x}",
                features & !self.device_features
            );
            return Err(Error::FeaturesRejected(features));
        }
        if !device.write_features(features) {
            return Err(Error::FeaturesRejected(features));
        }
        self.driver_features = features;
        Ok(())
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    fn has_feature(&self, bit: u64) -> bool {
        self.driver_features & bit != 0
    }

    /// Bring up a virtqueue the driver finished programming. The ring
    /// format and event-index use follow the negotiated features.
    pub fn queue_setup(&mut self, mut desc: QueueDesc) -> Result<()> {
        let requested = *self
            .device_desc
            .virtqueues
            .get(&desc.id)
            .ok_or(Error::QueueNotRequested(desc.id))?;

        if desc.size == 0 || desc.size > requested.limit {
            return Err(Error::QueueSizeExceeded {
                id: desc.id,
                size: desc.size,
                limit: requested.limit,
            });
        }

        desc.limit = requested.limit;
        desc.has_event_idx = self.has_feature(feature::RING_EVENT_IDX);
        let packed = self.has_feature(feature::RING_PACKED);

        let mut queue = Virtqueue::new(&desc, self.dmi.clone(), packed);
        if !queue.validate() {
            return Err(Error::QueueMemory(desc.id));
        }

        debug!(
            "transport: virtqueue {} up, size {}, {} ring",
            desc.id,
            desc.size,
            if packed { "packed" } else { "split" }
        );
        self.queues.insert(desc.id, queue);
        Ok(())
    }

    pub fn queue_teardown(&mut self, vqid: u32) {
        if self.queues.remove(&vqid).is_none() {
            warn!("transport: teardown of unknown virtqueue {}", vqid);
        }
    }

    pub fn queue(&self, vqid: u32) -> Option<&Virtqueue> {
        self.queues.get(&vqid)
    }

    /// Propagate a guest memory remap to every queue's cached spans.
    pub fn invalidate(&mut self, range: AddressRange) {
        for queue in self.queues.values_mut() {
            queue.invalidate(range);
        }
    }

    /// The driver kicked `vqid`; forward to the device, handing it this
    /// controller for draining.
    pub fn notify_device(&mut self, device: &mut dyn VirtioDevice, vqid: u32) -> bool {
        if !self.queues.contains_key(&vqid) {
            warn!("transport: notify for unknown virtqueue {}", vqid);
            return false;
        }
        device.notify(self, vqid)
    }

    /// Forward a config-space read.
    pub fn read_config(
        &mut self,
        device: &mut dyn VirtioDevice,
        offset: u64,
        data: &mut [u8],
    ) -> Result<()> {
        let range = AddressRange::with_length(offset, data.len() as u64);
        if !device.read_config(range, data) {
            return Err(Error::ConfigRange(offset, data.len() as u64));
        }
        Ok(())
    }

    /// Forward a config-space write.
    pub fn write_config(
        &mut self,
        device: &mut dyn VirtioDevice,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let range = AddressRange::with_length(offset, data.len() as u64);
        if !device.write_config(range, data) {
            return Err(Error::ConfigRange(offset, data.len() as u64));
        }
        Ok(())
    }

    /// Whether a device-to-driver interrupt is latched.
    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    /// Driver acknowledged the interrupt.
    pub fn irq_ack(&mut self) {
        self.irq_pending = false;
    }

    /// Drop all queues and negotiation state, e.g. on driver reset.
    pub fn reset(&mut self) {
        self.queues.clear();
        self.driver_features = 0;
        self.irq_pending = false;
    }
}

impl VirtioController for Transport {
    fn get(&mut self, vqid: u32, msg: &mut Message) -> bool {
        match self.queues.get_mut(&vqid) {
            Some(queue) => queue.get(msg),
            None => {
                warn!("transport: get on unknown virtqueue {}", vqid);
                msg.status = VirtioStatus::ErrDesc;
                false
            }
        }
    }

    fn put(&mut self, vqid: u32, msg: &mut Message) -> bool {
        let Some(queue) = self.queues.get_mut(&vqid) else {
            warn!("transport: put on unknown virtqueue {}", vqid);
            msg.status = VirtioStatus::ErrDesc;
            return false;
        };
        let ok = queue.put(msg);
        if ok && queue.should_notify() {
            self.irq_pending = true;
        }
        ok
    }

    fn notify(&mut self) -> bool {
        self.irq_pending = true;
        true
    }
}
