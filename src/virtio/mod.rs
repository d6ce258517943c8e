//! VirtIO transport protocol and virtqueue engine.
//!
//! This module carries the transport contract between a device model and
//! its controller (feature negotiation, config space, queue/irq
//! notification) together with the ring engines that move descriptor
//! chains between driver and device, per the virtio spec 1.1.

pub mod input;
pub mod message;
pub mod queue;
pub mod transport;

pub use input::VirtioInput;
pub use message::Message;
pub use queue::{PackedQueue, SplitQueue, Virtqueue};
pub use transport::Transport;

use std::collections::BTreeMap;
use std::fmt;

use crate::memory::AddressRange;

/// Outcome of a virtqueue operation, carried on the message.
///
/// `Incomplete` means no work was available and is not an error; the
/// negative values describe why a descriptor chain could not be walked.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtioStatus {
    #[default]
    Incomplete = 0,
    Ok = 1,
    ErrIndirect = -1,
    ErrNodmi = -2,
    ErrChain = -3,
    ErrDesc = -4,
}

impl VirtioStatus {
    pub fn is_success(self) -> bool {
        self as i32 > 0
    }

    pub fn is_failure(self) -> bool {
        (self as i32) < 0
    }
}

impl fmt::Display for VirtioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VirtioStatus::Incomplete => "INCOMPLETE",
            VirtioStatus::Ok => "OK",
            VirtioStatus::ErrIndirect => "ERR_INDIRECT",
            VirtioStatus::ErrNodmi => "ERR_NODMI",
            VirtioStatus::ErrChain => "ERR_CHAIN",
            VirtioStatus::ErrDesc => "ERR_DESC",
        };
        f.write_str(name)
    }
}

/// Vendor id reported by this crate's device models ("sdev").
pub const VENDOR: u32 = 0x7665_6473;

/// Device type IDs (virtio spec 5).
pub mod device_type {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const CONSOLE: u32 = 3;
    pub const RNG: u32 = 4;
    pub const GPU: u32 = 16;
    pub const INPUT: u32 = 18;
}

/// Device-independent feature bits (virtio spec 6).
pub mod feature {
    pub const RING_INDIRECT_DESC: u64 = 1 << 28;
    pub const RING_EVENT_IDX: u64 = 1 << 29;
    pub const VERSION_1: u64 = 1 << 32;
    pub const ACCESS_PLATFORM: u64 = 1 << 33;
    pub const RING_PACKED: u64 = 1 << 34;
    pub const IN_ORDER: u64 = 1 << 35;
    pub const ORDER_PLATFORM: u64 = 1 << 36;
    pub const SR_IOV: u64 = 1 << 37;
    pub const NOTIFICATION_DATA: u64 = 1 << 38;
}

/// Configuration of a single virtqueue.
///
/// `limit` is the maximum size the device supports; `size` stays 0 until
/// the driver programs the queue. The three addresses locate the
/// descriptor, driver, and device areas in guest-physical memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDesc {
    pub id: u32,
    pub limit: u32,
    pub size: u32,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    pub has_event_idx: bool,
}

/// Identity of a virtio device as reported to the transport.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    pub device_id: u32,
    pub vendor_id: u32,
    pub virtqueues: BTreeMap<u32, QueueDesc>,
}

impl DeviceDesc {
    /// Request a virtqueue with the given id and maximum size.
    pub fn request_virtqueue(&mut self, id: u32, max_size: u32) {
        self.virtqueues.insert(
            id,
            QueueDesc {
                id,
                limit: max_size,
                ..QueueDesc::default()
            },
        );
    }

    pub fn reset(&mut self) {
        self.device_id = 0;
        self.vendor_id = 0;
        self.virtqueues.clear();
    }
}

/// Forward half of the transport contract, implemented by device models.
///
/// Calls that need to reach back into the controller (queue draining from
/// `notify`) receive it as an explicit parameter instead of holding a
/// back-reference.
pub trait VirtioDevice {
    /// Report device id, vendor id, and the virtqueues the device needs.
    fn identify(&mut self, desc: &mut DeviceDesc);

    /// The driver made descriptors available on `vqid`.
    fn notify(&mut self, ctrl: &mut dyn VirtioController, vqid: u32) -> bool;

    /// Feature bits the device supports.
    fn read_features(&self) -> u64;

    /// Accept or reject the driver's negotiated feature set.
    fn write_features(&mut self, features: u64) -> bool;

    /// Read from device-specific configuration space.
    fn read_config(&mut self, addr: AddressRange, data: &mut [u8]) -> bool;

    /// Write to device-specific configuration space.
    fn write_config(&mut self, addr: AddressRange, data: &[u8]) -> bool;
}

/// Backward half of the transport contract, implemented by controllers.
pub trait VirtioController {
    /// Fetch the next available message from virtqueue `vqid`.
    fn get(&mut self, vqid: u32, msg: &mut Message) -> bool;

    /// Complete a message back to the driver on virtqueue `vqid`.
    fn put(&mut self, vqid: u32, msg: &mut Message) -> bool;

    /// Raise an interrupt toward the driver.
    fn notify(&mut self) -> bool;
}
