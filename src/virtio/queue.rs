//! Split and packed virtqueue engines.
//!
//! Both ring formats of the virtio spec 1.1 are implemented against guest
//! memory reached through the DMI callback. The three ring areas are
//! resolved once on `validate()` and the spans cached; `invalidate` drops
//! any span overlapping a remapped range so the next access re-resolves.
//!
//! Indirect descriptor tables are not dereferenced; a chain that requests
//! one completes with `ERR_INDIRECT` and the feature bit is never offered.

use std::sync::atomic::{fence, Ordering};

use log::{debug, warn};

use crate::memory::{AddressRange, Dmi, DmiAccess, DmiSpan};

use super::message::Message;
use super::{QueueDesc, VirtioStatus};

/// Descriptor flags, shared between ring formats.
pub mod desc_flags {
    /// Buffer continues via the next descriptor.
    pub const NEXT: u16 = 1;
    /// Buffer is device write-only (otherwise device read-only).
    pub const WRITE: u16 = 2;
    /// Buffer holds an indirect descriptor table.
    pub const INDIRECT: u16 = 4;
    /// Packed ring: descriptor is available (interpreted against wrap).
    pub const AVAIL: u16 = 1 << 7;
    /// Packed ring: descriptor is used (interpreted against wrap).
    pub const USED: u16 = 1 << 15;
}

/// Split ring available-ring flags.
pub mod avail_flags {
    pub const NO_INTERRUPT: u16 = 1;
}

/// Packed ring event-suppression modes.
pub mod event_flags {
    pub const ENABLE: u16 = 0;
    pub const DISABLE: u16 = 1;
    pub const DESC: u16 = 2;
}

/// Event-index notification predicate (virtio spec 2.6.7.1).
///
/// True when `new_idx` has moved past `event` since `old_idx`, with 16-bit
/// wraparound.
fn need_event(event: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

/// Classic three-area layout: descriptor table, available ring, used ring.
pub struct SplitQueue {
    id: u32,
    size: u32,
    addr_desc: u64,
    addr_driver: u64,
    addr_device: u64,
    has_event_idx: bool,

    /// Outcome of the notification decision of the last `do_put`.
    pub notify: bool,

    dmi: Dmi,
    last_avail_idx: u16,

    desc: Option<DmiSpan>,
    driver: Option<DmiSpan>,
    device: Option<DmiSpan>,
}

impl SplitQueue {
    pub fn new(desc: &QueueDesc, dmi: Dmi) -> Self {
        Self {
            id: desc.id,
            size: desc.size,
            addr_desc: desc.desc,
            addr_driver: desc.driver,
            addr_device: desc.device,
            has_event_idx: desc.has_event_idx,
            notify: false,
            dmi,
            last_avail_idx: 0,
            desc: None,
            driver: None,
            device: None,
        }
    }

    fn descsz(&self) -> u64 {
        16 * self.size as u64
    }

    fn drvsz(&self) -> u64 {
        let availsz = 4 + 2 * self.size as u64;
        if self.has_event_idx {
            availsz + 2
        } else {
            availsz
        }
    }

    fn devsz(&self) -> u64 {
        let usedsz = 4 + 8 * self.size as u64;
        if self.has_event_idx {
            usedsz + 2
        } else {
            usedsz
        }
    }

    /// Resolve and cache the three ring areas. Returns false (and serves no
    /// traffic) if any resolution fails.
    pub fn validate(&mut self) -> bool {
        if self.desc.is_none() {
            self.desc = self
                .dmi
                .resolve(self.addr_desc, self.descsz(), DmiAccess::Read);
        }
        if self.driver.is_none() {
            self.driver = self
                .dmi
                .resolve(self.addr_driver, self.drvsz(), DmiAccess::Read);
        }
        if self.device.is_none() {
            self.device = self
                .dmi
                .resolve(self.addr_device, self.devsz(), DmiAccess::Write);
        }

        let ok = self.desc.is_some() && self.driver.is_some() && self.device.is_some();
        if !ok {
            debug!("virtqueue {}: ring areas not DMI-accessible", self.id);
        }
        ok
    }

    /// Drop cached spans overlapping `range`; the next access re-resolves.
    pub fn invalidate(&mut self, range: AddressRange) {
        if range.overlaps(&AddressRange::with_length(self.addr_desc, self.descsz())) {
            self.desc = None;
        }
        if range.overlaps(&AddressRange::with_length(self.addr_driver, self.drvsz())) {
            self.driver = None;
        }
        if range.overlaps(&AddressRange::with_length(self.addr_device, self.devsz())) {
            self.device = None;
        }
    }

    fn do_get(&mut self, msg: &mut Message) -> VirtioStatus {
        if !self.validate() {
            return VirtioStatus::ErrNodmi;
        }
        let (desc, driver, device) = match (self.desc, self.driver, self.device) {
            (Some(d), Some(a), Some(u)) => (d, a, u),
            _ => return VirtioStatus::ErrNodmi,
        };

        let size = self.size as u16;
        let avail_idx = driver.read_u16(2);
        if avail_idx == self.last_avail_idx {
            return VirtioStatus::Incomplete;
        }

        fence(Ordering::Acquire);

        let head = driver.read_u16(4 + 2 * (self.last_avail_idx % size) as u64);

        let mut index = head;
        let mut count = 0u32;
        loop {
            if index >= size {
                return VirtioStatus::ErrDesc;
            }

            let off = 16 * index as u64;
            let addr = desc.read_u64(off);
            let len = desc.read_u32(off + 8);
            let flags = desc.read_u16(off + 12);
            let next = desc.read_u16(off + 14);

            if flags & desc_flags::INDIRECT != 0 {
                return VirtioStatus::ErrIndirect;
            }

            let is_write = flags & desc_flags::WRITE != 0;
            let access = if is_write {
                DmiAccess::Write
            } else {
                DmiAccess::Read
            };
            if self.dmi.resolve(addr, len as u64, access).is_none() {
                return VirtioStatus::ErrNodmi;
            }

            msg.append(addr, len, is_write);
            count += 1;

            if flags & desc_flags::NEXT == 0 {
                break;
            }
            if count >= self.size {
                return VirtioStatus::ErrChain;
            }
            index = next;
        }

        msg.index = head as u32;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        // tell the driver where the next notification is wanted
        if self.has_event_idx {
            device.write_u16(4 + 8 * self.size as u64, self.last_avail_idx);
        }

        VirtioStatus::Ok
    }

    fn do_put(&mut self, msg: &mut Message) -> VirtioStatus {
        if !self.validate() {
            return VirtioStatus::ErrNodmi;
        }
        let (driver, device) = match (self.driver, self.device) {
            (Some(a), Some(u)) => (a, u),
            _ => return VirtioStatus::ErrNodmi,
        };

        let size = self.size as u16;
        let used_idx = device.read_u16(2);
        let slot = (used_idx % size) as u64;

        device.write_u32(4 + 8 * slot, msg.index);
        device.write_u32(4 + 8 * slot + 4, msg.length_in);

        fence(Ordering::Release);

        let new_idx = used_idx.wrapping_add(1);
        device.write_u16(2, new_idx);

        self.notify = if self.has_event_idx {
            let used_event = driver.read_u16(4 + 2 * self.size as u64);
            need_event(used_event, new_idx, used_idx)
        } else {
            driver.read_u16(0) & avail_flags::NO_INTERRUPT == 0
        };

        VirtioStatus::Ok
    }
}

/// Single-ring layout with wrap counters and event-suppression structs.
pub struct PackedQueue {
    id: u32,
    size: u32,
    addr_desc: u64,
    addr_driver: u64,
    addr_device: u64,

    /// Outcome of the notification decision of the last `do_put`.
    pub notify: bool,

    dmi: Dmi,
    last_avail_idx: u16,
    last_used_idx: u16,
    wrap_get: bool,
    wrap_put: bool,

    desc: Option<DmiSpan>,
    driver: Option<DmiSpan>,
    device: Option<DmiSpan>,
}

impl PackedQueue {
    pub fn new(desc: &QueueDesc, dmi: Dmi) -> Self {
        Self {
            id: desc.id,
            size: desc.size,
            addr_desc: desc.desc,
            addr_driver: desc.driver,
            addr_device: desc.device,
            notify: false,
            dmi,
            last_avail_idx: 0,
            last_used_idx: 0,
            wrap_get: true,
            wrap_put: true,
            desc: None,
            driver: None,
            device: None,
        }
    }

    fn descsz(&self) -> u64 {
        16 * self.size as u64
    }

    /// Availability of a descriptor relative to the device's wrap counter:
    /// AVAIL must match the counter, USED must not.
    fn desc_avail(flags: u16, wrap: bool) -> bool {
        (flags & desc_flags::AVAIL != 0) == wrap && (flags & desc_flags::USED != 0) != wrap
    }

    pub fn validate(&mut self) -> bool {
        if self.desc.is_none() {
            // the device writes used elements back into the ring
            self.desc = self
                .dmi
                .resolve(self.addr_desc, self.descsz(), DmiAccess::Write);
        }
        if self.driver.is_none() {
            self.driver = self.dmi.resolve(self.addr_driver, 4, DmiAccess::Read);
        }
        if self.device.is_none() {
            self.device = self.dmi.resolve(self.addr_device, 4, DmiAccess::Write);
        }

        let ok = self.desc.is_some() && self.driver.is_some() && self.device.is_some();
        if !ok {
            debug!("virtqueue {}: ring areas not DMI-accessible", self.id);
        }
        ok
    }

    pub fn invalidate(&mut self, range: AddressRange) {
        if range.overlaps(&AddressRange::with_length(self.addr_desc, self.descsz())) {
            self.desc = None;
        }
        if range.overlaps(&AddressRange::with_length(self.addr_driver, 4)) {
            self.driver = None;
        }
        if range.overlaps(&AddressRange::with_length(self.addr_device, 4)) {
            self.device = None;
        }
    }

    fn do_get(&mut self, msg: &mut Message) -> VirtioStatus {
        if !self.validate() {
            return VirtioStatus::ErrNodmi;
        }
        let (desc, device) = match (self.desc, self.device) {
            (Some(d), Some(e)) => (d, e),
            _ => return VirtioStatus::ErrNodmi,
        };

        let size = self.size as u16;
        let head = self.last_avail_idx;

        let head_flags = desc.read_u16(16 * head as u64 + 14);
        if !Self::desc_avail(head_flags, self.wrap_get) {
            return VirtioStatus::Incomplete;
        }

        fence(Ordering::Acquire);

        let mut index = head;
        let mut wrap = self.wrap_get;
        let mut count = 0u32;
        loop {
            let off = 16 * index as u64;
            let addr = desc.read_u64(off);
            let len = desc.read_u32(off + 8);
            let flags = desc.read_u16(off + 14);

            if flags & desc_flags::INDIRECT != 0 {
                return VirtioStatus::ErrIndirect;
            }

            let is_write = flags & desc_flags::WRITE != 0;
            let access = if is_write {
                DmiAccess::Write
            } else {
                DmiAccess::Read
            };
            if self.dmi.resolve(addr, len as u64, access).is_none() {
                return VirtioStatus::ErrNodmi;
            }

            msg.append(addr, len, is_write);
            count += 1;

            // chained descriptors are sequential in the ring
            index += 1;
            if index == size {
                index = 0;
                wrap = !wrap;
            }

            if flags & desc_flags::NEXT == 0 {
                break;
            }
            if count >= self.size {
                return VirtioStatus::ErrChain;
            }
        }

        msg.index = head as u32;
        self.last_avail_idx = index;
        self.wrap_get = wrap;

        // packed analog of the split avail_event write-back
        device.write_u16(0, index | ((wrap as u16) << 15));

        VirtioStatus::Ok
    }

    fn do_put(&mut self, msg: &mut Message) -> VirtioStatus {
        if !self.validate() {
            return VirtioStatus::ErrNodmi;
        }
        let (desc, driver) = match (self.desc, self.driver) {
            (Some(d), Some(e)) => (d, e),
            _ => return VirtioStatus::ErrNodmi,
        };

        let size = self.size as u16;
        let slot = self.last_used_idx;
        let wrap = self.wrap_put;
        let off = 16 * slot as u64;

        // virtio 1.1: id and len become visible before the flags flip
        desc.write_u32(off + 8, msg.length_in);
        desc.write_u16(off + 12, msg.index as u16);

        fence(Ordering::Release);

        let flags = if wrap {
            desc_flags::AVAIL | desc_flags::USED
        } else {
            0
        };
        desc.write_u16(off + 14, flags);

        self.last_used_idx += 1;
        if self.last_used_idx == size {
            self.last_used_idx = 0;
            self.wrap_put = !self.wrap_put;
        }

        let ev_off_wrap = driver.read_u16(0);
        let ev_flags = driver.read_u16(2);
        self.notify = match ev_flags {
            event_flags::ENABLE => true,
            event_flags::DISABLE => false,
            event_flags::DESC => ev_off_wrap == slot | ((wrap as u16) << 15),
            other => {
                warn!("virtqueue {}: illegal event flags {:#06x}", self.id, other);
                true
            }
        };

        VirtioStatus::Ok
    }
}

/// A virtqueue in either ring format.
///
/// There are exactly two ring formats, so dispatch is a two-variant enum
/// rather than a trait object.
pub enum Virtqueue {
    Split(SplitQueue),
    Packed(PackedQueue),
}

impl Virtqueue {
    /// Build a queue from its descriptor in the negotiated ring format.
    pub fn new(desc: &QueueDesc, dmi: Dmi, packed: bool) -> Self {
        if packed {
            Virtqueue::Packed(PackedQueue::new(desc, dmi))
        } else {
            Virtqueue::Split(SplitQueue::new(desc, dmi))
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Virtqueue::Split(q) => q.id,
            Virtqueue::Packed(q) => q.id,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Virtqueue::Split(q) => q.size,
            Virtqueue::Packed(q) => q.size,
        }
    }

    /// Whether the last completed `put` asked for a driver notification.
    pub fn should_notify(&self) -> bool {
        match self {
            Virtqueue::Split(q) => q.notify,
            Virtqueue::Packed(q) => q.notify,
        }
    }

    pub fn validate(&mut self) -> bool {
        match self {
            Virtqueue::Split(q) => q.validate(),
            Virtqueue::Packed(q) => q.validate(),
        }
    }

    pub fn invalidate(&mut self, range: AddressRange) {
        match self {
            Virtqueue::Split(q) => q.invalidate(range),
            Virtqueue::Packed(q) => q.invalidate(range),
        }
    }

    fn dmi(&self) -> &Dmi {
        match self {
            Virtqueue::Split(q) => &q.dmi,
            Virtqueue::Packed(q) => &q.dmi,
        }
    }

    /// Fetch the next available message. Returns false without noise when
    /// the ring is empty; ring-walk failures are logged and reported on
    /// `msg.status`.
    pub fn get(&mut self, msg: &mut Message) -> bool {
        msg.reset();
        msg.set_dmi(self.dmi().clone());

        let status = match self {
            Virtqueue::Split(q) => q.do_get(msg),
            Virtqueue::Packed(q) => q.do_get(msg),
        };
        msg.status = status;

        match status {
            VirtioStatus::Ok => true,
            VirtioStatus::Incomplete => false,
            err => {
                warn!("virtqueue {}: get failed: {}", self.id(), err);
                false
            }
        }
    }

    /// Complete a message back to the driver.
    pub fn put(&mut self, msg: &mut Message) -> bool {
        let status = match self {
            Virtqueue::Split(q) => q.do_put(msg),
            Virtqueue::Packed(q) => q.do_put(msg),
        };
        msg.status = status;

        if status != VirtioStatus::Ok {
            warn!("virtqueue {}: put failed: {}", self.id(), status);
            return false;
        }
        true
    }
}
