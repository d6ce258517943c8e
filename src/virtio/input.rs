//! Virtio input device.
//!
//! Presents keyboard and touchpad events to the guest per the virtio spec
//! 5.8. UI callback threads push `InputEvent`s into a mutex-protected
//! queue; the simulator's periodic `update()` pairs one event with one
//! driver-supplied buffer and completes it over the transport. The lock is
//! scoped tightly and never held across a transport call.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::{debug, warn};

use crate::memory::AddressRange;

use super::{device_type, DeviceDesc, Message, VirtioController, VirtioDevice, VENDOR};

/// Event virtqueue: device to driver.
pub const VIRTQUEUE_EVENT: u32 = 0;
/// Status virtqueue: driver to device (LED state and the like).
pub const VIRTQUEUE_STATUS: u32 = 1;

const QUEUE_SIZE: u32 = 8;

/// evdev event types and codes used by the model.
pub mod ev {
    pub const EV_SYN: u16 = 0x00;
    pub const EV_KEY: u16 = 0x01;
    pub const EV_ABS: u16 = 0x03;

    pub const SYN_REPORT: u16 = 0;
    pub const ABS_X: u16 = 0x00;
    pub const ABS_Y: u16 = 0x01;
    pub const BTN_TOOL_FINGER: u16 = 0x145;
    pub const BTN_TOUCH: u16 = 0x14a;
    pub const BTN_TOOL_DOUBLETAP: u16 = 0x14d;
    pub const BTN_TOOL_TRIPLETAP: u16 = 0x14e;
}

/// Config selectors (virtio spec 5.8.4).
mod cfg {
    pub const UNSET: u8 = 0x00;
    pub const ID_NAME: u8 = 0x01;
    pub const ID_SERIAL: u8 = 0x02;
    pub const ID_DEVIDS: u8 = 0x03;
    pub const PROP_BITS: u8 = 0x10;
    pub const EV_BITS: u8 = 0x11;
    pub const ABS_INFO: u8 = 0x12;
}

/// Config space geometry: select, subsel, size, 5 reserved bytes, then a
/// 128-byte payload union.
const CONFIG_PAYLOAD: u64 = 8;
const CONFIG_SIZE: u64 = CONFIG_PAYLOAD + 128;

/// One evdev event as it travels over the event virtqueue.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEvent {
    pub fn new(event_type: u16, code: u16, value: u32) -> Self {
        Self {
            event_type,
            code,
            value,
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.event_type.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.code.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            event_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            code: u16::from_le_bytes([bytes[2], bytes[3]]),
            value: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

pub struct VirtioInput {
    keyboard: bool,
    touchpad: bool,
    res_x: u32,
    res_y: u32,

    select: u8,
    subsel: u8,
    config_size: u8,
    payload: [u8; 128],

    /// Fed by UI callback threads, drained by `update`.
    events: Mutex<VecDeque<InputEvent>>,
    /// Driver buffers fetched from the event queue, waiting for events.
    messages: VecDeque<Message>,

    prev_key: u16,
    prev_buttons: u32,
    prev_x: u32,
    prev_y: u32,
}

impl VirtioInput {
    pub fn new(keyboard: bool, touchpad: bool, res_x: u32, res_y: u32) -> Self {
        Self {
            keyboard,
            touchpad,
            res_x,
            res_y,
            select: 0,
            subsel: 0,
            config_size: 0,
            payload: [0; 128],
            events: Mutex::new(VecDeque::new()),
            messages: VecDeque::new(),
            prev_key: 0,
            prev_buttons: 0,
            prev_x: 0,
            prev_y: 0,
        }
    }

    fn reset(&mut self) {
        self.select = 0;
        self.subsel = 0;
        self.config_size = 0;
        self.payload = [0; 128];
        self.prev_key = 0;
        self.prev_buttons = 0;
        self.prev_x = 0;
        self.prev_y = 0;
        self.messages.clear();
        self.events.lock().unwrap().clear();
    }

    /// Queue a key press or release. `code` is the evdev key code; a press
    /// of the key already held reports a repeat.
    pub fn key_event(&mut self, code: u16, down: bool) {
        let value = if down {
            let v = if code == self.prev_key { 2 } else { 1 };
            self.prev_key = code;
            v
        } else {
            0
        };

        let mut events = self.events.lock().unwrap();
        events.push_back(InputEvent::new(ev::EV_KEY, code, value));
        events.push_back(InputEvent::new(ev::EV_SYN, ev::SYN_REPORT, 0));
    }

    /// Queue pointer state. Only changes relative to the previous call
    /// produce events; any burst is terminated with a SYN_REPORT.
    pub fn ptr_event(&mut self, buttons: u32, x: u32, y: u32) {
        let buttons = buttons & 0b111; // lclick, mclick, rclick
        let change = buttons ^ self.prev_buttons;

        let mut events = self.events.lock().unwrap();
        let before = events.len();

        if change != 0 {
            events.push_back(InputEvent::new(
                ev::EV_KEY,
                ev::BTN_TOUCH,
                (self.prev_buttons == 0) as u32,
            ));
        }
        if change & 1 != 0 {
            events.push_back(InputEvent::new(ev::EV_KEY, ev::BTN_TOOL_FINGER, buttons & 1));
        }
        if change & 2 != 0 {
            events.push_back(InputEvent::new(
                ev::EV_KEY,
                ev::BTN_TOOL_TRIPLETAP,
                (buttons >> 1) & 1,
            ));
        }
        if change & 4 != 0 {
            events.push_back(InputEvent::new(
                ev::EV_KEY,
                ev::BTN_TOOL_DOUBLETAP,
                (buttons >> 2) & 1,
            ));
        }

        if self.prev_x != x {
            events.push_back(InputEvent::new(ev::EV_ABS, ev::ABS_X, x));
        }
        if self.prev_y != y {
            events.push_back(InputEvent::new(ev::EV_ABS, ev::ABS_Y, y));
        }

        if events.len() != before {
            events.push_back(InputEvent::new(ev::EV_SYN, ev::SYN_REPORT, 0));
        }
        drop(events);

        self.prev_buttons = buttons;
        self.prev_x = x;
        self.prev_y = y;
    }

    /// Number of events waiting for delivery.
    pub fn pending_events(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Deliver at most one queued event into one buffered driver message.
    /// Called periodically by the simulator; returns true if an event went
    /// out.
    pub fn update(&mut self, ctrl: &mut dyn VirtioController) -> bool {
        let event = { self.events.lock().unwrap().front().copied() };
        let Some(event) = event else { return false };
        let Some(msg) = self.messages.front_mut() else {
            return false;
        };

        msg.copy_out(0, &event.to_bytes());

        if event.event_type == ev::EV_SYN && event.code == ev::SYN_REPORT {
            debug!("event sync");
        } else {
            debug!(
                "event type {}, code {}, value {}",
                event.event_type, event.code, event.value
            );
        }

        if !ctrl.put(VIRTQUEUE_EVENT, msg) {
            return false;
        }

        self.messages.pop_front();
        self.events.lock().unwrap().pop_front();
        true
    }

    fn config_update_name(&mut self) {
        if self.subsel != 0 {
            return;
        }
        let name = b"virtio input device";
        self.payload[..name.len()].copy_from_slice(name);
        self.config_size = name.len() as u8;
    }

    fn config_update_serial(&mut self) {
        if self.subsel != 0 {
            return;
        }
        let serial = b"1234567890";
        self.payload[..serial.len()].copy_from_slice(serial);
        self.config_size = serial.len() as u8;
    }

    fn config_update_devids(&mut self) {
        if self.subsel != 0 {
            return;
        }
        for (i, id) in [1u16, 2, 3, 4].into_iter().enumerate() {
            self.payload[2 * i..2 * i + 2].copy_from_slice(&id.to_le_bytes());
        }
        self.config_size = 8;
    }

    fn config_update_props(&mut self) {
        if self.subsel != 0 {
            return;
        }
        self.config_size = 128;
    }

    fn set_ev_bit(&mut self, code: u16) {
        self.payload[code as usize / 8] |= 1 << (code % 8);
    }

    fn config_update_evbits(&mut self) {
        let mut any = false;
        match self.subsel as u16 {
            ev::EV_SYN => {
                self.set_ev_bit(ev::SYN_REPORT);
                any = true;
            }
            ev::EV_KEY => {
                if self.keyboard {
                    // full range of ordinary key codes; symbol translation
                    // is the UI frontend's business
                    for code in 1..=255u16 {
                        self.set_ev_bit(code);
                    }
                    any = true;
                }
                if self.touchpad {
                    self.set_ev_bit(ev::BTN_TOUCH);
                    self.set_ev_bit(ev::BTN_TOOL_FINGER);
                    self.set_ev_bit(ev::BTN_TOOL_DOUBLETAP);
                    self.set_ev_bit(ev::BTN_TOOL_TRIPLETAP);
                    any = true;
                }
            }
            ev::EV_ABS => {
                if self.touchpad {
                    self.set_ev_bit(ev::ABS_X);
                    self.set_ev_bit(ev::ABS_Y);
                    any = true;
                }
            }
            _ => (), // other event types are not reported
        }

        if any {
            self.config_size = 128;
        }
    }

    fn config_update_absinfo(&mut self) {
        if !self.touchpad {
            return;
        }

        let max = match self.subsel as u16 {
            ev::ABS_X => self.res_x.saturating_sub(1),
            ev::ABS_Y => self.res_y.saturating_sub(1),
            _ => return,
        };

        // struct virtio_input_absinfo: min, max, fuzz, flat, res
        for (i, val) in [0u32, max, 0, 0, 0].into_iter().enumerate() {
            self.payload[4 * i..4 * i + 4].copy_from_slice(&val.to_le_bytes());
        }
        self.config_size = 20;
    }

    fn config_update(&mut self) {
        self.config_size = 0;
        self.payload = [0; 128];

        match self.select {
            cfg::UNSET => (),
            cfg::ID_NAME => self.config_update_name(),
            cfg::ID_SERIAL => self.config_update_serial(),
            cfg::ID_DEVIDS => self.config_update_devids(),
            cfg::PROP_BITS => self.config_update_props(),
            cfg::EV_BITS => self.config_update_evbits(),
            cfg::ABS_INFO => self.config_update_absinfo(),
            other => warn!("illegal config selection: {}", other),
        }
    }

    fn config_byte(&self, offset: u64) -> u8 {
        match offset {
            0 => self.select,
            1 => self.subsel,
            2 => self.config_size,
            3..=7 => 0,
            _ => self.payload[(offset - CONFIG_PAYLOAD) as usize],
        }
    }
}

impl VirtioDevice for VirtioInput {
    fn identify(&mut self, desc: &mut DeviceDesc) {
        self.reset();
        desc.device_id = device_type::INPUT;
        desc.vendor_id = VENDOR;
        desc.request_virtqueue(VIRTQUEUE_EVENT, QUEUE_SIZE);
        desc.request_virtqueue(VIRTQUEUE_STATUS, QUEUE_SIZE);
    }

    fn notify(&mut self, ctrl: &mut dyn VirtioController, vqid: u32) -> bool {
        match vqid {
            VIRTQUEUE_EVENT => {
                // buffer the driver's event slots for update() to fill
                loop {
                    let mut msg = Message::new();
                    if !ctrl.get(vqid, &mut msg) {
                        break;
                    }
                    self.messages.push_back(msg);
                }
                true
            }
            VIRTQUEUE_STATUS => {
                let mut msg = Message::new();
                while ctrl.get(vqid, &mut msg) {
                    let mut bytes = [0u8; 8];
                    if msg.copy_in(0, &mut bytes) == bytes.len() {
                        let status = InputEvent::from_bytes(bytes);
                        debug!(
                            "status event type {}, code {}, value {}",
                            status.event_type, status.code, status.value
                        );
                    }
                    if !ctrl.put(vqid, &mut msg) {
                        return false;
                    }
                }
                true
            }
            other => {
                warn!("notify for unknown virtqueue {}", other);
                false
            }
        }
    }

    fn read_features(&self) -> u64 {
        0
    }

    fn write_features(&mut self, _features: u64) -> bool {
        true
    }

    fn read_config(&mut self, addr: AddressRange, data: &mut [u8]) -> bool {
        if addr.end >= CONFIG_SIZE {
            return false;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = self.config_byte(addr.start + i as u64);
        }
        true
    }

    fn write_config(&mut self, addr: AddressRange, data: &[u8]) -> bool {
        // only select and subsel are driver-writable
        if addr.end >= 2 {
            return false;
        }
        for (i, &byte) in data.iter().enumerate() {
            match addr.start + i as u64 {
                0 => self.select = byte,
                _ => self.subsel = byte,
            }
        }
        self.config_update();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil::arena_dmi;
    use crate::virtio::queue::desc_flags;
    use crate::virtio::transport::Transport;
    use crate::virtio::QueueDesc;

    const BASE: u64 = 0x8000;
    const DESC: u64 = BASE + 0x100;
    const DRIVER: u64 = BASE + 0x400;
    const DEVICE: u64 = BASE + 0x600;
    const BUFS: u64 = BASE + 0x1000;

    fn w16(mem: &mut [u8], addr: u64, val: u16) {
        let o = (addr - BASE) as usize;
        mem[o..o + 2].copy_from_slice(&val.to_le_bytes());
    }

    fn write_desc(mem: &mut [u8], i: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let o = (DESC - BASE) as usize + 16 * i as usize;
        mem[o..o + 8].copy_from_slice(&addr.to_le_bytes());
        mem[o + 8..o + 12].copy_from_slice(&len.to_le_bytes());
        mem[o + 12..o + 14].copy_from_slice(&flags.to_le_bytes());
        mem[o + 14..o + 16].copy_from_slice(&next.to_le_bytes());
    }

    fn config_select(input: &mut VirtioInput, select: u8, subsel: u8) {
        assert!(input.write_config(AddressRange::with_length(0, 2), &[select, subsel]));
    }

    fn read_payload(input: &mut VirtioInput, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        assert!(input.read_config(
            AddressRange::with_length(CONFIG_PAYLOAD, len as u64),
            &mut data
        ));
        data
    }

    #[test]
    fn test_identify() {
        let mut input = VirtioInput::new(true, true, 1280, 720);
        let mut desc = DeviceDesc::default();
        input.identify(&mut desc);
        assert_eq!(desc.device_id, device_type::INPUT);
        assert_eq!(desc.virtqueues.len(), 2);
        assert_eq!(desc.virtqueues[&VIRTQUEUE_EVENT].limit, 8);
    }

    #[test]
    fn test_config_name_and_size() {
        let mut input = VirtioInput::new(true, false, 0, 0);
        config_select(&mut input, cfg::ID_NAME, 0);

        let mut hdr = [0u8; 3];
        assert!(input.read_config(AddressRange::with_length(0, 3), &mut hdr));
        assert_eq!(hdr[0], cfg::ID_NAME);
        assert_eq!(hdr[2] as usize, b"virtio input device".len());

        let name = read_payload(&mut input, b"virtio input device".len());
        assert_eq!(&name, b"virtio input device");
    }

    #[test]
    fn test_config_ev_bits() {
        let mut input = VirtioInput::new(true, true, 1280, 720);

        config_select(&mut input, cfg::EV_BITS, ev::EV_KEY as u8);
        let bitmap = read_payload(&mut input, 128);
        let bit = |code: u16| bitmap[code as usize / 8] & (1 << (code % 8)) != 0;
        assert!(bit(30)); // KEY_A
        assert!(bit(ev::BTN_TOUCH));

        // a pointer-only device reports no EV_KEY keyboard range
        let mut ptr_only = VirtioInput::new(false, true, 1280, 720);
        config_select(&mut ptr_only, cfg::EV_BITS, ev::EV_KEY as u8);
        let bitmap = read_payload(&mut ptr_only, 128);
        assert_eq!(bitmap[30 / 8] & (1 << (30 % 8)), 0);
        assert!(bitmap[ev::BTN_TOUCH as usize / 8] & (1 << (ev::BTN_TOUCH % 8)) != 0);
    }

    #[test]
    fn test_config_absinfo() {
        let mut input = VirtioInput::new(false, true, 1280, 720);
        config_select(&mut input, cfg::ABS_INFO, ev::ABS_X as u8);
        let abs = read_payload(&mut input, 20);
        let max = u32::from_le_bytes(abs[4..8].try_into().unwrap());
        assert_eq!(max, 1279);
    }

    #[test]
    fn test_config_out_of_range() {
        let mut input = VirtioInput::new(true, false, 0, 0);
        let mut data = [0u8; 4];
        assert!(!input.read_config(AddressRange::with_length(CONFIG_SIZE - 2, 4), &mut data));
        // payload is read-only
        assert!(!input.write_config(AddressRange::with_length(2, 1), &[0]));
    }

    #[test]
    fn test_key_repeat_values() {
        let mut input = VirtioInput::new(true, false, 0, 0);
        input.key_event(30, true);
        input.key_event(30, true);
        input.key_event(30, false);

        let events = input.events.lock().unwrap();
        let values: Vec<u32> = events
            .iter()
            .filter(|e| e.event_type == ev::EV_KEY)
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec![1, 2, 0]);
    }

    #[test]
    fn test_ptr_event_differential() {
        let mut input = VirtioInput::new(false, true, 1280, 720);
        input.ptr_event(1, 10, 20);
        assert!(input.pending_events() > 0);
        let first = input.pending_events();

        // identical state adds nothing
        input.ptr_event(1, 10, 20);
        assert_eq!(input.pending_events(), first);

        // a move only produces ABS updates plus the sync
        input.ptr_event(1, 11, 20);
        assert_eq!(input.pending_events(), first + 2);
    }

    #[test]
    fn test_event_delivery_over_transport() {
        let mut mem = vec![0u8; 0x2000];
        // one device-writable 8-byte event slot on the event queue
        write_desc(&mut mem, 0, BUFS, 8, desc_flags::WRITE, 0);
        w16(&mut mem, DRIVER + 4, 0);
        w16(&mut mem, DRIVER + 2, 1);

        let dmi = arena_dmi(mem.as_mut_ptr(), BASE, 0x2000);
        let mut input = VirtioInput::new(true, false, 0, 0);
        let mut transport = Transport::new(dmi);
        transport.setup(&mut input);
        transport
            .queue_setup(QueueDesc {
                id: VIRTQUEUE_EVENT,
                limit: 0,
                size: 8,
                desc: DESC,
                driver: DRIVER,
                device: DEVICE,
                has_event_idx: false,
            })
            .unwrap();

        // driver kick buffers the slot; no event yet, update is a no-op
        assert!(transport.notify_device(&mut input, VIRTQUEUE_EVENT));
        assert!(!input.update(&mut transport));

        input.key_event(30, true);
        assert!(input.update(&mut transport));

        // the key event landed in the guest buffer and was completed
        let o = (BUFS - BASE) as usize;
        let delivered = InputEvent::from_bytes(mem[o..o + 8].try_into().unwrap());
        assert_eq!(delivered, InputEvent::new(ev::EV_KEY, 30, 1));
        let used_idx = u16::from_le_bytes([
            mem[(DEVICE - BASE) as usize + 2],
            mem[(DEVICE - BASE) as usize + 3],
        ]);
        assert_eq!(used_idx, 1);
        assert!(transport.irq_pending());

        // the SYN_REPORT is still queued, waiting for the next slot
        assert_eq!(input.pending_events(), 1);
        assert!(!input.update(&mut transport));
    }
}
