//! # simdev
//!
//! Device models for discrete-event virtual-platform simulation.
//!
//! The crate provides the two subsystems a para-virtualized guest leans on
//! hardest: a VirtIO transport and virtqueue engine that walks split and
//! packed rings over guest-physical memory, and an ARM GIC-400 interrupt
//! controller model with distributor, CPU interfaces, and the
//! virtualization interface used by hypervisors to inject virtual
//! interrupts.
//!
//! Guest memory is never owned by a model. Every access goes through a
//! direct-memory-interface (DMI) callback supplied by the embedding
//! simulator, which resolves a guest-physical range to host memory and may
//! refuse (see [`memory::Dmi`]). Models are single-threaded by design; the
//! one exception is the input device's event queue, which may be fed from
//! UI threads.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use simdev::gic::Gic400;
//!
//! // A 2-CPU GIC with 64 shared peripheral interrupts.
//! let mut gic = Gic400::new(2, 64);
//! gic.handle_spi(10, true);
//! let asserted = gic.irq_out(0);
//! # let _ = asserted;
//! ```

pub mod error;
pub mod gic;
pub mod memory;
pub mod throttle;
pub mod virtio;

// Re-exports
pub use error::{Error, Result};
pub use gic::Gic400;
pub use memory::{AddressRange, Dmi, DmiAccess, DmiSpan};
pub use throttle::Throttle;
pub use virtio::{
    DeviceDesc, Message, QueueDesc, Transport, VirtioController, VirtioDevice, VirtioStatus,
    Virtqueue,
};
