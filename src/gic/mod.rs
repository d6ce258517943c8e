//! ARM GIC-400 interrupt controller model.
//!
//! The controller is a single aggregate owning four register blocks: the
//! distributor, the CPU interface, the virtualization interface control
//! block, and the virtual CPU interface. Register handlers live on the
//! aggregate and take the accessing CPU explicitly; banked registers are
//! plain per-CPU arrays.
//!
//! Interrupt state is tracked per line as independent enabled, pending,
//! active, and level CPU bitmasks. `update()` recomputes each CPU's
//! highest-priority pending interrupt after every state-changing write and
//! drives the IRQ output lines; the virtualization path mirrors this over
//! the list-register table.

pub mod cpu_interface;
pub mod distributor;
pub mod virt_interface;

pub use cpu_interface::CpuInterface;
pub use distributor::Distributor;
pub use virt_interface::{ListEntry, VCpuInterface, VifCtrl};

use log::{debug, error, warn};

/// Number of software-generated interrupts (ids 0..16).
pub const NSGI: usize = 16;
/// Number of private peripheral interrupts (ids 16..32).
pub const NPPI: usize = 16;
/// Number of private interrupts; first shared peripheral interrupt id.
pub const NPRIV: usize = NSGI + NPPI;
/// Total number of interrupt ids.
pub const NIRQ: usize = 1020;
/// Number of shared peripheral interrupts.
pub const NSPI: usize = NIRQ - NPRIV;
/// Number of CPU interfaces.
pub const NCPU: usize = 8;
/// Number of virtual CPU interfaces.
pub const NVCPU: usize = 8;
/// List registers per virtual CPU interface.
pub const NLR: usize = 4;

/// Interrupt id reported when nothing is deliverable.
pub const SPURIOUS_IRQ: u16 = 1023;
/// Priority value above every valid priority.
pub const IDLE_PRIO: u16 = 0x100;
/// CPU mask addressing every CPU interface.
pub const ALL_CPU: u8 = 0xff;
/// Lowest binary point implemented by the virtual CPU interface.
pub const VIRT_MIN_BPR: u32 = 2;

pub(crate) const AMBA_PCID: u32 = 0xb105_f00d;
pub(crate) const AMBA_IFID: u32 = 0x0202_043b;

/// Index of the highest set bit; callers guarantee `value != 0`.
pub(crate) fn fls(value: u32) -> u32 {
    31 - value.leading_zeros()
}

/// Byte of the AMBA component id register file at word `idx`.
pub(crate) fn cidr_byte(idx: u64) -> u32 {
    (AMBA_PCID >> (idx * 8)) & 0xff
}

/// Interrupt handling model: per-CPU pending state (N-N) or a single
/// pending state consumed by the first acknowledging CPU (N-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqModel {
    #[default]
    NtoN,
    Nto1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Edge,
    Level,
}

/// Per-line interrupt bookkeeping; each mask is indexed by CPU.
#[derive(Debug, Clone, Copy, Default)]
struct IrqState {
    enabled: u8,
    pending: u8,
    active: u8,
    level: u8,
    signaled: u8,
    model: IrqModel,
    trigger: Trigger,
}

/// The GIC-400 aggregate.
pub struct Gic400 {
    pub distif: Distributor,
    pub cpuif: CpuInterface,
    pub vifctrl: VifCtrl,
    pub vcpuif: VCpuInterface,

    irq_state: Vec<IrqState>,
    cpu_num: usize,
    irq_num: usize,

    irq_out: [bool; NCPU],
    virq_out: [bool; NVCPU],
}

impl Gic400 {
    /// Build a controller serving `cpus` CPU interfaces and `spis` shared
    /// peripheral interrupt lines.
    pub fn new(cpus: usize, spis: usize) -> Self {
        let cpu_num = if cpus == 0 || cpus > NCPU {
            warn!("unsupported cpu count {}, clamping", cpus);
            cpus.clamp(1, NCPU)
        } else {
            cpus
        };
        let irq_num = if NPRIV + spis > NIRQ {
            warn!("too many interrupts ({}), clamping", NPRIV + spis);
            NIRQ
        } else {
            NPRIV + spis
        };

        let mut gic = Self {
            distif: Distributor::new(),
            cpuif: CpuInterface::new(),
            vifctrl: VifCtrl::new(),
            vcpuif: VCpuInterface::new(),
            irq_state: vec![IrqState::default(); NIRQ],
            cpu_num,
            irq_num,
            irq_out: [false; NCPU],
            virq_out: [false; NVCPU],
        };

        // SGIs are always enabled and cannot be disabled
        for irq in 0..NSGI {
            gic.enable_irq(irq, ALL_CPU);
        }

        gic
    }

    pub fn cpu_num(&self) -> usize {
        self.cpu_num
    }

    pub fn irq_num(&self) -> usize {
        self.irq_num
    }

    /// State of the IRQ output line toward `cpu`.
    pub fn irq_out(&self, cpu: usize) -> bool {
        self.irq_out.get(cpu).copied().unwrap_or(false)
    }

    /// State of the virtual IRQ output line toward `cpu`.
    pub fn virq_out(&self, cpu: usize) -> bool {
        self.virq_out.get(cpu).copied().unwrap_or(false)
    }

    /// Substitute CPU 0 for out-of-range accessors, as the hardware
    /// tolerates stray accesses better than the simulator tolerates a
    /// panic.
    pub(crate) fn valid_cpu(&self, cpu: usize) -> usize {
        if cpu >= self.cpu_num {
            warn!("invalid cpu {}, assuming 0", cpu);
            0
        } else {
            cpu
        }
    }

    pub fn enable_irq(&mut self, irq: usize, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            state.enabled |= mask;
        }
    }

    pub fn disable_irq(&mut self, irq: usize, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            state.enabled &= !mask;
        }
    }

    pub fn is_irq_enabled(&self, irq: usize, mask: u8) -> bool {
        self.irq_state
            .get(irq)
            .is_some_and(|s| s.enabled & mask != 0)
    }

    pub fn set_irq_pending(&mut self, irq: usize, pending: bool, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            if pending {
                state.pending |= mask;
            } else {
                state.pending &= !mask;
            }
        }
    }

    /// A line counts as pending when its pending bit is set or when it is
    /// level-triggered with the input still asserted.
    pub fn is_irq_pending(&self, irq: usize, mask: u8) -> bool {
        self.irq_state.get(irq).is_some_and(|s| {
            s.pending & mask != 0 || (s.trigger == Trigger::Level && s.level & mask != 0)
        })
    }

    pub fn set_irq_active(&mut self, irq: usize, active: bool, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            if active {
                state.active |= mask;
            } else {
                state.active &= !mask;
            }
        }
    }

    pub fn is_irq_active(&self, irq: usize, mask: u8) -> bool {
        self.irq_state
            .get(irq)
            .is_some_and(|s| s.active & mask != 0)
    }

    pub fn set_irq_level(&mut self, irq: usize, level: bool, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            if level {
                state.level |= mask;
            } else {
                state.level &= !mask;
            }
        }
    }

    pub fn get_irq_level(&self, irq: usize, mask: u8) -> bool {
        self.irq_state.get(irq).is_some_and(|s| s.level & mask != 0)
    }

    pub fn set_irq_signaled(&mut self, irq: usize, signaled: bool, mask: u8) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            if signaled {
                state.signaled |= mask;
            } else {
                state.signaled &= !mask;
            }
        }
    }

    pub fn is_irq_signaled(&self, irq: usize, mask: u8) -> bool {
        self.irq_state
            .get(irq)
            .is_some_and(|s| s.signaled & mask != 0)
    }

    pub fn set_irq_trigger(&mut self, irq: usize, trigger: Trigger) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            state.trigger = trigger;
        }
    }

    pub fn get_irq_trigger(&self, irq: usize) -> Trigger {
        self.irq_state
            .get(irq)
            .map(|s| s.trigger)
            .unwrap_or_default()
    }

    pub fn set_irq_model(&mut self, irq: usize, model: IrqModel) {
        if let Some(state) = self.irq_state.get_mut(irq) {
            state.model = model;
        }
    }

    pub fn get_irq_model(&self, irq: usize) -> IrqModel {
        self.irq_state
            .get(irq)
            .map(|s| s.model)
            .unwrap_or_default()
    }

    /// Effective priority of `irq` as seen by `cpu`; lower wins.
    pub fn get_irq_priority(&self, cpu: usize, irq: usize) -> u8 {
        if irq < NSGI {
            self.distif.ipriority_sgi[cpu][irq]
        } else if irq < NPRIV {
            self.distif.ipriority_ppi[cpu][irq - NSGI]
        } else if irq < NIRQ {
            self.distif.ipriority_spi[irq - NPRIV]
        } else {
            error!("tried to get priority of invalid irq {}", irq);
            0
        }
    }

    /// A private peripheral interrupt line of `cpu` changed.
    pub fn handle_ppi(&mut self, cpu: usize, idx: usize, state: bool) {
        let cpu = self.valid_cpu(cpu);
        let irq = NSGI + idx;
        let mask = 1 << cpu;

        self.set_irq_level(irq, state, mask);
        self.set_irq_signaled(irq, false, ALL_CPU);
        if self.get_irq_trigger(irq) == Trigger::Edge && state {
            self.set_irq_pending(irq, true, mask);
        }

        self.update();
    }

    /// A shared peripheral interrupt line changed.
    pub fn handle_spi(&mut self, idx: usize, state: bool) {
        let irq = NPRIV + idx;
        if irq >= self.irq_num {
            warn!("spi {} beyond configured interrupt count", idx);
            return;
        }
        let targets = self.distif.itargets_spi[idx];

        self.set_irq_level(irq, state, ALL_CPU);
        self.set_irq_signaled(irq, false, ALL_CPU);
        if self.get_irq_trigger(irq) == Trigger::Edge && state {
            self.set_irq_pending(irq, true, targets);
        }

        self.update();
    }

    /// Recompute every CPU's highest-priority pending interrupt and drive
    /// the physical IRQ output lines.
    pub fn update(&mut self) {
        self.run_update(false);
    }

    /// Same arbitration over the list registers, driving the virtual IRQ
    /// output lines.
    pub fn update_virt(&mut self) {
        self.run_update(true);
    }

    fn run_update(&mut self, virt: bool) {
        for cpu in 0..self.cpu_num {
            let mask = 1u8 << cpu;
            let mut best_irq = SPURIOUS_IRQ;
            let mut best_prio = IDLE_PRIO;

            if !virt {
                self.cpuif.hppir[cpu] = SPURIOUS_IRQ;

                if self.distif.ctlr == 0 || self.cpuif.ctlr[cpu] == 0 {
                    if self.irq_out[cpu] {
                        debug!("disabling cpu{} irq", cpu);
                    }
                    self.irq_out[cpu] = false;
                    continue;
                }

                for irq in 0..NSGI {
                    if self.is_irq_enabled(irq, mask)
                        && self.is_irq_pending(irq, mask)
                        && !self.is_irq_active(irq, mask)
                    {
                        let prio = self.distif.ipriority_sgi[cpu][irq] as u16;
                        if prio < best_prio {
                            best_prio = prio;
                            best_irq = irq as u16;
                        }
                    }
                }

                for irq in NSGI..NPRIV {
                    if self.is_irq_enabled(irq, mask)
                        && self.is_irq_pending(irq, mask)
                        && !self.is_irq_active(irq, mask)
                    {
                        let prio = self.distif.ipriority_ppi[cpu][irq - NSGI] as u16;
                        if prio < best_prio {
                            best_prio = prio;
                            best_irq = irq as u16;
                        }
                    }
                }

                for irq in NPRIV..self.irq_num {
                    let idx = irq - NPRIV;
                    if self.is_irq_enabled(irq, mask)
                        && self.is_irq_pending(irq, mask)
                        && self.distif.itargets_spi[idx] & mask != 0
                        && !self.is_irq_active(irq, mask)
                    {
                        let prio = self.distif.ipriority_spi[idx] as u16;
                        if prio < best_prio {
                            best_prio = prio;
                            best_irq = irq as u16;
                        }
                    }
                }
            } else {
                self.vcpuif.hppir[cpu] = SPURIOUS_IRQ;

                if self.vifctrl.hcr[cpu] == 0 {
                    if self.virq_out[cpu] {
                        debug!("disabling cpu{} virq", cpu);
                    }
                    self.virq_out[cpu] = false;
                    continue;
                }

                for entry in &self.vifctrl.lr_state[cpu] {
                    if entry.pending && (entry.prio as u16) < best_prio {
                        best_prio = entry.prio as u16;
                        best_irq = entry.virtual_id;
                    }
                }
            }

            // signal the interrupt if it clears both mask and running
            // priority
            let mut line = false;
            if !virt {
                if best_prio < self.cpuif.pmr[cpu] as u16 {
                    self.cpuif.hppir[cpu] = best_irq;
                    if best_prio < self.cpuif.rpr[cpu] {
                        line = true;
                    }
                }
                if self.irq_out[cpu] != line {
                    debug!(
                        "{} cpu{} irq for irq {}",
                        if line { "setting" } else { "clearing" },
                        cpu,
                        best_irq
                    );
                }
                self.irq_out[cpu] = line;
            } else {
                if best_prio < self.vcpuif.pmr[cpu] as u16 {
                    self.vcpuif.hppir[cpu] = best_irq;
                    if best_prio < self.vcpuif.rpr[cpu] {
                        line = true;
                    }
                }
                if self.virq_out[cpu] != line {
                    debug!(
                        "{} cpu{} virq for irq {}",
                        if line { "setting" } else { "clearing" },
                        cpu,
                        best_irq
                    );
                }
                self.virq_out[cpu] = line;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Distributor and CPU interface enabled, priority mask wide open.
    fn ready_gic(cpus: usize) -> Gic400 {
        let mut gic = Gic400::new(cpus, 64);
        gic.distif_write(0, 0x000, 1);
        for cpu in 0..cpus {
            gic.cpuif_write(cpu, 0x00, 1);
            gic.cpuif_write(cpu, 0x04, 0xff);
        }
        gic
    }

    #[test]
    fn test_sgis_enabled_after_reset() {
        let gic = Gic400::new(2, 64);
        for irq in 0..NSGI {
            assert!(gic.is_irq_enabled(irq, ALL_CPU));
        }
        assert!(!gic.is_irq_enabled(NSGI, ALL_CPU));
    }

    #[test]
    fn test_sgi_generation_and_ack() {
        let mut gic = ready_gic(2);

        // CPU 0 raises SGI 3 toward CPU 1 via the target list
        gic.distif_write(0, 0xf00, (0x02 << 16) | 3);

        assert_eq!(gic.distif.spendsgir[1][3], 0x01);
        assert!(gic.is_irq_pending(3, 0x02));
        assert!(gic.irq_out(1));
        assert!(!gic.irq_out(0));

        // CPU 1 acknowledges: id 3, source CPU 0 in bits 10..13
        let iar = gic.cpuif_read(1, 0x0c);
        assert_eq!(iar, 3);
        assert!(gic.is_irq_active(3, 0x02));
        assert!(!gic.is_irq_pending(3, 0x02));
        assert!(!gic.irq_out(1));

        // completion returns the line to idle
        gic.cpuif_write(1, 0x10, 3);
        assert!(!gic.is_irq_active(3, 0x02));
        assert_eq!(gic.cpuif.rpr[1], IDLE_PRIO);
    }

    #[test]
    fn test_sgi_source_field_and_multiple_sources() {
        let mut gic = ready_gic(4);

        // CPUs 1 and 2 both raise SGI 5 at CPU 0
        gic.distif_write(1, 0xf00, (0x01 << 16) | 5);
        gic.distif_write(2, 0xf00, (0x01 << 16) | 5);
        assert_eq!(gic.distif.spendsgir[0][5], 0b0110);

        // lowest source id wins first
        let iar = gic.cpuif_read(0, 0x0c);
        assert_eq!(iar & 0x3ff, 5);
        assert_eq!((iar >> 10) & 0x7, 1);
        // one source remains, the SGI stays pending
        assert!(gic.is_irq_pending(5, 0x01));

        gic.cpuif_write(0, 0x10, 5);
        let iar = gic.cpuif_read(0, 0x0c);
        assert_eq!((iar >> 10) & 0x7, 2);
        assert!(!gic.is_irq_pending(5, 0x01));
    }

    #[test]
    fn test_sgi_filters() {
        let mut gic = ready_gic(4);

        // all-but-self from CPU 1
        gic.distif_write(1, 0xf00, (1 << 24) | 7);
        assert!(gic.is_irq_pending(7, 0b1101));
        assert!(!gic.is_irq_pending(7, 0b0010));

        // self-only from CPU 2
        gic.distif_write(2, 0xf00, (2 << 24) | 8);
        assert!(gic.is_irq_pending(8, 0b0100));
        assert!(!gic.is_irq_pending(8, 0b1011));
    }

    #[test]
    fn test_level_triggered_reassertion() {
        let mut gic = ready_gic(1);

        // IRQ 32 level-triggered, targeted at CPU 0
        gic.distif_write(0, 0xc08, 0); // ICFGR: level
        gic.distif_write(0, 0x820, 0x01); // ITARGETSR
        gic.distif_write(0, 0x104, 1); // ISENABLER

        gic.handle_spi(0, true);
        assert!(gic.irq_out(0));

        let iar = gic.cpuif_read(0, 0x0c);
        assert_eq!(iar, 32);
        assert!(!gic.irq_out(0));

        // input still high on completion: line reasserts immediately
        gic.cpuif_write(0, 0x10, 32);
        assert!(gic.irq_out(0));

        // dropping the input ends the cycle
        gic.handle_spi(0, false);
        let _ = gic.cpuif_read(0, 0x0c);
        gic.cpuif_write(0, 0x10, 32);
        assert!(!gic.irq_out(0));
    }

    #[test]
    fn test_edge_triggered_fires_once() {
        let mut gic = ready_gic(1);

        gic.distif_write(0, 0xc08, 2); // ICFGR: edge
        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0x104, 1);

        gic.handle_spi(0, true);
        assert!(gic.irq_out(0));
        assert_eq!(gic.cpuif_read(0, 0x0c), 32);
        gic.cpuif_write(0, 0x10, 32);
        // no new edge, no new interrupt
        assert!(!gic.irq_out(0));
    }

    #[test]
    fn test_priority_order_and_tie_break() {
        let mut gic = ready_gic(1);

        gic.distif_write(0, 0x820, 0x0101_0101); // SPIs 32..36 -> CPU 0
        gic.distif_write(0, 0x104, 0xf); // enable SPIs 32..36
        gic.distif_write(0, 0x420, 0x00_20_10_20); // prios 32:0x20 33:0x10 34:0x20 35:0

        gic.set_irq_pending(32, true, 0x01);
        gic.set_irq_pending(33, true, 0x01);
        gic.set_irq_pending(34, true, 0x01);
        gic.update();
        assert_eq!(gic.cpuif.hppir[0], 33); // lowest priority value wins

        // equal priorities break ties by ascending id
        gic.set_irq_pending(33, false, 0x01);
        gic.update();
        assert_eq!(gic.cpuif.hppir[0], 32);
    }

    #[test]
    fn test_priority_mask_gates_delivery() {
        let mut gic = ready_gic(1);

        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0x104, 1);
        gic.distif_write(0, 0x420, 0x80); // prio 0x80
        gic.set_irq_pending(32, true, 0x01);

        gic.cpuif_write(0, 0x04, 0x80); // pmr == prio: not deliverable
        assert!(!gic.irq_out(0));
        assert_eq!(gic.cpuif.hppir[0], SPURIOUS_IRQ);

        gic.cpuif_write(0, 0x04, 0x81);
        assert!(gic.irq_out(0));
        assert_eq!(gic.cpuif.hppir[0], 32);
    }

    #[test]
    fn test_preemption_stack() {
        let mut gic = ready_gic(1);

        gic.distif_write(0, 0x820, 0x0101); // SPIs 32, 33 -> CPU 0
        gic.distif_write(0, 0x104, 0b11);
        gic.distif_write(0, 0x420, 0x0040_0080); // 32: 0x80, 33: 0x40

        gic.set_irq_pending(32, true, 0x01);
        gic.update();
        assert_eq!(gic.cpuif_read(0, 0x0c), 32);
        assert_eq!(gic.cpuif.rpr[0], 0x80);

        // higher-priority 33 preempts while 32 is running
        gic.set_irq_pending(33, true, 0x01);
        gic.update();
        assert!(gic.irq_out(0));
        assert_eq!(gic.cpuif_read(0, 0x0c), 33);
        assert_eq!(gic.cpuif.rpr[0], 0x40);

        // strict LIFO: completing 33 resumes 32
        gic.cpuif_write(0, 0x10, 33);
        assert_eq!(gic.cpuif.curr_irq[0], 32);
        assert_eq!(gic.cpuif.rpr[0], 0x80);

        gic.cpuif_write(0, 0x10, 32);
        assert_eq!(gic.cpuif.curr_irq[0], SPURIOUS_IRQ);
        assert_eq!(gic.cpuif.rpr[0], IDLE_PRIO);
    }

    #[test]
    fn test_n_to_1_model_clears_all_cpus() {
        let mut gic = ready_gic(2);

        gic.distif_write(0, 0x820, 0x03); // SPI 32 -> CPU 0 and 1
        gic.distif_write(0, 0x104, 1);
        gic.set_irq_model(32, IrqModel::Nto1);
        gic.set_irq_pending(32, true, ALL_CPU);
        gic.update();
        assert!(gic.irq_out(0));
        assert!(gic.irq_out(1));

        // the first acknowledger consumes the pending state everywhere
        assert_eq!(gic.cpuif_read(0, 0x0c), 32);
        assert!(!gic.is_irq_pending(32, ALL_CPU));
        assert_eq!(gic.cpuif_read(1, 0x0c), SPURIOUS_IRQ as u32);
    }

    #[test]
    fn test_update_respects_enable_gates() {
        let mut gic = Gic400::new(1, 64);
        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0x104, 1);
        gic.distif_write(0, 0x420, 0);
        gic.set_irq_pending(32, true, 0x01);
        gic.cpuif_write(0, 0x04, 0xff);

        // neither distributor nor CPU interface enabled
        gic.update();
        assert!(!gic.irq_out(0));

        gic.distif_write(0, 0x000, 1);
        gic.update();
        assert!(!gic.irq_out(0));

        gic.cpuif_write(0, 0x00, 1);
        assert!(gic.irq_out(0));
    }

    #[test]
    fn test_active_blocks_rearbitration() {
        let mut gic = ready_gic(1);
        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0x104, 1);
        gic.set_irq_pending(32, true, 0x01);
        gic.update();

        assert_eq!(gic.cpuif_read(0, 0x0c), 32);
        // re-pending while active must not re-assert the line
        gic.set_irq_pending(32, true, 0x01);
        gic.update();
        assert!(!gic.irq_out(0));
    }
}
