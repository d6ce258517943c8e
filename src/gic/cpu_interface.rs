//! GIC-400 CPU interface register block.
//!
//! One interface per CPU, all registers banked. The interesting state is
//! the acknowledge/end-of-interrupt machinery: `curr_irq` names the
//! interrupt each CPU is servicing, and `prev_irq` is an arena of links
//! chaining each acknowledged interrupt to the one it preempted, with
//! `SPURIOUS_IRQ` as the nil sentinel.

use log::{debug, warn};

use super::{
    cidr_byte, Gic400, IrqModel, ALL_CPU, AMBA_IFID, IDLE_PRIO, NCPU, NIRQ, NSGI, SPURIOUS_IRQ,
};

// CPU interface register offsets
const CTLR: u64 = 0x00;
const PMR: u64 = 0x04;
const BPR: u64 = 0x08;
const IAR: u64 = 0x0c;
const EOIR: u64 = 0x10;
const RPR: u64 = 0x14;
const HPPIR: u64 = 0x18;
const ABPR: u64 = 0x1c;
const APR: u64 = 0xd0;
const IIDR: u64 = 0xfc;
const CIDR: u64 = 0xff0; // ..=0xffc
const DIR: u64 = 0x1000;

pub struct CpuInterface {
    pub(super) ctlr: [u32; NCPU],
    pub(super) pmr: [u32; NCPU],
    pub(super) bpr: [u32; NCPU],
    pub(super) abpr: [u32; NCPU],
    pub(super) rpr: [u16; NCPU],
    pub(super) hppir: [u16; NCPU],
    pub(super) iar: [u32; NCPU],
    pub(super) apr: [u32; NCPU],
    pub(super) dir: [u32; NCPU],

    /// Interrupt currently being serviced per CPU.
    pub(super) curr_irq: [u16; NCPU],
    /// Preemption links: `prev_irq[irq][cpu]` is the interrupt that was
    /// running when `irq` was acknowledged on `cpu`.
    pub(super) prev_irq: Vec<[u16; NCPU]>,
}

impl CpuInterface {
    pub(super) fn new() -> Self {
        Self {
            ctlr: [0; NCPU],
            pmr: [0; NCPU],
            bpr: [0; NCPU],
            abpr: [0; NCPU],
            rpr: [IDLE_PRIO; NCPU],
            hppir: [SPURIOUS_IRQ; NCPU],
            iar: [0; NCPU],
            apr: [0; NCPU],
            dir: [0; NCPU],
            curr_irq: [SPURIOUS_IRQ; NCPU],
            prev_irq: vec![[SPURIOUS_IRQ; NCPU]; NIRQ],
        }
    }
}

impl Gic400 {
    /// Read a CPU interface register on behalf of `cpu`. Reading IAR
    /// acknowledges the highest-priority pending interrupt.
    pub fn cpuif_read(&mut self, cpu: usize, offset: u64) -> u32 {
        let cpu = self.valid_cpu(cpu);

        match offset {
            CTLR => self.cpuif.ctlr[cpu],
            PMR => self.cpuif.pmr[cpu],
            BPR => self.cpuif.bpr[cpu],
            IAR => self.read_iar(cpu),
            RPR => self.cpuif.rpr[cpu] as u32,
            HPPIR => self.cpuif.hppir[cpu] as u32,
            ABPR => self.cpuif.abpr[cpu],
            APR => self.cpuif.apr[cpu],
            IIDR => AMBA_IFID,
            CIDR..=0xffc => cidr_byte((offset - CIDR) / 4),
            DIR => self.cpuif.dir[cpu],
            EOIR => {
                warn!("read of write-only cpu interface register {:#05x}", offset);
                0
            }
            _ => {
                warn!("read of unmapped cpu interface register {:#05x}", offset);
                0
            }
        }
    }

    /// Write a CPU interface register on behalf of `cpu`.
    pub fn cpuif_write(&mut self, cpu: usize, offset: u64, value: u32) {
        let cpu = self.valid_cpu(cpu);

        match offset {
            CTLR => {
                if value & 1 != 0 && self.cpuif.ctlr[cpu] == 0 {
                    debug!("(ctlr) enabling cpu {}", cpu);
                }
                if value & 1 == 0 && self.cpuif.ctlr[cpu] != 0 {
                    debug!("(ctlr) disabling cpu {}", cpu);
                }
                self.cpuif.ctlr[cpu] = value & 1;
                self.update();
            }
            PMR => {
                self.cpuif.pmr[cpu] = value & 0xff;
                self.update();
            }
            BPR => {
                // a copy is kept in ABPR
                self.cpuif.abpr[cpu] = value & 0x7;
                self.cpuif.bpr[cpu] = self.cpuif.abpr[cpu];
            }
            EOIR => self.write_eoir(cpu, value),
            ABPR => self.cpuif.abpr[cpu] = value & 0x7,
            APR => self.cpuif.apr[cpu] = value,
            DIR => self.cpuif.dir[cpu] = value,
            IAR | RPR | HPPIR | IIDR | CIDR..=0xffc => {
                warn!("write to read-only cpu interface register {:#05x}", offset);
            }
            _ => {
                warn!("write to unmapped cpu interface register {:#05x}", offset);
            }
        }
    }

    fn set_current_irq(&mut self, cpu: usize, irq: u16) {
        self.cpuif.curr_irq[cpu] = irq;
        self.cpuif.rpr[cpu] = if irq == SPURIOUS_IRQ {
            IDLE_PRIO
        } else {
            self.get_irq_priority(cpu, irq as usize) as u16
        };
        self.update();
    }

    /// Acknowledge the highest-priority pending interrupt for `cpu`.
    ///
    /// For SGIs the lowest-numbered pending source CPU is consumed and
    /// reported in bits 10..13 of the returned value; the interrupt stays
    /// pending while other sources remain.
    pub fn read_iar(&mut self, cpu: usize) -> u32 {
        let cpu = self.valid_cpu(cpu);
        let irq = self.cpuif.hppir[cpu];

        // acknowledging nothing, or nothing that would preempt
        if irq == SPURIOUS_IRQ
            || self.get_irq_priority(cpu, irq as usize) as u16 >= self.cpuif.rpr[cpu]
        {
            return SPURIOUS_IRQ as u32;
        }

        let irq = irq as usize;
        let cpu_mask = if self.get_irq_model(irq) == IrqModel::Nto1 {
            ALL_CPU
        } else {
            1 << cpu
        };

        debug!("(iar) cpu {} acknowledges irq {}", cpu, irq);

        let iar = if irq < NSGI {
            let sources = self.distif.spendsgir[cpu][irq];
            if sources == 0 {
                warn!("sgi {} pending without a source cpu", irq);
                self.set_irq_pending(irq, false, cpu_mask);
                irq as u32
            } else {
                let src = sources.trailing_zeros(); // lowest source first
                self.set_sgi_pending(1 << src, irq, cpu, false);
                // pending clears only once every source is consumed
                if self.distif.spendsgir[cpu][irq] == 0 {
                    self.set_irq_pending(irq, false, cpu_mask);
                }
                (src & 0x7) << 10 | irq as u32
            }
        } else {
            self.set_irq_pending(irq, false, cpu_mask);
            irq as u32
        };

        self.cpuif.iar[cpu] = iar;
        self.cpuif.prev_irq[irq][cpu] = self.cpuif.curr_irq[cpu];
        self.set_current_irq(cpu, irq as u16);
        self.set_irq_active(irq, true, cpu_mask);
        self.set_irq_signaled(irq, true, cpu_mask);
        iar
    }

    /// Signal end-of-interrupt for `cpu`. Completing the running interrupt
    /// pops the preemption stack; completing any other acknowledged
    /// interrupt just unlinks it.
    pub fn write_eoir(&mut self, cpu: usize, value: u32) {
        let cpu = self.valid_cpu(cpu);

        if self.cpuif.curr_irq[cpu] == SPURIOUS_IRQ {
            return; // no active interrupt
        }

        let irq = (value & 0x3ff) as usize; // interrupt id in bits 9..0
        if irq >= self.irq_num() {
            warn!("(eoi) invalid irq {} ignored", irq);
            return;
        }

        if irq as u16 == self.cpuif.curr_irq[cpu] {
            debug!("(eoi) cpu {} completes irq {}", cpu, irq);
            let prev = self.cpuif.prev_irq[irq][cpu];
            self.set_current_irq(cpu, prev);
            self.set_irq_active(irq, false, 1 << cpu);
            self.update();
            return;
        }

        // completed interrupt is further down the stack: splice it out
        let mut iter = self.cpuif.curr_irq[cpu] as usize;
        while self.cpuif.prev_irq[iter][cpu] != SPURIOUS_IRQ {
            let prev = self.cpuif.prev_irq[iter][cpu];
            if prev as usize == irq {
                self.cpuif.prev_irq[iter][cpu] = self.cpuif.prev_irq[irq][cpu];
                break;
            }
            iter = prev as usize;
        }
        self.set_irq_active(irq, false, 1 << cpu);
        self.update();
    }
}
