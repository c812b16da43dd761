//! Per-port AHCI driver context.
//!
//! Grounded on the reference kernel's `ahci.c`: `prv_ahci_setup_port`
//! (command list / FIS-receive / command-table allocation and DMA
//! engine start), `send_read_cmd`/`find_cmd_slot` (command issue), and
//! `ahci_port_irq_handler` (completion). The reference hard-codes the
//! read path; this core generalises `send_read_cmd` into
//! [`Port::issue`] parameterized by direction so both reads and writes
//! share one command-building routine.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::ahci::regs::{self, CmdHeader, CmdTable, Hba, Prd};
use crate::blkdev::{Op, ReqState, Request};
use crate::config::AHCI_CMD_SLOTS;
use crate::devmgr::BlockDriver;
use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::memory::{pmm, vmm};

const STATE_IDLE: u32 = 0;
const STATE_READING: u32 = 1;
const STATE_WRITING: u32 = 2;

/// Pops one physical page, identity-maps it into KVAS, and zeroes it
/// through that mapping. DMA structures the HBA addresses directly
/// (command list, FIS-receive buffer, command tables) all live on
/// pages obtained this way rather than through the heap, whose virtual
/// addresses are not identity-mapped to their backing frames.
/// Number of PRD entries needed to cover `byte_count`, each PRD
/// spanning at most [`regs::PRD_MAX_BYTES`]. Always at least 1, even
/// for a zero-length transfer.
fn prds_needed(byte_count: u64) -> usize {
    let max = regs::PRD_MAX_BYTES as u64;
    ((byte_count + max - 1) / max).max(1) as usize
}

fn alloc_dma_page() -> PhysAddr {
    let phys = pmm::pop_page();
    vmm::map_kernel_page(phys.to_virt(), phys);
    unsafe {
        core::ptr::write_bytes(phys.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    phys
}

pub struct Port {
    ctrl_idx: usize,
    port_num: usize,
    hba: Hba,
    online_sata: bool,
    state: AtomicU32,
    num_sectors: AtomicUsize,
    /// Raw ATA serial number string, copied byte-for-byte from IDENTIFY
    /// word offset 10 (20 bytes), plus a trailing NUL.
    serial_str: [u8; 21],
    cmd_list: PhysAddr,
    rfis: PhysAddr,
    /// One dedicated page per command table: simpler than packing
    /// several 256-byte tables per page, and this core has pages to
    /// spare.
    cmd_tables: [PhysAddr; AHCI_CMD_SLOTS],
    current_req: AtomicUsize,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl core::fmt::Display for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ahci{}p{}", self.ctrl_idx, self.port_num)
    }
}

impl Port {
    pub fn is_online(&self) -> bool {
        self.online_sata
    }

    /// Probes port `port_num` behind `hba` without touching its DMA
    /// engines; only the detect/signature registers are read.
    pub fn probe(hba_base: u32, ctrl_idx: usize, port_num: usize) -> Port {
        let hba = Hba { base: hba_base };
        let ssts = hba.port_read(port_num, regs::PORT_SSTS);
        let det = ssts & 0x0F;
        let sig = hba.port_read(port_num, regs::PORT_SIG);
        let online_sata = det == regs::SSTS_DET_PRESENT_PHY && sig == regs::SIG_ATA;

        Port {
            ctrl_idx,
            port_num,
            hba,
            online_sata,
            state: AtomicU32::new(STATE_IDLE),
            num_sectors: AtomicUsize::new(0),
            serial_str: [0u8; 21],
            cmd_list: PhysAddr::zero(),
            rfis: PhysAddr::zero(),
            cmd_tables: [PhysAddr::zero(); AHCI_CMD_SLOTS],
            current_req: AtomicUsize::new(0),
        }
    }

    /// Allocates the command list / FIS-receive buffer / command
    /// tables, installs them on the port, and starts the FIS-receive
    /// and command-list DMA engines. Must run before [`identify`].
    pub fn setup(&mut self) {
        let p = self.port_num;

        self.hba.port_write(p, regs::PORT_CMD, self.hba.port_read(p, regs::PORT_CMD) & !regs::PORT_CMD_ST);
        self.hba.port_write(p, regs::PORT_CMD, self.hba.port_read(p, regs::PORT_CMD) & !regs::PORT_CMD_FRE);
        while self.hba.port_read(p, regs::PORT_CMD) & (regs::PORT_CMD_FR | regs::PORT_CMD_CR) != 0 {}

        self.rfis = alloc_dma_page();
        self.cmd_list = alloc_dma_page();
        for slot in self.cmd_tables.iter_mut() {
            *slot = alloc_dma_page();
        }

        self.hba.port_write(p, regs::PORT_CLB, self.cmd_list.as_u32());
        self.hba.port_write(p, regs::PORT_CLBU, 0);
        self.hba.port_write(p, regs::PORT_FB, self.rfis.as_u32());
        self.hba.port_write(p, regs::PORT_FBU, 0);

        for (slot, table_phys) in self.cmd_tables.iter().enumerate() {
            let hdr = self.cmd_header_mut(slot);
            hdr.ctba = table_phys.as_u32();
            hdr.ctbau = 0;
        }

        self.hba.port_write(p, regs::PORT_CMD, self.hba.port_read(p, regs::PORT_CMD) | regs::PORT_CMD_FRE);
        self.hba.port_write(p, regs::PORT_CMD, self.hba.port_read(p, regs::PORT_CMD) | regs::PORT_CMD_ST);
        while self.hba.port_read(p, regs::PORT_CMD) & (regs::PORT_CMD_FR | regs::PORT_CMD_CR)
            != (regs::PORT_CMD_FR | regs::PORT_CMD_CR)
        {}
    }

    fn cmd_header_mut(&self, slot: usize) -> &mut CmdHeader {
        let base = self.cmd_list.to_virt().as_mut_ptr::<CmdHeader>();
        unsafe { &mut *base.add(slot) }
    }

    fn cmd_table_mut(&self, slot: usize) -> &mut CmdTable {
        unsafe { &mut *self.cmd_tables[slot].to_virt().as_mut_ptr::<CmdTable>() }
    }

    /// Issues `ATA_CMD_IDENTIFY_DEVICE` and records the reported
    /// sector count. Must run after [`setup`].
    pub fn identify(&mut self) {
        let ident = alloc_dma_page();
        let Some(slot) = self.issue(Op::Read, regs::ATA_CMD_IDENTIFY_DEVICE, 0, 1, ident.as_u32()) else {
            kprintln!("[ahci] {}: could not issue IDENTIFY", self);
            return;
        };
        if !self.wait_for_slot(slot) {
            kprintln!("[ahci] {}: IDENTIFY failed", self);
            return;
        }

        let ident_virt = ident.to_virt().as_ptr::<u16>();
        let sectors_lo = unsafe { ident_virt.add(60).read_volatile() } as usize;
        let sectors_hi = unsafe { ident_virt.add(61).read_volatile() } as usize;
        let sectors = sectors_lo | (sectors_hi << 16);
        self.num_sectors.store(sectors, Ordering::Release);

        let serial_src = unsafe { ident_virt.add(10) as *const u8 };
        for i in 0..20 {
            self.serial_str[i] = unsafe { serial_src.add(i).read_volatile() };
        }
        self.serial_str[20] = 0;

        kprintln!("[ahci] {}: {} sectors", self, sectors);
    }

    /// Raw 20-byte ATA serial number string reported by IDENTIFY, NUL
    /// terminated, or all zeroes if `identify` has not run yet.
    pub fn serial(&self) -> &[u8; 21] {
        &self.serial_str
    }

    fn wait_for_slot(&self, slot: usize) -> bool {
        let p = self.port_num;
        loop {
            if self.hba.port_read(p, regs::PORT_IS) & regs::PORT_IS_TFE != 0 {
                self.hba.port_write(p, regs::PORT_IS, regs::PORT_IS_TFE);
                return false;
            }
            if self.hba.port_read(p, regs::PORT_CI) & (1 << slot) == 0 {
                return true;
            }
        }
    }

    fn find_cmd_slot(&self) -> Option<usize> {
        let p = self.port_num;
        let sact = self.hba.port_read(p, regs::PORT_SACT);
        let ci = self.hba.port_read(p, regs::PORT_CI);
        (0..AHCI_CMD_SLOTS).find(|&slot| sact & (1 << slot) == 0 && ci & (1 << slot) == 0)
    }

    /// Builds and issues one command. Shared by reads, writes, and
    /// IDENTIFY: only the command byte, the write bit, and the PRD
    /// contents change between them.
    fn issue(&self, op: Op, command: u8, start_sector: u64, sector_count: u32, buf: u32) -> Option<usize> {
        let read_size = 512u64 * sector_count as u64;
        let num_prds = prds_needed(read_size);
        if num_prds > regs::CMD_TABLE_NUM_PRDS {
            kprintln!("[ahci] {}: request too large for available PRDs", self);
            return None;
        }

        let slot = self.find_cmd_slot()?;

        let is_write = op == Op::Write;
        let hdr = self.cmd_header_mut(slot);
        hdr.flags = 5; // H2D register FIS is 5 dwords
        if is_write {
            hdr.flags |= regs::CMD_HDR_WRITE;
        }
        hdr.prdtl = num_prds as u16;
        hdr.prdbc = 0;

        let table = self.cmd_table_mut(slot);
        let last_len = if read_size % 0x400000 == 0 { 0x400000 } else { read_size % 0x400000 };
        for i in 0..num_prds {
            let len = if i + 1 == num_prds { last_len } else { 0x400000 };
            table.prdt[i] = Prd {
                dba: buf.wrapping_add((0x400000 * i) as u32),
                dbau: 0,
                _reserved: 0,
                dbc: (len as u32 - 1) | regs::PRD_INTERRUPT,
            };
        }

        table.cfis[0] = regs::FIS_TYPE_REG_H2D;
        table.cfis[1] = regs::FIS_H2D_COMMAND_BIT;
        table.cfis[2] = command;
        table.cfis[3] = 0; // features 7:0
        table.cfis[4] = (start_sector & 0xFF) as u8;
        table.cfis[5] = ((start_sector >> 8) & 0xFF) as u8;
        table.cfis[6] = ((start_sector >> 16) & 0xFF) as u8;
        table.cfis[7] = 1 << 6; // device: LBA mode
        table.cfis[8] = ((start_sector >> 24) & 0xFF) as u8;
        table.cfis[9] = ((start_sector >> 32) & 0xFF) as u8;
        table.cfis[10] = ((start_sector >> 40) & 0xFF) as u8;
        table.cfis[11] = 0; // features 15:8
        table.cfis[12] = (sector_count & 0xFF) as u8;
        table.cfis[13] = ((sector_count >> 8) & 0xFF) as u8;

        let p = self.port_num;
        let mut spins = 0u32;
        while self.hba.port_read(p, regs::PORT_TFD) & (regs::TFD_STS_BSY | regs::TFD_STS_DRQ) != 0 {
            spins += 1;
            if spins >= 100_000 {
                kprintln!("[ahci] {}: port busy, dropping command", self);
                return None;
            }
        }

        self.hba.port_write(p, regs::PORT_IS, regs::PORT_IS_DHR);
        self.hba.port_write(p, regs::PORT_CI, 1 << slot);
        Some(slot)
    }

    fn start(&self, op: Op, req: *const Request, start_sector: u64, sector_count: u32, buf: u32) -> bool {
        let command = if op == Op::Write { regs::ATA_CMD_WRITE_DMA_EXT } else { regs::ATA_CMD_READ_DMA_EXT };
        if self.issue(op, command, start_sector, sector_count, buf).is_some() {
            self.current_req.store(req as usize, Ordering::Release);
            true
        } else {
            false
        }
    }

}

impl BlockDriver for Port {
    fn is_busy(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_IDLE
    }

    /// The port's share of a global AHCI interrupt: clears whichever
    /// status bits are set and completes the bound request on a D2H
    /// register FIS, matching `ahci_port_irq_handler`.
    fn handle_irq(&self) {
        let p = self.port_num;
        let is = self.hba.port_read(p, regs::PORT_IS);
        if is == 0 {
            return;
        }
        self.hba.port_write(p, regs::PORT_IS, is & regs::PORT_IS_ALL);

        if is & regs::PORT_IS_DHR == 0 {
            if is & regs::PORT_IS_ERROR_MASK != 0 {
                kprintln!("[ahci] {}: error status {:#010x}", self, is);
            }
            return;
        }

        let state = self.state.load(Ordering::Acquire);
        if state != STATE_READING && state != STATE_WRITING {
            kprintln!("[ahci] {}: D2H IRQ with no active transfer (protocol violation)", self);
            return;
        }

        let req_ptr = self.current_req.swap(0, Ordering::AcqRel) as *const Request;
        if req_ptr.is_null() {
            kprintln!("[ahci] {}: D2H IRQ with no bound request (protocol violation)", self);
            self.state.store(STATE_IDLE, Ordering::Release);
            return;
        }

        let req = unsafe { &*req_ptr };
        let has_error = is & regs::PORT_IS_ERROR_MASK != 0;
        req.set_state(if has_error { ReqState::Error } else { ReqState::Success });
        self.state.store(STATE_IDLE, Ordering::Release);
        req.sem_done.increase();
    }

    fn submit(&self, req: &Request) {
        let target_state = match req.op {
            Op::Read => STATE_READING,
            Op::Write => STATE_WRITING,
        };
        if self
            .state
            .compare_exchange(STATE_IDLE, target_state, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            req.set_state(ReqState::Error);
            req.sem_done.increase();
            return;
        }

        let num_sectors = self.num_sectors.load(Ordering::Acquire) as u64;
        if req.start_sector >= num_sectors || req.start_sector + req.sector_count as u64 > num_sectors {
            kprintln!("[ahci] {}: request past end of device", self);
            self.state.store(STATE_IDLE, Ordering::Release);
            req.set_state(ReqState::Error);
            req.sem_done.increase();
            return;
        }

        if !self.start(req.op, req as *const Request, req.start_sector, req.sector_count, req.buf as u32) {
            self.state.store(STATE_IDLE, Ordering::Release);
            req.set_state(ReqState::Error);
            req.sem_done.increase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prds_needed_fits_one_entry_per_4mib() {
        assert_eq!(prds_needed(1), 1);
        assert_eq!(prds_needed(regs::PRD_MAX_BYTES as u64), 1);
        assert_eq!(prds_needed(regs::PRD_MAX_BYTES as u64 + 1), 2);
    }

    #[test]
    fn prds_needed_at_available_slot_boundary() {
        let max_sectors_per_prd = regs::PRD_MAX_BYTES as u64 / 512;

        let fits = max_sectors_per_prd * regs::CMD_TABLE_NUM_PRDS as u64;
        assert_eq!(prds_needed(fits * 512), regs::CMD_TABLE_NUM_PRDS);

        let one_too_many = max_sectors_per_prd * (regs::CMD_TABLE_NUM_PRDS as u64 + 1);
        assert!(prds_needed(one_too_many * 512) > regs::CMD_TABLE_NUM_PRDS);
    }
}
