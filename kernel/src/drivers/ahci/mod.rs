//! AHCI (Advanced Host Controller Interface) Storage Driver
//!
//! Implements the AHCI 1.3 specification for SATA block access.
//!
//! # Architecture
//!
//! Each AHCI controller exposes a Host Bus Adapter (HBA) through PCI
//! BAR5 (ABAR), mapped uncached into the MMIO window. The HBA manages
//! up to 32 ports, each a physical SATA connector. Communication is DMA
//! through per-port structures in host memory: a command list of 32
//! slots, a received-FIS area, and one command table per slot whose
//! PRDT (physical region descriptor table) scatters the transfer.
//!
//! # Memory layout (per port, all PMM-allocated)
//!
//! - Command list: 1 page (32 x 32-byte command headers, 1 KiB in use)
//! - Received FIS: 1 page (256 bytes in use)
//! - Command tables: 1 page each, giving room for 248 PRDT entries
//! - Bounce buffer: 16 pages of physically contiguous DMA memory;
//!   caller buffers are staged through it so they may live anywhere in
//!   kernel virtual memory

#![allow(dead_code)]

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;
use x86_64::PhysAddr;

use crate::block::{check_request, BlockDevice, BlockError};
use crate::drivers::pci;
use crate::memory::layout::PAGE_SIZE;
use crate::memory::{self, pmm};

/// Sector size in bytes (standard for SATA).
pub const SECTOR_SIZE: usize = 512;

/// Maximum number of AHCI ports per controller.
const MAX_PORTS: usize = 32;

/// Pages of physically contiguous bounce memory per port.
const BOUNCE_PAGES: usize = 16;

/// Sectors that fit the bounce buffer; larger requests are chunked.
const BOUNCE_SECTORS: usize = BOUNCE_PAGES * PAGE_SIZE / SECTOR_SIZE;

/// Largest sector count one ATA command can carry (16-bit count field).
const MAX_COMMAND_SECTORS: usize = 65535;

/// Size of the per-controller register file we map: 0x100 of global
/// registers plus 32 ports at 0x80 each.
const HBA_REGION_SIZE: usize = 0x1100;

/// Spin budget for engine start/stop and HBA reset.
const SPIN_ENGINE: u32 = 1_000_000;

/// Spin budget for per-command completion.
const SPIN_COMMAND: u32 = 10_000_000;

// =============================================================================
// HBA Generic Host Control Registers (offset from ABAR)
// =============================================================================

/// Host Capabilities
const HBA_CAP: usize = 0x00;
/// Global Host Control
const HBA_GHC: usize = 0x04;
/// Interrupt Status
const HBA_IS: usize = 0x08;
/// Ports Implemented
const HBA_PI: usize = 0x0C;
/// Version
const HBA_VS: usize = 0x10;

/// GHC bits
const GHC_HR: u32 = 1 << 0; // HBA Reset
const GHC_IE: u32 = 1 << 1; // Interrupt Enable
const GHC_AE: u32 = 1 << 31; // AHCI Enable

/// CAP bits
const CAP_S64A: u32 = 1 << 31; // 64-bit Addressing

// =============================================================================
// Port Registers (offset from ABAR + 0x100 + port * 0x80)
// =============================================================================

/// Port register block size.
const PORT_REG_SIZE: usize = 0x80;

/// Command List Base Address (low)
const PORT_CLB: usize = 0x00;
/// Command List Base Address (high)
const PORT_CLBU: usize = 0x04;
/// FIS Base Address (low)
const PORT_FB: usize = 0x08;
/// FIS Base Address (high)
const PORT_FBU: usize = 0x0C;
/// Interrupt Status
const PORT_IS: usize = 0x10;
/// Interrupt Enable
const PORT_IE: usize = 0x14;
/// Command and Status
const PORT_CMD: usize = 0x18;
/// Task File Data
const PORT_TFD: usize = 0x20;
/// Signature
const PORT_SIG: usize = 0x24;
/// SATA Status (SCR0: SStatus)
const PORT_SSTS: usize = 0x28;
/// SATA Control (SCR2: SControl)
const PORT_SCTL: usize = 0x2C;
/// SATA Error (SCR1: SError)
const PORT_SERR: usize = 0x30;
/// SATA Active
const PORT_SACT: usize = 0x34;
/// Command Issue
const PORT_CI: usize = 0x38;

/// PORT_CMD bits
const PORT_CMD_ST: u32 = 1 << 0; // Start
const PORT_CMD_FRE: u32 = 1 << 4; // FIS Receive Enable
const PORT_CMD_FR: u32 = 1 << 14; // FIS Receive Running
const PORT_CMD_CR: u32 = 1 << 15; // Command List Running

/// PORT_IS bits
const PORT_IS_TFES: u32 = 1 << 30; // Task File Error Status

/// PORT_IE bits enabled at bring-up: device-to-host, PIO setup, DMA
/// setup, set-device-bits, descriptor processed, task-file error.
const PORT_IE_MASK: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5) | (1 << 30);

/// PORT_TFD bits
const PORT_TFD_BSY: u32 = 1 << 7; // Busy
const PORT_TFD_DRQ: u32 = 1 << 3; // Data Request

/// SATA Status (SSTS) fields
const SSTS_DET_MASK: u32 = 0x0F;
const SSTS_DET_PRESENT: u32 = 0x03; // Phy communication established
const SSTS_IPM_MASK: u32 = 0xF00;
const SSTS_IPM_ACTIVE: u32 = 0x100; // Interface in active state

/// Device signatures
const SIG_SATA: u32 = 0x0000_0101;
const SIG_ATAPI: u32 = 0xEB14_0101;
const SIG_SEMB: u32 = 0xC33C_0101;
const SIG_PM: u32 = 0x9669_0101;

/// Host to Device FIS type
const FIS_TYPE_REG_H2D: u8 = 0x27;

/// ATA commands
const ATA_CMD_IDENTIFY: u8 = 0xEC;
const ATA_CMD_IDENTIFY_PACKET: u8 = 0xA1;
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_FLUSH_EXT: u8 = 0xEA;

/// Device register value selecting LBA mode.
const DEVICE_LBA_MODE: u8 = 0x40;

// =============================================================================
// Failure taxonomy
// =============================================================================

/// Driver failure kinds. Exhaustive; adding a kind forces every match
/// site to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// No device attached to the port
    NoDevice,
    /// Port busy / no free command slot
    NotReady,
    /// Spin budget exhausted waiting for completion or reset
    Timeout,
    /// Command engine refused to stop or start
    PortHung,
    /// Device reported a task-file error
    TaskFile,
    /// Port index out of range or not implemented
    InvalidPort,
    /// Out of DMA-capable memory
    NoMemory,
    /// Request outside the device or driver contract
    Unsupported,
}

impl fmt::Display for AhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AhciError::NoDevice => write!(f, "no device on port"),
            AhciError::NotReady => write!(f, "port not ready"),
            AhciError::Timeout => write!(f, "command timed out"),
            AhciError::PortHung => write!(f, "port command engine hung"),
            AhciError::TaskFile => write!(f, "task file error"),
            AhciError::InvalidPort => write!(f, "invalid port"),
            AhciError::NoMemory => write!(f, "out of DMA memory"),
            AhciError::Unsupported => write!(f, "unsupported request"),
        }
    }
}

impl From<AhciError> for BlockError {
    fn from(err: AhciError) -> Self {
        match err {
            AhciError::Timeout => BlockError::Timeout,
            AhciError::NoDevice | AhciError::InvalidPort => BlockError::DeviceNotReady,
            AhciError::Unsupported => BlockError::InvalidArgument,
            _ => BlockError::Io,
        }
    }
}

/// Kind of device detected on a port, from the port signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Sata,
    Satapi,
    Semb,
    PortMultiplier,
    Other,
}

impl DeviceKind {
    fn from_signature(sig: u32) -> Self {
        match sig {
            SIG_SATA => DeviceKind::Sata,
            SIG_ATAPI => DeviceKind::Satapi,
            SIG_SEMB => DeviceKind::Semb,
            SIG_PM => DeviceKind::PortMultiplier,
            _ => DeviceKind::Other,
        }
    }
}

// =============================================================================
// DMA Memory Structures
// =============================================================================

/// Command list entry (command header) - 32 bytes, 32 per port.
#[repr(C)]
struct CmdHeader {
    /// Command FIS length in dwords (bits 4:0), ATAPI (bit 5), Write
    /// (bit 6), Clear BSY on R_OK (bit 10), PRDTL (bits 31:16)
    dw0: u32,
    /// Physical region descriptor byte count (bytes transferred)
    prdbc: u32,
    /// Command table base address (low)
    ctba: u32,
    /// Command table base address (high)
    ctbau: u32,
    _reserved: [u32; 4],
}

/// Physical region descriptor table entry - 16 bytes.
#[repr(C)]
struct PrdtEntry {
    /// Data base address (low)
    dba: u32,
    /// Data base address (high)
    dbau: u32,
    _reserved: u32,
    /// Byte count - 1 (bits 21:0), interrupt on completion (bit 31)
    dbc: u32,
}

/// PRDT entries that fit a one-page command table after the 128-byte
/// fixed part.
const PRDT_PER_TABLE: usize = (PAGE_SIZE - 128) / core::mem::size_of::<PrdtEntry>();

/// Largest byte count a single PRDT entry may describe (4 MiB).
const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Command table: command FIS, ATAPI command, then the PRDT. One page.
#[repr(C)]
struct CmdTable {
    cfis: [u8; 64],
    acmd: [u8; 16],
    _reserved: [u8; 48],
    prdt: [PrdtEntry; PRDT_PER_TABLE],
}

/// Register host-to-device FIS - 20 bytes.
///
/// Built as a byte image so the layout is independent of field padding.
fn build_cmd_fis(command: u8, lba: u64, count: u16, device: u8) -> [u8; 20] {
    let mut fis = [0u8; 20];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = 0x80; // C bit: this is a command
    fis[2] = command;
    fis[3] = 0; // features (low)
    fis[4] = lba as u8;
    fis[5] = (lba >> 8) as u8;
    fis[6] = (lba >> 16) as u8;
    fis[7] = device;
    fis[8] = (lba >> 24) as u8;
    fis[9] = (lba >> 32) as u8;
    fis[10] = (lba >> 40) as u8;
    fis[11] = 0; // features (high)
    fis[12] = count as u8;
    fis[13] = (count >> 8) as u8;
    fis
}

/// First free command slot: the lowest zero bit of `SACT | CI`.
fn find_free_slot(sact: u32, ci: u32, num_slots: u32) -> Option<u32> {
    let busy = sact | ci;
    (0..num_slots).find(|&slot| busy & (1 << slot) == 0)
}

/// Split a physically contiguous buffer into PRDT-sized ranges.
fn prdt_ranges(phys: u64, len: usize) -> Vec<(u64, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0usize;
    while offset < len {
        let chunk = (len - offset).min(PRDT_MAX_BYTES);
        ranges.push((phys + offset as u64, chunk));
        offset += chunk;
    }
    ranges
}

// =============================================================================
// IDENTIFY DEVICE parsing
// =============================================================================

/// Identity reported by IDENTIFY DEVICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    /// Model string (words 27-46)
    pub model: String,
    /// Serial number (words 10-19)
    pub serial: String,
    /// Addressable sectors: 48-bit count, falling back to 28-bit
    pub sectors: u64,
}

/// Decode an ATA string field: each 16-bit word carries two characters
/// byte-swapped. Trailing spaces are trimmed.
fn ata_string(data: &[u8], first_word: usize, word_count: usize) -> String {
    let mut out = String::with_capacity(word_count * 2);
    for word in 0..word_count {
        let base = (first_word + word) * 2;
        out.push(data[base + 1] as char);
        out.push(data[base] as char);
    }
    out.trim_end_matches([' ', '\0']).into()
}

fn le16(data: &[u8], word: usize) -> u16 {
    u16::from_le_bytes([data[word * 2], data[word * 2 + 1]])
}

/// Parse the 512-byte IDENTIFY DEVICE response.
fn parse_identify(data: &[u8]) -> IdentifyInfo {
    let lba48 = (le16(data, 100) as u64)
        | ((le16(data, 101) as u64) << 16)
        | ((le16(data, 102) as u64) << 32)
        | ((le16(data, 103) as u64) << 48);
    let sectors = if lba48 != 0 {
        lba48
    } else {
        (le16(data, 60) as u64) | ((le16(data, 61) as u64) << 16)
    };

    IdentifyInfo {
        model: ata_string(data, 27, 20),
        serial: ata_string(data, 10, 10),
        sectors,
    }
}

// =============================================================================
// Register access helpers
// =============================================================================

#[inline]
fn hba_read(abar: u64, offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile((abar + offset as u64) as *const u32) }
}

#[inline]
fn hba_write(abar: u64, offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((abar + offset as u64) as *mut u32, value) }
}

#[inline]
fn port_base(abar: u64, port: usize) -> u64 {
    abar + 0x100 + (port * PORT_REG_SIZE) as u64
}

#[inline]
fn port_read(abar: u64, port: usize, offset: usize) -> u32 {
    hba_read(port_base(abar, port), offset)
}

#[inline]
fn port_write(abar: u64, port: usize, offset: usize, value: u32) {
    hba_write(port_base(abar, port), offset, value)
}

// =============================================================================
// Controller state
// =============================================================================

/// Per-port DMA allocations, all owned by the PMM.
struct PortDma {
    cmd_list: PhysAddr,
    fis: PhysAddr,
    tables: Vec<PhysAddr>,
    bounce: PhysAddr,
}

impl PortDma {
    /// Allocate and zero all DMA memory for one port.
    ///
    /// An HBA without 64-bit addressing (CAP.S64A clear) only sees the
    /// low 4 GiB, so its DMA memory is constrained to that window.
    fn allocate(num_slots: usize, supports_64bit: bool) -> Option<PortDma> {
        let limit = if supports_64bit {
            u64::MAX
        } else {
            0x1_0000_0000
        };
        let mut held: Vec<(PhysAddr, usize)> = Vec::new();
        let mut take = |frames: usize| -> Option<PhysAddr> {
            let phys = pmm::allocate_frames_below(frames, limit)?;
            held.push((phys, frames));
            unsafe {
                core::ptr::write_bytes(
                    memory::phys_to_virt(phys).as_mut_ptr::<u8>(),
                    0,
                    frames * PAGE_SIZE,
                );
            }
            Some(phys)
        };

        let result = (|| {
            let cmd_list = take(1)?;
            let fis = take(1)?;
            let mut tables = Vec::with_capacity(num_slots);
            for _ in 0..num_slots {
                tables.push(take(1)?);
            }
            let bounce = take(BOUNCE_PAGES)?;
            Some(PortDma {
                cmd_list,
                fis,
                tables,
                bounce,
            })
        })();

        if result.is_none() {
            for (phys, frames) in held {
                pmm::free_frames(phys, frames);
            }
        }
        result
    }

    fn bounce_slice(&self, len: usize) -> &'static mut [u8] {
        let virt = memory::phys_to_virt(self.bounce);
        unsafe { core::slice::from_raw_parts_mut(virt.as_mut_ptr(), len) }
    }
}

/// Per-port state for a detected device.
struct PortState {
    port_num: usize,
    kind: DeviceKind,
    identify: Option<IdentifyInfo>,
    dma: PortDma,
}

/// One AHCI controller (HBA).
pub struct AhciController {
    /// Virtual base of the mapped HBA register file
    abar_virt: u64,
    /// Command slots supported (CAP.NCS + 1)
    num_cmd_slots: u32,
    /// Whether the HBA can address 64-bit DMA (CAP.S64A)
    supports_64bit: bool,
    /// Implemented-ports bitmap (PI)
    ports_implemented: u32,
    ports: [Option<PortState>; MAX_PORTS],
}

impl AhciController {
    /// Bring up a controller found on the PCI bus.
    fn init(dev: &pci::Device) -> Result<Self, &'static str> {
        let abar_phys = dev.abar();
        if abar_phys == 0 {
            return Err("AHCI: BAR5 not a memory BAR");
        }

        dev.enable_memory_space();
        dev.enable_bus_master();

        let abar_virt = memory::map_mmio(PhysAddr::new(abar_phys), HBA_REGION_SIZE)
            .map_err(|_| "AHCI: failed to map HBA registers")?
            .as_u64();

        // Enable AHCI mode before touching anything else.
        let ghc = hba_read(abar_virt, HBA_GHC);
        hba_write(abar_virt, HBA_GHC, ghc | GHC_AE);

        // Reset the HBA and wait for the bit to self-clear.
        hba_write(abar_virt, HBA_GHC, hba_read(abar_virt, HBA_GHC) | GHC_HR);
        let mut spins = 0;
        while hba_read(abar_virt, HBA_GHC) & GHC_HR != 0 {
            spins += 1;
            if spins > SPIN_ENGINE {
                return Err("AHCI: HBA reset timed out");
            }
            core::hint::spin_loop();
        }

        // Reset clears AE; re-assert it, clear stale interrupt status,
        // then enable interrupts globally.
        hba_write(abar_virt, HBA_GHC, hba_read(abar_virt, HBA_GHC) | GHC_AE);
        hba_write(abar_virt, HBA_IS, 0xFFFF_FFFF);
        hba_write(abar_virt, HBA_GHC, hba_read(abar_virt, HBA_GHC) | GHC_IE);

        let cap = hba_read(abar_virt, HBA_CAP);
        let num_cmd_slots = ((cap >> 8) & 0x1F) + 1;
        let supports_64bit = cap & CAP_S64A != 0;
        let ports_implemented = hba_read(abar_virt, HBA_PI);
        let version = hba_read(abar_virt, HBA_VS);

        log::info!(
            "AHCI: HBA version {}.{}, {} cmd slots, 64-bit {}, PI={:#010x}",
            version >> 16,
            version & 0xFFFF,
            num_cmd_slots,
            supports_64bit,
            ports_implemented,
        );

        let mut controller = AhciController {
            abar_virt,
            num_cmd_slots,
            supports_64bit,
            ports_implemented,
            ports: core::array::from_fn(|_| None),
        };

        for port_num in 0..MAX_PORTS {
            if ports_implemented & (1 << port_num) == 0 {
                continue;
            }
            match controller.init_port(port_num) {
                Ok(Some(port)) => {
                    log::info!(
                        "AHCI: port {}: {:?}, {} sectors ({} MiB)",
                        port_num,
                        port.kind,
                        port.sectors(),
                        port.sectors() * SECTOR_SIZE as u64 / (1024 * 1024),
                    );
                    controller.ports[port_num] = Some(port);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("AHCI: port {} bring-up failed: {}", port_num, err);
                }
            }
        }

        Ok(controller)
    }

    /// Bring one implemented port online. `Ok(None)` means no device.
    fn init_port(&mut self, port_num: usize) -> Result<Option<PortState>, AhciError> {
        let abar = self.abar_virt;

        // Device present only with an established Phy and active power
        // management state.
        let ssts = port_read(abar, port_num, PORT_SSTS);
        if ssts & SSTS_DET_MASK != SSTS_DET_PRESENT || ssts & SSTS_IPM_MASK != SSTS_IPM_ACTIVE {
            return Ok(None);
        }

        let kind = DeviceKind::from_signature(port_read(abar, port_num, PORT_SIG));

        self.stop_engine(port_num)?;

        let dma = PortDma::allocate(self.num_cmd_slots as usize, self.supports_64bit)
            .ok_or(AhciError::NoMemory)?;

        // Program the command list and FIS bases, split into halves.
        let clb = dma.cmd_list.as_u64();
        port_write(abar, port_num, PORT_CLB, clb as u32);
        port_write(abar, port_num, PORT_CLBU, (clb >> 32) as u32);
        let fb = dma.fis.as_u64();
        port_write(abar, port_num, PORT_FB, fb as u32);
        port_write(abar, port_num, PORT_FBU, (fb >> 32) as u32);

        // Point every command header at its table once; command issue
        // only rewrites the per-command fields.
        for (slot, table) in dma.tables.iter().enumerate() {
            let header = self.command_header(&dma, slot);
            let ctba = table.as_u64();
            header.ctba = ctba as u32;
            header.ctbau = (ctba >> 32) as u32;
            header.prdbc = 0;
            header.dw0 = 0;
        }

        // Clear accumulated errors and interrupt status, then pick the
        // interrupt sources we service.
        port_write(abar, port_num, PORT_SERR, 0xFFFF_FFFF);
        port_write(abar, port_num, PORT_IS, 0xFFFF_FFFF);
        port_write(abar, port_num, PORT_IE, PORT_IE_MASK);

        self.start_engine(port_num)?;

        let mut state = PortState {
            port_num,
            kind,
            identify: None,
            dma,
        };

        if matches!(kind, DeviceKind::Sata | DeviceKind::Satapi) {
            match self.identify_into(&mut state) {
                Ok(()) => {}
                Err(err) => log::warn!("AHCI: port {} IDENTIFY failed: {}", port_num, err),
            }
        }

        Ok(Some(state))
    }

    /// Stop the command engine: clear ST and wait for CR, then clear
    /// FRE and wait for FR. Stuck bits mean a hung port.
    fn stop_engine(&self, port: usize) -> Result<(), AhciError> {
        let abar = self.abar_virt;

        let cmd = port_read(abar, port, PORT_CMD);
        port_write(abar, port, PORT_CMD, cmd & !PORT_CMD_ST);
        self.spin_while(port, PORT_CMD_CR)?;

        let cmd = port_read(abar, port, PORT_CMD);
        port_write(abar, port, PORT_CMD, cmd & !PORT_CMD_FRE);
        self.spin_while(port, PORT_CMD_FR)?;

        Ok(())
    }

    /// Start the command engine: FIS receive first, then start.
    fn start_engine(&self, port: usize) -> Result<(), AhciError> {
        let abar = self.abar_virt;
        self.spin_while(port, PORT_CMD_CR)?;

        let mut cmd = port_read(abar, port, PORT_CMD);
        cmd |= PORT_CMD_FRE;
        port_write(abar, port, PORT_CMD, cmd);
        cmd |= PORT_CMD_ST;
        port_write(abar, port, PORT_CMD, cmd);
        Ok(())
    }

    /// Spin until the given PORT_CMD bit drops.
    fn spin_while(&self, port: usize, bit: u32) -> Result<(), AhciError> {
        for _ in 0..SPIN_ENGINE {
            if port_read(self.abar_virt, port, PORT_CMD) & bit == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AhciError::PortHung)
    }

    /// Wait for the device to leave busy/data-request state.
    fn wait_ready(&self, port: usize) -> Result<(), AhciError> {
        for _ in 0..SPIN_ENGINE {
            let tfd = port_read(self.abar_virt, port, PORT_TFD);
            if tfd & (PORT_TFD_BSY | PORT_TFD_DRQ) == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AhciError::NotReady)
    }

    fn command_header(&self, dma: &PortDma, slot: usize) -> &'static mut CmdHeader {
        let virt = memory::phys_to_virt(dma.cmd_list)
            + (slot * core::mem::size_of::<CmdHeader>()) as u64;
        unsafe { &mut *(virt.as_mut_ptr::<CmdHeader>()) }
    }

    fn command_table(&self, dma: &PortDma, slot: usize) -> &'static mut CmdTable {
        let virt = memory::phys_to_virt(dma.tables[slot]);
        unsafe { &mut *(virt.as_mut_ptr::<CmdTable>()) }
    }

    /// Issue one ATA command against the port's bounce buffer and spin
    /// for its completion.
    fn issue(
        &mut self,
        port_num: usize,
        command: u8,
        lba: u64,
        count: u16,
        byte_len: usize,
        write: bool,
        device: u8,
    ) -> Result<(), AhciError> {
        let abar = self.abar_virt;
        self.wait_ready(port_num)?;

        let num_slots = self.num_cmd_slots;
        let state = self.port_ref(port_num)?;

        // The first clear bit of SACT | CI wins.
        let sact = port_read(abar, port_num, PORT_SACT);
        let ci = port_read(abar, port_num, PORT_CI);
        let slot = find_free_slot(sact, ci, num_slots).ok_or(AhciError::NotReady)? as usize;

        // Fill the command table: fresh CFIS, no ATAPI payload, PRDT
        // over the bounce buffer.
        let table = self.command_table(&state.dma, slot);
        table.cfis = [0; 64];
        table.acmd = [0; 16];
        table.cfis[..20].copy_from_slice(&build_cmd_fis(command, lba, count, device));

        let ranges = prdt_ranges(state.dma.bounce.as_u64(), byte_len);
        for (i, &(phys, len)) in ranges.iter().enumerate() {
            let last = i == ranges.len() - 1;
            table.prdt[i] = PrdtEntry {
                dba: phys as u32,
                dbau: (phys >> 32) as u32,
                _reserved: 0,
                // Byte count - 1; interrupt once the last entry is done.
                dbc: (len as u32 - 1) | if last { 1 << 31 } else { 0 },
            };
        }

        // Command header: FIS length in dwords, direction, clear-busy,
        // PRDT length.
        let header = self.command_header(&state.dma, slot);
        let ctba = state.dma.tables[slot].as_u64();
        header.ctba = ctba as u32;
        header.ctbau = (ctba >> 32) as u32;
        header.prdbc = 0;
        header.dw0 = 5 // CFL: 20-byte H2D FIS
            | if write { 1 << 6 } else { 0 }
            | 1 << 10 // clear BSY on R_OK
            | (ranges.len() as u32) << 16;

        // Everything the device will DMA must be visible first.
        core::sync::atomic::fence(Ordering::SeqCst);

        port_write(abar, port_num, PORT_IS, 0xFFFF_FFFF);
        port_write(abar, port_num, PORT_CI, 1 << slot);

        for _ in 0..SPIN_COMMAND {
            if port_read(abar, port_num, PORT_CI) & (1 << slot) == 0 {
                if port_read(abar, port_num, PORT_IS) & PORT_IS_TFES != 0 {
                    let tfd = port_read(abar, port_num, PORT_TFD);
                    log::warn!("AHCI: port {} task file error, TFD={:#x}", port_num, tfd);
                    return Err(AhciError::TaskFile);
                }
                return Ok(());
            }
            if port_read(abar, port_num, PORT_IS) & PORT_IS_TFES != 0 {
                let tfd = port_read(abar, port_num, PORT_TFD);
                log::warn!("AHCI: port {} task file error, TFD={:#x}", port_num, tfd);
                return Err(AhciError::TaskFile);
            }
            core::hint::spin_loop();
        }
        Err(AhciError::Timeout)
    }

    fn port_ref(&self, port: usize) -> Result<&PortState, AhciError> {
        if port >= MAX_PORTS || self.ports_implemented & (1 << port) == 0 {
            return Err(AhciError::InvalidPort);
        }
        self.ports[port].as_ref().ok_or(AhciError::NoDevice)
    }

    /// Issue IDENTIFY (or its packet variant) and cache the result.
    fn identify_into(&mut self, state: &mut PortState) -> Result<(), AhciError> {
        let command = match state.kind {
            DeviceKind::Sata => ATA_CMD_IDENTIFY,
            DeviceKind::Satapi => ATA_CMD_IDENTIFY_PACKET,
            _ => return Err(AhciError::Unsupported),
        };
        let port_num = state.port_num;

        // IDENTIFY wants device register 0 and no LBA.
        {
            // Stage through the port that is being brought up; it is not
            // yet published in self.ports.
            let abar = self.abar_virt;
            self.wait_ready(port_num)?;
            let sact = port_read(abar, port_num, PORT_SACT);
            let ci = port_read(abar, port_num, PORT_CI);
            let slot =
                find_free_slot(sact, ci, self.num_cmd_slots).ok_or(AhciError::NotReady)? as usize;

            let table = self.command_table(&state.dma, slot);
            table.cfis = [0; 64];
            table.acmd = [0; 16];
            table.cfis[..20].copy_from_slice(&build_cmd_fis(command, 0, 0, 0));
            table.prdt[0] = PrdtEntry {
                dba: state.dma.bounce.as_u64() as u32,
                dbau: (state.dma.bounce.as_u64() >> 32) as u32,
                _reserved: 0,
                dbc: (SECTOR_SIZE as u32 - 1) | (1 << 31),
            };

            let header = self.command_header(&state.dma, slot);
            let ctba = state.dma.tables[slot].as_u64();
            header.ctba = ctba as u32;
            header.ctbau = (ctba >> 32) as u32;
            header.prdbc = 0;
            header.dw0 = 5 | 1 << 10 | 1 << 16;

            core::sync::atomic::fence(Ordering::SeqCst);
            port_write(abar, port_num, PORT_IS, 0xFFFF_FFFF);
            port_write(abar, port_num, PORT_CI, 1 << slot);

            let mut done = false;
            for _ in 0..SPIN_COMMAND {
                if port_read(abar, port_num, PORT_CI) & (1 << slot) == 0 {
                    done = true;
                    break;
                }
                if port_read(abar, port_num, PORT_IS) & PORT_IS_TFES != 0 {
                    return Err(AhciError::TaskFile);
                }
                core::hint::spin_loop();
            }
            if !done {
                return Err(AhciError::Timeout);
            }
        }

        core::sync::atomic::fence(Ordering::SeqCst);
        let data = state.dma.bounce_slice(SECTOR_SIZE);
        let info = parse_identify(data);
        log::info!(
            "AHCI: port {} model '{}' serial '{}' {} sectors",
            port_num,
            info.model,
            info.serial,
            info.sectors
        );
        state.identify = Some(info);
        Ok(())
    }

    /// Synchronous sector I/O through the port bounce buffer.
    fn transfer(
        &mut self,
        port: usize,
        lba: u64,
        count: usize,
        buf_read: Option<&mut [u8]>,
        buf_write: Option<&[u8]>,
    ) -> Result<(), AhciError> {
        if count == 0 || count > MAX_COMMAND_SECTORS {
            return Err(AhciError::Unsupported);
        }
        let state = self.port_ref(port)?;
        if state.kind != DeviceKind::Sata {
            // Reads need the packet protocol on ATAPI; writes to
            // non-SATA devices are rejected outright.
            return Err(AhciError::Unsupported);
        }
        let expected = count * SECTOR_SIZE;
        let buf_len = buf_read
            .as_ref()
            .map(|b| b.len())
            .or(buf_write.map(|b| b.len()))
            .unwrap_or(0);
        if buf_len < expected {
            return Err(AhciError::Unsupported);
        }

        let mut read_buf = buf_read;
        let mut done = 0usize;
        while done < count {
            let chunk = (count - done).min(BOUNCE_SECTORS);
            let chunk_bytes = chunk * SECTOR_SIZE;
            let offset = done * SECTOR_SIZE;

            if let Some(data) = buf_write {
                let bounce = self.port_ref(port)?.dma.bounce_slice(chunk_bytes);
                bounce.copy_from_slice(&data[offset..offset + chunk_bytes]);
                self.issue(
                    port,
                    ATA_CMD_WRITE_DMA_EXT,
                    lba + done as u64,
                    chunk as u16,
                    chunk_bytes,
                    true,
                    DEVICE_LBA_MODE,
                )?;
            } else {
                self.issue(
                    port,
                    ATA_CMD_READ_DMA_EXT,
                    lba + done as u64,
                    chunk as u16,
                    chunk_bytes,
                    false,
                    DEVICE_LBA_MODE,
                )?;
                core::sync::atomic::fence(Ordering::SeqCst);
                let bounce = self.port_ref(port)?.dma.bounce_slice(chunk_bytes);
                if let Some(out) = read_buf.as_mut() {
                    out[offset..offset + chunk_bytes].copy_from_slice(bounce);
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Flush the device write cache.
    fn flush_port(&mut self, port: usize) -> Result<(), AhciError> {
        let state = self.port_ref(port)?;
        if state.kind != DeviceKind::Sata {
            return Err(AhciError::Unsupported);
        }
        self.issue(port, ATA_CMD_FLUSH_EXT, 0, 0, 0, false, DEVICE_LBA_MODE)
    }
}

impl PortState {
    fn sectors(&self) -> u64 {
        self.identify.as_ref().map(|i| i.sectors).unwrap_or(0)
    }
}

// =============================================================================
// Globals and public API
// =============================================================================

static AHCI_INITIALIZED: AtomicBool = AtomicBool::new(false);
static CONTROLLERS: Mutex<Vec<AhciController>> = Mutex::new(Vec::new());

/// Interrupts acknowledged since boot.
static IRQ_COUNT: AtomicU64 = AtomicU64::new(0);
/// Task-file errors observed by the interrupt path.
static IRQ_ERRORS: AtomicU64 = AtomicU64::new(0);

/// Scan PCI for AHCI controllers and bring every port online.
///
/// Returns the number of usable SATA devices found.
pub fn init() -> Result<usize, &'static str> {
    if AHCI_INITIALIZED.load(Ordering::Acquire) {
        return Ok(0);
    }

    let devices = pci::find_ahci_controllers();
    if devices.is_empty() {
        return Err("No AHCI controller found");
    }

    let mut controllers = Vec::new();
    for dev in &devices {
        match AhciController::init(dev) {
            Ok(controller) => controllers.push(controller),
            Err(err) => log::error!("AHCI: controller {} failed: {}", dev, err),
        }
    }
    if controllers.is_empty() {
        return Err("AHCI: no controller initialized");
    }

    let sata_count = controllers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter(|p| p.kind == DeviceKind::Sata && p.sectors() > 0)
        .count();

    *CONTROLLERS.lock() = controllers;
    AHCI_INITIALIZED.store(true, Ordering::Release);

    Ok(sata_count)
}

fn with_primary<R>(
    f: impl FnOnce(&mut AhciController) -> Result<R, AhciError>,
) -> Result<R, AhciError> {
    with_controller(0, f)
}

fn with_controller<R>(
    index: usize,
    f: impl FnOnce(&mut AhciController) -> Result<R, AhciError>,
) -> Result<R, AhciError> {
    let mut guard = CONTROLLERS.lock();
    let controller = guard.get_mut(index).ok_or(AhciError::NoDevice)?;
    f(controller)
}

/// Read `count` sectors from a port of the primary controller.
pub fn read_sectors(port: usize, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), AhciError> {
    with_primary(|c| c.transfer(port, lba, count, Some(buf), None))
}

/// Write `count` sectors to a port of the primary controller.
pub fn write_sectors(port: usize, lba: u64, count: usize, buf: &[u8]) -> Result<(), AhciError> {
    with_primary(|c| c.transfer(port, lba, count, None, Some(buf)))
}

/// Re-issue IDENTIFY DEVICE and return the parsed identity.
pub fn identify(port: usize) -> Result<IdentifyInfo, AhciError> {
    with_primary(|c| {
        if port >= MAX_PORTS {
            return Err(AhciError::InvalidPort);
        }
        let mut state = c.ports[port].take().ok_or(AhciError::NoDevice)?;
        let result = c.identify_into(&mut state);
        let info = state.identify.clone();
        c.ports[port] = Some(state);
        result?;
        info.ok_or(AhciError::NoDevice)
    })
}

/// Flush the write cache of a port on the primary controller.
pub fn flush(port: usize) -> Result<(), AhciError> {
    with_primary(|c| c.flush_port(port))
}

/// Acknowledge pending interrupts across every controller.
///
/// Called from the interrupt dispatch path; records statistics and
/// clears hardware status, never propagates errors.
pub fn handle_interrupt() {
    // An in-flight command may hold the controller lock; never block on
    // it from interrupt context.
    let Some(mut guard) = CONTROLLERS.try_lock() else {
        return;
    };
    for controller in guard.iter_mut() {
        let abar = controller.abar_virt;
        let pending = hba_read(abar, HBA_IS);
        if pending == 0 {
            continue;
        }
        for port in 0..MAX_PORTS {
            if pending & (1 << port) == 0 {
                continue;
            }
            let is = port_read(abar, port, PORT_IS);
            if is & PORT_IS_TFES != 0 {
                IRQ_ERRORS.fetch_add(1, Ordering::Relaxed);
            }
            port_write(abar, port, PORT_IS, is);
        }
        hba_write(abar, HBA_IS, pending);
        IRQ_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Interrupt statistics: `(acknowledged, task_file_errors)`.
pub fn irq_stats() -> (u64, u64) {
    (
        IRQ_COUNT.load(Ordering::Relaxed),
        IRQ_ERRORS.load(Ordering::Relaxed),
    )
}

/// Check if AHCI is initialized.
pub fn is_initialized() -> bool {
    AHCI_INITIALIZED.load(Ordering::Acquire)
}

// =============================================================================
// BlockDevice adapter
// =============================================================================

/// AHCI block device wrapping a specific controller port.
pub struct AhciBlockDevice {
    controller: usize,
    port: usize,
    sector_count: u64,
}

impl BlockDevice for AhciBlockDevice {
    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), SECTOR_SIZE, self.sector_count)?;
        with_controller(self.controller, |c| {
            c.transfer(self.port, lba, count, Some(buf), None)
        })
        .map_err(BlockError::from)
    }

    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), SECTOR_SIZE, self.sector_count)?;
        with_controller(self.controller, |c| {
            c.transfer(self.port, lba, count, None, Some(buf))
        })
        .map_err(BlockError::from)
    }

    fn flush(&self) -> Result<(), BlockError> {
        with_controller(self.controller, |c| c.flush_port(self.port)).map_err(BlockError::from)
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

/// Get the first SATA block device.
pub fn get_block_device() -> Option<AhciBlockDevice> {
    get_block_device_by_index(0)
}

/// Get the Nth SATA block device (0-indexed) across all controllers.
///
/// Skips non-SATA ports and ports reporting zero capacity.
pub fn get_block_device_by_index(index: usize) -> Option<AhciBlockDevice> {
    let guard = CONTROLLERS.lock();
    guard
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| {
            c.ports
                .iter()
                .flatten()
                .filter(|p| p.kind == DeviceKind::Sata && p.sectors() > 0)
                .map(move |p| (ci, p.port_num, p.sectors()))
        })
        .nth(index)
        .map(|(controller, port, sector_count)| AhciBlockDevice {
            controller,
            port,
            sector_count,
        })
}

/// Number of usable SATA block devices.
pub fn sata_device_count() -> usize {
    let guard = CONTROLLERS.lock();
    guard
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter(|p| p.kind == DeviceKind::Sata && p.sectors() > 0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_selection() {
        assert_eq!(find_free_slot(0, 0, 32), Some(0));
        assert_eq!(find_free_slot(0b1, 0, 32), Some(1));
        assert_eq!(find_free_slot(0b01, 0b10, 32), Some(2));
        // SACT and CI are OR-ed: a slot busy in either is skipped.
        assert_eq!(find_free_slot(0x0F, 0xF0, 32), Some(8));
        assert_eq!(find_free_slot(u32::MAX, 0, 32), None);
        // Only the first `num_slots` slots exist.
        assert_eq!(find_free_slot(0xFFFF_FFFF >> 8, 0, 24), None);
        assert_eq!(find_free_slot(0x7FFF_FFFF, 0, 32), Some(31));
    }

    #[test]
    fn cmd_fis_layout() {
        let lba = 0x0123_4567_89AB_u64;
        let fis = build_cmd_fis(ATA_CMD_READ_DMA_EXT, lba, 0x1234, DEVICE_LBA_MODE);

        assert_eq!(fis[0], FIS_TYPE_REG_H2D);
        assert_eq!(fis[1], 0x80);
        assert_eq!(fis[2], 0x25);
        // 48-bit LBA split across six bytes.
        assert_eq!(fis[4], 0xAB);
        assert_eq!(fis[5], 0x89);
        assert_eq!(fis[6], 0x67);
        assert_eq!(fis[8], 0x45);
        assert_eq!(fis[9], 0x23);
        assert_eq!(fis[10], 0x01);
        // Device register selects LBA mode.
        assert_eq!(fis[7], 0x40);
        // 16-bit sector count.
        assert_eq!(fis[12], 0x34);
        assert_eq!(fis[13], 0x12);
    }

    #[test]
    fn identify_fis_is_plain() {
        let fis = build_cmd_fis(ATA_CMD_IDENTIFY, 0, 0, 0);
        assert_eq!(fis[2], 0xEC);
        assert_eq!(fis[7], 0);
        assert_eq!(&fis[4..7], &[0, 0, 0]);
        assert_eq!(&fis[12..14], &[0, 0]);
    }

    #[test]
    fn prdt_split_at_4mib() {
        let ranges = prdt_ranges(0x10_0000, 4096);
        assert_eq!(ranges, alloc::vec![(0x10_0000, 4096)]);

        let ranges = prdt_ranges(0x10_0000, PRDT_MAX_BYTES);
        assert_eq!(ranges.len(), 1);

        let ranges = prdt_ranges(0x10_0000, PRDT_MAX_BYTES + 1);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], (0x10_0000, PRDT_MAX_BYTES));
        assert_eq!(
            ranges[1],
            (0x10_0000 + PRDT_MAX_BYTES as u64, 1)
        );
    }

    #[test]
    fn table_fits_one_page() {
        assert_eq!(core::mem::size_of::<CmdHeader>(), 32);
        assert_eq!(core::mem::size_of::<PrdtEntry>(), 16);
        assert!(core::mem::size_of::<CmdTable>() <= PAGE_SIZE);
        // The bounce buffer always fits the PRDT.
        assert!(BOUNCE_PAGES * PAGE_SIZE <= PRDT_PER_TABLE * PRDT_MAX_BYTES);
    }

    /// Build a mock IDENTIFY block the way a drive reports it: strings
    /// byte-swapped within each word, counts little-endian.
    fn mock_identify(model: &str, serial: &str, lba48: u64, lba28: u32) -> [u8; 512] {
        let mut data = [0u8; 512];
        let put_string = |data: &mut [u8; 512], first_word: usize, words: usize, s: &str| {
            let mut padded = alloc::string::String::from(s);
            while padded.len() < words * 2 {
                padded.push(' ');
            }
            let bytes = padded.as_bytes();
            for w in 0..words {
                data[(first_word + w) * 2] = bytes[w * 2 + 1];
                data[(first_word + w) * 2 + 1] = bytes[w * 2];
            }
        };
        put_string(&mut data, 27, 20, model);
        put_string(&mut data, 10, 10, serial);
        data[200..208].copy_from_slice(&lba48.to_le_bytes());
        data[120..124].copy_from_slice(&lba28.to_le_bytes());
        data
    }

    #[test]
    fn identify_parse_model_and_serial() {
        let data = mock_identify("QEMU HARDDISK", "QM00001", 0x10_0000, 0xFFFF);
        let info = parse_identify(&data);
        assert_eq!(info.model, "QEMU HARDDISK");
        assert_eq!(info.serial, "QM00001");
        assert_eq!(info.sectors, 0x10_0000);
    }

    #[test]
    fn identify_falls_back_to_28bit() {
        let data = mock_identify("OLD DISK", "S123", 0, 0x8000);
        let info = parse_identify(&data);
        assert_eq!(info.sectors, 0x8000);
    }

    #[test]
    fn signatures_map_to_kinds() {
        assert_eq!(DeviceKind::from_signature(SIG_SATA), DeviceKind::Sata);
        assert_eq!(DeviceKind::from_signature(SIG_ATAPI), DeviceKind::Satapi);
        assert_eq!(DeviceKind::from_signature(SIG_SEMB), DeviceKind::Semb);
        assert_eq!(
            DeviceKind::from_signature(SIG_PM),
            DeviceKind::PortMultiplier
        );
        assert_eq!(DeviceKind::from_signature(0xDEAD_BEEF), DeviceKind::Other);
    }

    #[test]
    fn error_mapping_to_block_layer() {
        assert_eq!(BlockError::from(AhciError::Timeout), BlockError::Timeout);
        assert_eq!(
            BlockError::from(AhciError::NoDevice),
            BlockError::DeviceNotReady
        );
        assert_eq!(BlockError::from(AhciError::TaskFile), BlockError::Io);
        assert_eq!(
            BlockError::from(AhciError::Unsupported),
            BlockError::InvalidArgument
        );
    }
}
