//! PCI configuration-space access
//!
//! Just enough of the PCI bus to locate and switch on storage
//! controllers: configuration reads and writes over the standard
//! port pair, a brute-force scan, BAR decoding, and the command-word
//! enables a DMA-capable device needs.
//!
//! The address written to CONFIG_ADDRESS is:
//! ```text
//! Bit 31    : Enable bit (must be 1)
//! Bits 23-16: Bus number (0-255)
//! Bits 15-11: Device number (0-31)
//! Bits 10-8 : Function number (0-7)
//! Bits 7-2  : Register offset (32-bit aligned)
//! ```

use alloc::vec::Vec;
use core::fmt;
use x86_64::instructions::port::Port;

/// PCI configuration address port
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
const CONFIG_DATA: u16 = 0xCFC;

/// Mass storage class code
pub const CLASS_MASS_STORAGE: u8 = 0x01;
/// SATA controller subclass
pub const SUBCLASS_SATA: u8 = 0x06;
/// AHCI 1.0 programming interface
pub const PROG_IF_AHCI: u8 = 0x01;

/// Location and identity of one PCI function.
#[derive(Clone)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    /// Decoded memory BAR physical addresses; zero when absent or I/O.
    pub bars: [u64; 6],
}

impl Device {
    /// Whether this function is an AHCI SATA controller.
    pub fn is_ahci(&self) -> bool {
        self.class == CLASS_MASS_STORAGE
            && self.subclass == SUBCLASS_SATA
            && self.prog_if == PROG_IF_AHCI
    }

    /// The AHCI base address register (ABAR).
    pub fn abar(&self) -> u64 {
        self.bars[5]
    }

    /// Enable bus mastering so the device can issue DMA.
    pub fn enable_bus_master(&self) {
        let command = config_read32(self.bus, self.device, self.function, 0x04);
        config_write32(self.bus, self.device, self.function, 0x04, command | 0x04);
    }

    /// Enable memory-space decoding for the device's MMIO BARs.
    pub fn enable_memory_space(&self) {
        let command = config_read32(self.bus, self.device, self.function, 0x04);
        config_write32(self.bus, self.device, self.function, 0x04, command | 0x02);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}/{:02x}/{:02x}",
            self.bus,
            self.device,
            self.function,
            self.vendor_id,
            self.device_id,
            self.class,
            self.subclass,
            self.prog_if
        )
    }
}

#[inline]
fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

/// Read a 32-bit value from configuration space.
fn config_read32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(config_address(bus, device, function, offset));
        data_port.read()
    }
}

/// Write a 32-bit value to configuration space.
fn config_write32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(config_address(bus, device, function, offset));
        data_port.write(value);
    }
}

/// Decode the six BARs of a function into memory physical addresses.
///
/// I/O BARs decode to zero. A 64-bit memory BAR consumes the following
/// slot for its high half.
fn decode_bars(bus: u8, device: u8, function: u8) -> [u64; 6] {
    let mut bars = [0u64; 6];
    let mut index = 0;
    while index < 6 {
        let offset = 0x10 + (index as u8) * 4;
        let raw = config_read32(bus, device, function, offset);
        if raw & 0x1 != 0 {
            // I/O space BAR; storage drivers here only use MMIO.
            index += 1;
            continue;
        }
        let is_64bit = (raw >> 1) & 0x3 == 0x2;
        let address = (raw & 0xFFFF_FFF0) as u64;
        if is_64bit && index + 1 < 6 {
            let high = config_read32(bus, device, function, offset + 4);
            bars[index] = address | ((high as u64) << 32);
            index += 2;
        } else {
            bars[index] = address;
            index += 1;
        }
    }
    bars
}

/// Probe one bus/device/function slot.
fn probe(bus: u8, device: u8, function: u8) -> Option<Device> {
    let vendor_device = config_read32(bus, device, function, 0x00);
    if vendor_device == 0xFFFF_FFFF {
        return None;
    }

    let class_reg = config_read32(bus, device, function, 0x08);
    Some(Device {
        bus,
        device,
        function,
        vendor_id: vendor_device as u16,
        device_id: (vendor_device >> 16) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
        bars: decode_bars(bus, device, function),
    })
}

/// Scan every bus for functions matching a class/subclass/prog-if
/// triplet.
pub fn find_by_class(class: u8, subclass: u8, prog_if: u8) -> Vec<Device> {
    let mut found = Vec::new();
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            let Some(first) = probe(bus, device, 0) else {
                continue;
            };
            let header = config_read32(bus, device, 0, 0x0C);
            let multifunction = (header >> 16) as u8 & 0x80 != 0;
            let functions = if multifunction { 8 } else { 1 };

            for function in 0..functions {
                let dev = if function == 0 {
                    Some(first.clone())
                } else {
                    probe(bus, device, function)
                };
                if let Some(dev) = dev {
                    if dev.class == class && dev.subclass == subclass && dev.prog_if == prog_if {
                        log::info!("PCI: found {}", dev);
                        found.push(dev);
                    }
                }
            }
        }
    }
    found
}

/// Locate every AHCI SATA controller on the bus.
pub fn find_ahci_controllers() -> Vec<Device> {
    find_by_class(CLASS_MASS_STORAGE, SUBCLASS_SATA, PROG_IF_AHCI)
}
