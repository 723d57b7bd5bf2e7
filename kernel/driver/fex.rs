//! Fex binary format
//!
//! The in-house module format: a small header at offset 0 and, for
//! driver modules, an extended header at a fixed offset carrying the
//! driver's name, type, bind descriptor and callback.
//!
//! Layout (little-endian, packed):
//!
//! ```text
//! 0x00  magic[4] = "FEX\0"
//! 0x04  format type (u8)
//! 0x05  os type (u8)
//! 0x06  pointer (u64)   entry point or format-specific
//! 0x0E  callback (u64)
//! ...
//! 0x80  extended header (driver modules):
//!   +0    name[64]
//!   +64   driver type (u8)
//!   +65   type name[16]
//!   +81   bind type (u8)
//!   +82   bind payload[96]
//!   +178  callback (u64)
//! ```

use alloc::string::String;

use crate::error::{KernelError, KernelResult};

/// Header magic
pub const FEX_MAGIC: [u8; 4] = *b"FEX\0";

/// Offset of the extended driver header
pub const EXTENDED_SECTION_ADDRESS: usize = 0x80;

const EXT_NAME: usize = 0;
const EXT_NAME_LEN: usize = 64;
const EXT_TYPE: usize = 64;
const EXT_TYPE_NAME: usize = 65;
const EXT_TYPE_NAME_LEN: usize = 16;
const EXT_BIND_TYPE: usize = 81;
const EXT_BIND_PAYLOAD: usize = 82;
const EXT_BIND_PAYLOAD_LEN: usize = 96;
const EXT_CALLBACK: usize = 178;

/// Total extended header length
pub const EXTENDED_HEADER_LEN: usize = EXT_CALLBACK + 8;

/// Vectors carried by an interrupt bind
pub const BIND_VECTORS: usize = 16;

/// What the image as a whole is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FexFormatType {
    Unknown = 0,
    Executable = 1,
    Module = 2,
    Driver = 3,
}

impl FexFormatType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Executable,
            2 => Self::Module,
            3 => Self::Driver,
            _ => Self::Unknown,
        }
    }
}

/// Target OS personality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FexOsType {
    Unknown = 0,
    Native = 1,
}

impl FexOsType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Native,
            _ => Self::Unknown,
        }
    }
}

/// Driver categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FexDriverType {
    Generic = 1,
    Display = 2,
    Network = 3,
    Storage = 4,
    FileSystem = 5,
    Input = 6,
    Audio = 7,
}

impl FexDriverType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Generic),
            2 => Some(Self::Display),
            3 => Some(Self::Network),
            4 => Some(Self::Storage),
            5 => Some(Self::FileSystem),
            6 => Some(Self::Input),
            7 => Some(Self::Audio),
            _ => None,
        }
    }
}

/// PCI bind descriptor: match lists are zero-terminated
#[derive(Debug, Clone, Copy)]
pub struct FexPciBind {
    pub vendor_ids: [u16; BIND_VECTORS],
    pub device_ids: [u16; BIND_VECTORS],
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

/// Interrupt bind descriptor: raw IRQ numbers, zero-terminated
#[derive(Debug, Clone, Copy)]
pub struct FexInterruptBind {
    pub vectors: [u16; BIND_VECTORS],
}

impl FexInterruptBind {
    /// The declared vectors up to the first zero
    pub fn active(&self) -> impl Iterator<Item = u16> + '_ {
        self.vectors.iter().copied().take_while(|&v| v != 0)
    }
}

/// How a driver attaches to the system
#[derive(Debug, Clone, Copy)]
pub enum FexBind {
    Pci(FexPciBind),
    Interrupt(FexInterruptBind),
    Input { report_rate: u16 },
    Process { priority: u8 },
}

/// Base Fex header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FexHeader {
    pub format: FexFormatType,
    pub os: FexOsType,
    /// Entry point offset (or format-specific pointer)
    pub pointer: u64,
    pub callback: u64,
}

impl FexHeader {
    /// Whether `data` starts with the Fex magic
    pub fn is_fex(data: &[u8]) -> bool {
        data.len() >= 4 && data[0..4] == FEX_MAGIC
    }

    /// Parse the base header
    pub fn parse(data: &[u8]) -> KernelResult<Self> {
        if data.len() < 0x16 {
            return Err(KernelError::InvalidFileHeader);
        }
        if data[0..4] != FEX_MAGIC {
            return Err(KernelError::InvalidFileHeader);
        }

        Ok(Self {
            format: FexFormatType::from_u8(data[4]),
            os: FexOsType::from_u8(data[5]),
            pointer: u64::from_le_bytes(data[6..14].try_into().unwrap()),
            callback: u64::from_le_bytes(data[14..22].try_into().unwrap()),
        })
    }
}

/// Extended driver header
#[derive(Debug, Clone)]
pub struct FexExtended {
    pub name: String,
    pub driver_type: FexDriverType,
    pub type_name: String,
    pub bind: FexBind,
    /// Driver callback offset within the image
    pub callback: u64,
}

fn fixed_str(field: &[u8]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from(core::str::from_utf8(&field[..len]).unwrap_or(""))
}

impl FexExtended {
    /// Parse the extended header at [`EXTENDED_SECTION_ADDRESS`]
    pub fn parse(data: &[u8]) -> KernelResult<Self> {
        Self::parse_at(data, EXTENDED_SECTION_ADDRESS)
    }

    /// Parse an extended header at an arbitrary offset
    ///
    /// ELF driver modules carry theirs in a named section rather than
    /// at the fixed Fex offset.
    pub fn parse_at(data: &[u8], base: usize) -> KernelResult<Self> {
        let ext = data
            .get(base..base + EXTENDED_HEADER_LEN)
            .ok_or(KernelError::InvalidFileHeader)?;

        let driver_type = FexDriverType::from_u8(ext[EXT_TYPE])
            .ok_or(KernelError::InvalidFileHeader)?;

        let payload = &ext[EXT_BIND_PAYLOAD..EXT_BIND_PAYLOAD + EXT_BIND_PAYLOAD_LEN];
        let bind = match ext[EXT_BIND_TYPE] {
            1 => {
                let mut vendor_ids = [0u16; BIND_VECTORS];
                let mut device_ids = [0u16; BIND_VECTORS];
                for i in 0..BIND_VECTORS {
                    vendor_ids[i] =
                        u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
                    device_ids[i] =
                        u16::from_le_bytes([payload[32 + i * 2], payload[32 + i * 2 + 1]]);
                }
                FexBind::Pci(FexPciBind {
                    vendor_ids,
                    device_ids,
                    class: payload[64],
                    subclass: payload[65],
                    prog_if: payload[66],
                })
            }
            2 => {
                let mut vectors = [0u16; BIND_VECTORS];
                for i in 0..BIND_VECTORS {
                    vectors[i] = u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
                }
                FexBind::Interrupt(FexInterruptBind { vectors })
            }
            3 => FexBind::Input {
                report_rate: u16::from_le_bytes([payload[0], payload[1]]),
            },
            4 => FexBind::Process {
                priority: payload[0],
            },
            _ => return Err(KernelError::InvalidFileHeader),
        };

        Ok(Self {
            name: fixed_str(&ext[EXT_NAME..EXT_NAME + EXT_NAME_LEN]),
            driver_type,
            type_name: fixed_str(&ext[EXT_TYPE_NAME..EXT_TYPE_NAME + EXT_TYPE_NAME_LEN]),
            bind,
            callback: u64::from_le_bytes(ext[EXT_CALLBACK..EXT_CALLBACK + 8].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Build a driver image with the given headers and trailing body
    pub(crate) fn driver_image(
        driver_type: FexDriverType,
        bind_type: u8,
        bind_payload: &[u8],
        entry: u64,
        callback: u64,
        body_len: usize,
    ) -> Vec<u8> {
        let mut out = alloc::vec![0u8; (EXTENDED_SECTION_ADDRESS + EXTENDED_HEADER_LEN + body_len).max(512)];
        out[0..4].copy_from_slice(&FEX_MAGIC);
        out[4] = FexFormatType::Driver as u8;
        out[5] = FexOsType::Native as u8;
        out[6..14].copy_from_slice(&entry.to_le_bytes());
        out[14..22].copy_from_slice(&callback.to_le_bytes());

        let ext = EXTENDED_SECTION_ADDRESS;
        out[ext..ext + 7].copy_from_slice(b"testdrv");
        out[ext + EXT_TYPE] = driver_type as u8;
        out[ext + EXT_TYPE_NAME..ext + EXT_TYPE_NAME + 4].copy_from_slice(b"test");
        out[ext + EXT_BIND_TYPE] = bind_type;
        out[ext + EXT_BIND_PAYLOAD..ext + EXT_BIND_PAYLOAD + bind_payload.len()]
            .copy_from_slice(bind_payload);
        out[ext + EXT_CALLBACK..ext + EXT_CALLBACK + 8].copy_from_slice(&callback.to_le_bytes());
        out
    }

    #[test]
    fn test_base_header_roundtrip() {
        let image = driver_image(FexDriverType::Generic, 2, &[], 0x1234, 0x5678, 0);
        assert!(FexHeader::is_fex(&image));

        let header = FexHeader::parse(&image).unwrap();
        assert_eq!(header.format, FexFormatType::Driver);
        assert_eq!(header.os, FexOsType::Native);
        assert_eq!(header.pointer, 0x1234);
        assert_eq!(header.callback, 0x5678);
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(!FexHeader::is_fex(b"ELF!"));
        assert_eq!(
            FexHeader::parse(&[0u8; 64]),
            Err(KernelError::InvalidFileHeader)
        );
    }

    #[test]
    fn test_interrupt_bind_zero_terminated() {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&1u16.to_le_bytes());
        payload[2..4].copy_from_slice(&12u16.to_le_bytes());
        // vector[2] = 0 terminates

        let image = driver_image(FexDriverType::Input, 2, &payload, 0x40, 0x80, 0);
        let ext = FexExtended::parse(&image).unwrap();
        assert_eq!(ext.name, "testdrv");
        assert_eq!(ext.driver_type, FexDriverType::Input);

        let FexBind::Interrupt(bind) = ext.bind else {
            panic!("expected interrupt bind");
        };
        let active: Vec<u16> = bind.active().collect();
        assert_eq!(active, alloc::vec![1, 12]);
    }

    #[test]
    fn test_pci_bind_fields() {
        let mut payload = [0u8; 96];
        payload[0..2].copy_from_slice(&0x8086u16.to_le_bytes());
        payload[32..34].copy_from_slice(&0x100Eu16.to_le_bytes());
        payload[64] = 0x02; // network class
        payload[65] = 0x00;
        payload[66] = 0x00;

        let image = driver_image(FexDriverType::Network, 1, &payload, 0, 0, 0);
        let ext = FexExtended::parse(&image).unwrap();
        let FexBind::Pci(bind) = ext.bind else {
            panic!("expected pci bind");
        };
        assert_eq!(bind.vendor_ids[0], 0x8086);
        assert_eq!(bind.device_ids[0], 0x100E);
        assert_eq!(bind.class, 0x02);
    }

    #[test]
    fn test_unknown_bind_type_rejected() {
        let image = driver_image(FexDriverType::Generic, 9, &[], 0, 0, 0);
        assert!(FexExtended::parse(&image).is_err());
    }
}
