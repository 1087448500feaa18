//! Artifact ABI pre-flight
//!
//! Reads the object header of a library file (ELF, Mach-O or PE) and compares
//! it against the running process before the platform loader maps it, so a
//! wrong-architecture artifact is reported without running any of its code.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Bytes read from the start of a file; large enough for any PE header offset
/// produced by common linkers.
const HEADER_READ_LEN: u64 = 4096;

/// Object file container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectFormat {
    Elf,
    MachO,
    Pe,
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectFormat::Elf => write!(f, "elf"),
            ObjectFormat::MachO => write!(f, "mach-o"),
            ObjectFormat::Pe => write!(f, "pe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

/// Instruction set, normalized across container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    X86,
    X86_64,
    Arm,
    Aarch64,
    RiscV,
    PowerPc,
    PowerPc64,
    Mips,
    S390x,
    LoongArch,
    /// Raw machine code not in the table above
    Other(u32),
}

impl Machine {
    fn from_elf(code: u16) -> Self {
        match code {
            3 => Machine::X86,
            62 => Machine::X86_64,
            40 => Machine::Arm,
            183 => Machine::Aarch64,
            243 => Machine::RiscV,
            20 => Machine::PowerPc,
            21 => Machine::PowerPc64,
            8 => Machine::Mips,
            22 => Machine::S390x,
            258 => Machine::LoongArch,
            other => Machine::Other(u32::from(other)),
        }
    }

    fn from_macho(cputype: u32) -> Self {
        match cputype {
            0x0000_0007 => Machine::X86,
            0x0100_0007 => Machine::X86_64,
            0x0000_000c => Machine::Arm,
            0x0100_000c => Machine::Aarch64,
            0x0000_0012 => Machine::PowerPc,
            0x0100_0012 => Machine::PowerPc64,
            other => Machine::Other(other),
        }
    }

    fn from_pe(code: u16) -> Self {
        match code {
            0x014c => Machine::X86,
            0x8664 => Machine::X86_64,
            0x01c0 | 0x01c2 | 0x01c4 => Machine::Arm,
            0xaa64 => Machine::Aarch64,
            0x5032 | 0x5064 => Machine::RiscV,
            other => Machine::Other(u32::from(other)),
        }
    }

    /// Machine of the running process, or `None` for targets not in the table
    fn host() -> Option<Self> {
        if cfg!(target_arch = "x86") {
            Some(Machine::X86)
        } else if cfg!(target_arch = "x86_64") {
            Some(Machine::X86_64)
        } else if cfg!(target_arch = "arm") {
            Some(Machine::Arm)
        } else if cfg!(target_arch = "aarch64") {
            Some(Machine::Aarch64)
        } else if cfg!(any(target_arch = "riscv32", target_arch = "riscv64")) {
            Some(Machine::RiscV)
        } else if cfg!(target_arch = "powerpc") {
            Some(Machine::PowerPc)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Machine::PowerPc64)
        } else if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            Some(Machine::Mips)
        } else if cfg!(target_arch = "s390x") {
            Some(Machine::S390x)
        } else if cfg!(target_arch = "loongarch64") {
            Some(Machine::LoongArch)
        } else {
            None
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::X86 => write!(f, "x86"),
            Machine::X86_64 => write!(f, "x86_64"),
            Machine::Arm => write!(f, "arm"),
            Machine::Aarch64 => write!(f, "aarch64"),
            Machine::RiscV => write!(f, "riscv"),
            Machine::PowerPc => write!(f, "powerpc"),
            Machine::PowerPc64 => write!(f, "powerpc64"),
            Machine::Mips => write!(f, "mips"),
            Machine::S390x => write!(f, "s390x"),
            Machine::LoongArch => write!(f, "loongarch"),
            Machine::Other(code) => write!(f, "machine {:#x}", code),
        }
    }
}

/// ABI facts read from an object header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactAbi {
    pub format: ObjectFormat,
    /// Word size in bits (32 or 64)
    pub bits: u8,
    pub endian: Endian,
    pub machine: Machine,
}

impl fmt::Display for ArtifactAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endian = match self.endian {
            Endian::Little => "le",
            Endian::Big => "be",
        };
        write!(f, "{}{}-{} {}", self.format, self.bits, endian, self.machine)
    }
}

/// Why an artifact cannot be loaded into this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incompatibility {
    pub expected: String,
    pub found: String,
}

/// Description of the running process ("elf64-le x86_64")
pub fn host_description() -> String {
    match host_machine_abi() {
        Some(abi) => abi.to_string(),
        None => format!(
            "{}{}-{} {}",
            host_format(),
            host_bits(),
            if cfg!(target_endian = "big") { "be" } else { "le" },
            std::env::consts::ARCH
        ),
    }
}

fn host_format() -> ObjectFormat {
    if cfg!(target_os = "windows") {
        ObjectFormat::Pe
    } else if cfg!(target_vendor = "apple") {
        ObjectFormat::MachO
    } else {
        ObjectFormat::Elf
    }
}

fn host_bits() -> u8 {
    if cfg!(target_pointer_width = "64") {
        64
    } else {
        32
    }
}

fn host_endian() -> Endian {
    if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    }
}

fn host_machine_abi() -> Option<ArtifactAbi> {
    Machine::host().map(|machine| ArtifactAbi {
        format: host_format(),
        bits: host_bits(),
        endian: host_endian(),
        machine,
    })
}

/// Parse the ABI out of the first bytes of an object file
///
/// Returns `None` for unrecognised or universal (fat) containers.
pub fn inspect(header: &[u8]) -> Option<ArtifactAbi> {
    if header.starts_with(b"\x7fELF") {
        return inspect_elf(header);
    }
    if header.starts_with(b"MZ") {
        return inspect_pe(header);
    }
    inspect_macho(header)
}

fn inspect_elf(header: &[u8]) -> Option<ArtifactAbi> {
    if header.len() < 20 {
        return None;
    }
    let bits = match header[4] {
        1 => 32,
        2 => 64,
        _ => return None,
    };
    let endian = match header[5] {
        1 => Endian::Little,
        2 => Endian::Big,
        _ => return None,
    };
    let raw = [header[18], header[19]];
    let machine = match endian {
        Endian::Little => u16::from_le_bytes(raw),
        Endian::Big => u16::from_be_bytes(raw),
    };
    Some(ArtifactAbi {
        format: ObjectFormat::Elf,
        bits,
        endian,
        machine: Machine::from_elf(machine),
    })
}

fn inspect_macho(header: &[u8]) -> Option<ArtifactAbi> {
    if header.len() < 8 {
        return None;
    }
    let magic = [header[0], header[1], header[2], header[3]];
    let cpu = [header[4], header[5], header[6], header[7]];
    let (bits, endian) = match u32::from_le_bytes(magic) {
        0xfeed_face => (32, Endian::Little),
        0xfeed_facf => (64, Endian::Little),
        _ => match u32::from_be_bytes(magic) {
            0xfeed_face => (32, Endian::Big),
            0xfeed_facf => (64, Endian::Big),
            _ => return None,
        },
    };
    let cputype = match endian {
        Endian::Little => u32::from_le_bytes(cpu),
        Endian::Big => u32::from_be_bytes(cpu),
    };
    Some(ArtifactAbi {
        format: ObjectFormat::MachO,
        bits,
        endian,
        machine: Machine::from_macho(cputype),
    })
}

fn inspect_pe(header: &[u8]) -> Option<ArtifactAbi> {
    let lfanew = usize::try_from(read_u32_le(header, 0x3c)?).ok()?;
    if header.get(lfanew..lfanew.checked_add(4)?)? != b"PE\0\0" {
        return None;
    }
    let machine = Machine::from_pe(read_u16_le(header, lfanew.checked_add(4)?)?);
    let bits = match read_u16_le(header, lfanew.checked_add(24)?) {
        Some(0x10b) => 32,
        Some(0x20b) => 64,
        _ => match machine {
            Machine::X86_64 | Machine::Aarch64 => 64,
            _ => 32,
        },
    };
    Some(ArtifactAbi {
        format: ObjectFormat::Pe,
        bits,
        endian: Endian::Little,
        machine,
    })
}

fn read_u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Read and parse the header of the file at `path`
pub fn read_artifact(path: &Path) -> io::Result<Option<ArtifactAbi>> {
    let mut header = Vec::new();
    File::open(path)?
        .take(HEADER_READ_LEN)
        .read_to_end(&mut header)?;
    Ok(inspect(&header))
}

/// Compare an artifact against the running process
///
/// Fields the host table cannot describe (an unknown `target_arch`) are not
/// compared.
pub fn check_compatible(found: &ArtifactAbi) -> Result<(), Incompatibility> {
    let host_format = host_format();
    let host_bits = host_bits();
    let host_endian = host_endian();

    let mut compatible =
        found.format == host_format && found.bits == host_bits && found.endian == host_endian;
    if let Some(machine) = Machine::host() {
        compatible &= found.machine == machine;
    }

    if compatible {
        Ok(())
    } else {
        Err(Incompatibility {
            expected: host_description(),
            found: found.to_string(),
        })
    }
}

/// Pre-flight the file at `path`
///
/// Files that cannot be read or parsed pass; the platform loader reports them.
pub fn preflight(path: &Path) -> Result<Option<ArtifactAbi>, Incompatibility> {
    match read_artifact(path) {
        Ok(Some(abi)) => check_compatible(&abi).map(|()| Some(abi)),
        Ok(None) | Err(_) => Ok(None),
    }
}

/// Build a minimal ELF header for tests
#[cfg(test)]
pub(crate) fn elf_header(bits: u8, endian: Endian, machine: u16) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = if bits == 64 { 2 } else { 1 };
    header[5] = match endian {
        Endian::Little => 1,
        Endian::Big => 2,
    };
    header[6] = 1;
    // ET_DYN
    header[16] = 3;
    let raw = match endian {
        Endian::Little => machine.to_le_bytes(),
        Endian::Big => machine.to_be_bytes(),
    };
    header[18..20].copy_from_slice(&raw);
    header
}

/// ELF `e_machine` of the running process, if it has one in the table
#[cfg(test)]
pub(crate) fn host_elf_machine() -> Option<u16> {
    match Machine::host()? {
        Machine::X86 => Some(3),
        Machine::X86_64 => Some(62),
        Machine::Arm => Some(40),
        Machine::Aarch64 => Some(183),
        Machine::RiscV => Some(243),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(62, Machine::X86_64)]
    #[case(183, Machine::Aarch64)]
    #[case(3, Machine::X86)]
    #[case(40, Machine::Arm)]
    #[case(243, Machine::RiscV)]
    #[case(0x1234, Machine::Other(0x1234))]
    fn test_inspect_elf_machine(#[case] code: u16, #[case] expected: Machine) {
        let abi = inspect(&elf_header(64, Endian::Little, code)).unwrap();
        assert_eq!(abi.format, ObjectFormat::Elf);
        assert_eq!(abi.bits, 64);
        assert_eq!(abi.machine, expected);
    }

    #[test]
    fn test_inspect_elf_big_endian() {
        let abi = inspect(&elf_header(32, Endian::Big, 8)).unwrap();
        assert_eq!(abi.bits, 32);
        assert_eq!(abi.endian, Endian::Big);
        assert_eq!(abi.machine, Machine::Mips);
    }

    #[test]
    fn test_inspect_truncated_elf() {
        assert_eq!(inspect(b"\x7fELF\x02\x01"), None);
    }

    #[test]
    fn test_inspect_macho_arm64() {
        let mut header = Vec::new();
        header.extend_from_slice(&0xfeed_facfu32.to_le_bytes());
        header.extend_from_slice(&0x0100_000cu32.to_le_bytes());
        let abi = inspect(&header).unwrap();
        assert_eq!(abi.format, ObjectFormat::MachO);
        assert_eq!(abi.bits, 64);
        assert_eq!(abi.machine, Machine::Aarch64);
    }

    #[test]
    fn test_inspect_fat_macho_is_skipped() {
        let header = [0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 2];
        assert_eq!(inspect(&header), None);
    }

    #[test]
    fn test_inspect_pe_x64() {
        let mut header = vec![0u8; 0x100];
        header[..2].copy_from_slice(b"MZ");
        header[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        header[0x80..0x84].copy_from_slice(b"PE\0\0");
        header[0x84..0x86].copy_from_slice(&0x8664u16.to_le_bytes());
        header[0x98..0x9a].copy_from_slice(&0x20bu16.to_le_bytes());
        let abi = inspect(&header).unwrap();
        assert_eq!(abi.format, ObjectFormat::Pe);
        assert_eq!(abi.bits, 64);
        assert_eq!(abi.machine, Machine::X86_64);
    }

    #[test]
    fn test_inspect_pe_with_bad_offset() {
        let mut header = vec![0u8; 0x40];
        header[..2].copy_from_slice(b"MZ");
        header[0x3c..0x40].copy_from_slice(&0xffff_0000u32.to_le_bytes());
        assert_eq!(inspect(&header), None);
    }

    #[test]
    fn test_offsets_at_end_of_address_space() {
        let header = [0u8; 8];
        assert_eq!(read_u16_le(&header, usize::MAX - 1), None);
        assert_eq!(read_u32_le(&header, usize::MAX - 2), None);
        assert_eq!(read_u16_le(&header, 6), Some(0));
    }

    #[test]
    fn test_inspect_text_file() {
        assert_eq!(inspect(b"/* GNU ld script */"), None);
    }

    #[test]
    fn test_wrong_word_size_is_incompatible() {
        let found = ArtifactAbi {
            format: host_format(),
            bits: if host_bits() == 64 { 32 } else { 64 },
            endian: host_endian(),
            machine: Machine::host().unwrap_or(Machine::Other(0)),
        };
        let err = check_compatible(&found).unwrap_err();
        assert_eq!(err.expected, host_description());
        assert_eq!(err.found, found.to_string());
    }

    #[test]
    fn test_foreign_format_is_incompatible() {
        let format = match host_format() {
            ObjectFormat::Elf => ObjectFormat::Pe,
            _ => ObjectFormat::Elf,
        };
        let found = ArtifactAbi {
            format,
            bits: host_bits(),
            endian: host_endian(),
            machine: Machine::X86_64,
        };
        assert!(check_compatible(&found).is_err());
    }

    #[test]
    fn test_host_abi_is_compatible() {
        if let Some(host) = host_machine_abi() {
            assert_eq!(check_compatible(&host), Ok(()));
        }
    }

    #[test]
    fn test_display() {
        let abi = ArtifactAbi {
            format: ObjectFormat::Elf,
            bits: 64,
            endian: Endian::Little,
            machine: Machine::X86_64,
        };
        assert_eq!(abi.to_string(), "elf64-le x86_64");
    }

    #[test]
    fn test_preflight_missing_file_passes() {
        let result = preflight(Path::new("/nonexistent/libnothing.so"));
        assert_eq!(result, Ok(None));
    }
}
