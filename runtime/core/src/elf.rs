//! ELF import: understanding executable boot modules
//!
//! The loader that spawns child components needs the class, machine,
//! entry point, and loadable segments of an ELF module. Header and
//! program-header decoding is goblin's job; on top of it, modules whose
//! class or machine does not match the target PD are rejected, as are
//! overlapping segment layouts.

use bitflags::bitflags;
use goblin::elf::{program_header, Elf};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    #[error("not an ELF image")]
    BadMagic,

    #[error("malformed ELF image")]
    Malformed,

    #[error("ELF class or machine does not match the target")]
    WrongTarget,

    #[error("loadable segments overlap")]
    OverlappingSegments,

    #[error("segment sizes are inconsistent")]
    BadSegment,
}

impl From<goblin::error::Error> for ElfError {
    fn from(error: goblin::error::Error) -> Self {
        match error {
            goblin::error::Error::BadMagic(_) => ElfError::BadMagic,
            _ => ElfError::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

bitflags! {
    /// Segment permissions as encoded in `p_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC  = program_header::PF_X;
        const WRITE = program_header::PF_W;
        const READ  = program_header::PF_R;
    }
}

/// One PT_LOAD program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: SegmentFlags,
}

#[derive(Debug, Clone)]
pub struct ElfBinary {
    pub class: ElfClass,
    pub machine: u16,
    pub entry: u64,
    pub segments: Vec<LoadSegment>,
}

impl ElfBinary {
    /// Parse headers and loadable segments out of an image
    pub fn parse(image: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(image)?;

        let mut segments = Vec::new();
        for ph in &elf.program_headers {
            if ph.p_type != program_header::PT_LOAD {
                continue;
            }
            if ph.p_filesz > ph.p_memsz {
                return Err(ElfError::BadSegment);
            }
            segments.push(LoadSegment {
                vaddr: ph.p_vaddr,
                file_offset: ph.p_offset,
                file_size: ph.p_filesz,
                mem_size: ph.p_memsz,
                flags: SegmentFlags::from_bits_truncate(ph.p_flags),
            });
        }

        let binary = Self {
            class: if elf.is_64 {
                ElfClass::Elf64
            } else {
                ElfClass::Elf32
            },
            machine: elf.header.e_machine,
            entry: elf.entry,
            segments,
        };
        binary.check_layout()?;
        Ok(binary)
    }

    /// Reject the binary unless it matches the target PD's class/machine
    pub fn check_target(&self, class: ElfClass, machine: u16) -> Result<(), ElfError> {
        if self.class != class || self.machine != machine {
            return Err(ElfError::WrongTarget);
        }
        Ok(())
    }

    fn check_layout(&self) -> Result<(), ElfError> {
        let mut spans: Vec<(u64, u64)> = self
            .segments
            .iter()
            .filter(|s| s.mem_size > 0)
            .map(|s| (s.vaddr, s.vaddr.saturating_add(s.mem_size)))
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(ElfError::OverlappingSegments);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    use super::*;

    /// Build a minimal ELF64 image with the given PT_LOAD segments
    pub fn elf64(
        machine: u16,
        entry: u64,
        segments: &[(u64, &[u8], u64, SegmentFlags)],
    ) -> Vec<u8> {
        let phoff = 0x40usize;
        let phentsize = 0x38usize;
        let data_start = phoff + segments.len() * phentsize;

        let mut image = vec![0u8; data_start];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        image[0x12..0x14].copy_from_slice(&machine.to_le_bytes());
        image[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        image[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
        image[0x20..0x28].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[0x36..0x38].copy_from_slice(&(phentsize as u16).to_le_bytes());
        image[0x38..0x3a].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        let mut file_offset = data_start as u64;
        for (index, (vaddr, bytes, mem_size, flags)) in segments.iter().enumerate() {
            let at = phoff + index * phentsize;
            image[at..at + 4].copy_from_slice(&program_header::PT_LOAD.to_le_bytes());
            image[at + 4..at + 8].copy_from_slice(&flags.bits().to_le_bytes());
            image[at + 8..at + 16].copy_from_slice(&file_offset.to_le_bytes());
            image[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
            image[at + 32..at + 40].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
            image[at + 40..at + 48].copy_from_slice(&mem_size.to_le_bytes());
            file_offset += bytes.len() as u64;
        }
        for (_, bytes, _, _) in segments {
            image.extend_from_slice(bytes);
        }
        image
    }
}
