//! Multiboot v1 import: recovering the boot hand-over on x86
//!
//! The classical `mbi` record reports conventional/extended memory, a
//! memory map, and the boot-module list. Addresses inside the record
//! index into the physical memory image the bootloader left behind. The
//! module name is the basename of the command line, with leading path
//! components stripped.

use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::bootinfo::{BootInfo, BootModule, PhysRegion};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MultibootError {
    #[error("info record lies outside the memory image")]
    Truncated,

    #[error("info record reports no usable memory")]
    NoMemory,
}

/// `mbi` flag: `mem_lower`/`mem_upper` fields are valid
const MB_MEM: u32 = 1 << 0;
/// `mbi` flag: module fields are valid
const MB_MODS: u32 = 1 << 3;
/// `mbi` flag: memory-map fields are valid
const MB_MMAP: u32 = 1 << 6;

/// mmap entry type for usable RAM
const MMAP_TYPE_MEMORY: u32 = 1;

/// Fixed offsets within the `mbi` record
const MBI_FLAGS: usize = 0;
const MBI_MEM_LOWER: usize = 4;
const MBI_MEM_UPPER: usize = 8;
const MBI_MODS_COUNT: usize = 20;
const MBI_MODS_ADDR: usize = 24;
const MBI_MMAP_LENGTH: usize = 44;
const MBI_MMAP_ADDR: usize = 48;

/// One `mb_mod` entry: start, end, command line, padding
const MOD_ENTRY_SIZE: usize = 16;

const_assert_eq!(MBI_MMAP_ADDR + 4, 52);
const_assert_eq!(MOD_ENTRY_SIZE % 4, 0);

/// Parse a multiboot v1 info record at `mbi_offset` into the boot
/// hand-over structure
///
/// `memory` is the physical memory image; every address inside the
/// record indexes into it. Module content is copied out of the image.
pub fn parse(memory: &[u8], mbi_offset: usize) -> Result<BootInfo, MultibootError> {
    let flags = read_u32(memory, mbi_offset + MBI_FLAGS)?;

    let mut info = BootInfo::default();

    if flags & MB_MMAP != 0 {
        let mmap_length = read_u32(memory, mbi_offset + MBI_MMAP_LENGTH)? as usize;
        let mmap_addr = read_u32(memory, mbi_offset + MBI_MMAP_ADDR)? as usize;
        let mut at = mmap_addr;
        while at + 4 <= mmap_addr + mmap_length {
            // each entry leads with its own size, not counting the size
            // field itself
            let entry_size = read_u32(memory, at)? as usize;
            let base = read_u64(memory, at + 4)?;
            let length = read_u64(memory, at + 12)?;
            let kind = read_u32(memory, at + 20)?;
            if kind == MMAP_TYPE_MEMORY && length > 0 {
                info.ram.push(PhysRegion { base, size: length });
            }
            at += entry_size + 4;
        }
    } else if flags & MB_MEM != 0 {
        // conventional memory below 1M, extended memory above, in KiB
        let mem_lower = read_u32(memory, mbi_offset + MBI_MEM_LOWER)? as u64;
        let mem_upper = read_u32(memory, mbi_offset + MBI_MEM_UPPER)? as u64;
        if mem_lower > 0 {
            info.ram.push(PhysRegion {
                base: 0,
                size: mem_lower * 1024,
            });
        }
        if mem_upper > 0 {
            info.ram.push(PhysRegion {
                base: 0x10_0000,
                size: mem_upper * 1024,
            });
        }
    }

    if info.ram.is_empty() {
        return Err(MultibootError::NoMemory);
    }

    if flags & MB_MODS != 0 {
        let mods_count = read_u32(memory, mbi_offset + MBI_MODS_COUNT)? as usize;
        let mods_addr = read_u32(memory, mbi_offset + MBI_MODS_ADDR)? as usize;
        for index in 0..mods_count {
            let entry = mods_addr + index * MOD_ENTRY_SIZE;
            let start = read_u32(memory, entry)? as u64;
            let end = read_u32(memory, entry + 4)? as u64;
            let cmdline_addr = read_u32(memory, entry + 8)? as usize;
            if end < start {
                continue;
            }
            let cmdline = read_cstring(memory, cmdline_addr)?;
            let content = memory
                .get(start as usize..end as usize)
                .ok_or(MultibootError::Truncated)?
                .to_vec();
            info.modules.push(BootModule {
                name: basename(&cmdline).to_string(),
                base: start,
                size: end - start,
                cmdline,
                content,
            });
        }
    }

    Ok(info)
}

/// Strip directory components from a module command line
fn basename(cmdline: &str) -> &str {
    let name = cmdline.split_whitespace().next().unwrap_or(cmdline);
    name.rsplit('/').next().unwrap_or(name)
}

fn read_u32(memory: &[u8], offset: usize) -> Result<u32, MultibootError> {
    let bytes = memory
        .get(offset..offset + 4)
        .ok_or(MultibootError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(memory: &[u8], offset: usize) -> Result<u64, MultibootError> {
    let low = read_u32(memory, offset)? as u64;
    let high = read_u32(memory, offset + 4)? as u64;
    Ok(low | (high << 32))
}

fn read_cstring(memory: &[u8], offset: usize) -> Result<String, MultibootError> {
    let tail = memory.get(offset..).ok_or(MultibootError::Truncated)?;
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Image(Vec<u8>);

    impl Image {
        fn new(size: usize) -> Self {
            Self(vec![0; size])
        }

        fn put_u32(&mut self, offset: usize, value: u32) {
            self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u64(&mut self, offset: usize, value: u64) {
            self.0[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
            self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// An image with an mbi at 0x100, an mmap at 0x200, mods at 0x300,
    /// strings at 0x400, and module payloads from 0x1000
    fn sample_image() -> Image {
        let mut image = Image::new(0x2000);
        let mbi = 0x100;

        image.put_u32(mbi + MBI_FLAGS, MB_MEM | MB_MODS | MB_MMAP);
        image.put_u32(mbi + MBI_MEM_LOWER, 640);
        image.put_u32(mbi + MBI_MEM_UPPER, 31 * 1024);

        // two mmap entries: usable RAM and a reserved hole
        image.put_u32(mbi + MBI_MMAP_LENGTH, 2 * 24);
        image.put_u32(mbi + MBI_MMAP_ADDR, 0x200);
        image.put_u32(0x200, 20);
        image.put_u64(0x204, 0x10_0000);
        image.put_u64(0x20c, 0x1f0_0000);
        image.put_u32(0x214, MMAP_TYPE_MEMORY);
        image.put_u32(0x218, 20);
        image.put_u64(0x21c, 0xfec0_0000);
        image.put_u64(0x224, 0x1000);
        image.put_u32(0x22c, 2);

        // one module with a path-qualified command line
        image.put_u32(mbi + MBI_MODS_COUNT, 1);
        image.put_u32(mbi + MBI_MODS_ADDR, 0x300);
        image.put_u32(0x300, 0x1000);
        image.put_u32(0x304, 0x1007);
        image.put_u32(0x308, 0x400);
        image.put_bytes(0x400, b"/boot/grub/config args\0");
        image.put_bytes(0x1000, b"content");

        image
    }

    #[test]
    fn test_parse_ram_from_mmap() {
        let info = parse(&sample_image().0, 0x100).unwrap();
        assert_eq!(info.ram.len(), 1);
        assert_eq!(info.ram[0].base, 0x10_0000);
        assert_eq!(info.ram[0].size, 0x1f0_0000);
    }

    #[test]
    fn test_module_basename_and_content() {
        let info = parse(&sample_image().0, 0x100).unwrap();
        assert_eq!(info.modules.len(), 1);
        let module = &info.modules[0];
        assert_eq!(module.name, "config");
        assert_eq!(module.cmdline, "/boot/grub/config args");
        assert_eq!(module.content, b"content");
        assert_eq!(module.size, 7);
    }

    #[test]
    fn test_mem_fields_as_fallback() {
        let mut image = sample_image();
        image.put_u32(0x100 + MBI_FLAGS, MB_MEM);
        let info = parse(&image.0, 0x100).unwrap();
        assert_eq!(info.ram.len(), 2);
        assert_eq!(info.ram[0].size, 640 * 1024);
        assert_eq!(info.ram[1].base, 0x10_0000);
        assert_eq!(info.ram[1].size, 31 * 1024 * 1024);
    }

    #[test]
    fn test_truncated_record() {
        let image = sample_image();
        assert_eq!(parse(&image.0, 0x1ffe).unwrap_err(), MultibootError::Truncated);
        assert_eq!(
            parse(&image.0[..0x104], 0x100).unwrap_err(),
            MultibootError::Truncated
        );
    }
}
