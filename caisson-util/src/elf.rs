//! Reading the dynamic section of shared objects.
//!
//! The dynamic linker identifies a library by its `DT_SONAME`,
//! not by its file name, so any decision of the form
//! "is this library already provided elsewhere"
//! must go through the SONAME.

use {
    goblin::elf::Elf,
    std::{fs, io, path::Path},
    thiserror::Error,
};

/// Returned when a SONAME could not be read.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ElfError
{
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Not a valid ELF shared object: {0}")]
    Parse(#[from] goblin::error::Error),
}

/// Read the `DT_SONAME` of the shared object at `path`.
///
/// Returns [`None`] for a valid ELF object
/// that simply has no `DT_SONAME` entry.
pub fn soname(path: &Path) -> Result<Option<String>, ElfError>
{
    let bytes = fs::read(path)?;
    soname_from_bytes(&bytes)
}

/// Read the `DT_SONAME` out of an in-memory ELF image.
pub fn soname_from_bytes(bytes: &[u8]) -> Result<Option<String>, ElfError>
{
    let elf = Elf::parse(bytes)?;
    Ok(elf.soname.map(str::to_owned))
}

/// Build the bytes of a minimal x86-64 shared object
/// whose only interesting dynamic entry is a `DT_SONAME`.
///
/// This is just enough ELF for [`soname_from_bytes`] to succeed on.
/// It exists for tests in this workspace that need a library on disk;
/// it is not a loadable object.
#[doc(hidden)]
pub fn fake_soname_object(soname: &str) -> Vec<u8>
{
    const EHSIZE:  usize = 64;
    const PHSIZE:  usize = 56;
    const DYNSIZE: usize = 16;

    // One PT_LOAD mapping the whole file at vaddr 0 (so that virtual
    // addresses and file offsets coincide), one PT_DYNAMIC.
    let strtab_off = EHSIZE + 2 * PHSIZE;
    let strsz = soname.len() + 2;
    let dyn_off = (strtab_off + strsz + 7) & !7;
    let total = dyn_off + 4 * DYNSIZE;

    let mut out = Vec::with_capacity(total);
    let u16le = |out: &mut Vec<u8>, v: u16| out.extend(v.to_le_bytes());
    let u32le = |out: &mut Vec<u8>, v: u32| out.extend(v.to_le_bytes());
    let u64le = |out: &mut Vec<u8>, v: u64| out.extend(v.to_le_bytes());

    // ELF header.
    out.extend(*b"\x7fELF");
    out.extend([2, 1, 1, 0]);         // 64-bit, little-endian, version 1
    out.extend([0; 8]);
    u16le(&mut out, 3);               // e_type: ET_DYN
    u16le(&mut out, 62);              // e_machine: EM_X86_64
    u32le(&mut out, 1);               // e_version
    u64le(&mut out, 0);               // e_entry
    u64le(&mut out, EHSIZE as u64);   // e_phoff
    u64le(&mut out, 0);               // e_shoff
    u32le(&mut out, 0);               // e_flags
    u16le(&mut out, EHSIZE as u16);   // e_ehsize
    u16le(&mut out, PHSIZE as u16);   // e_phentsize
    u16le(&mut out, 2);               // e_phnum
    u16le(&mut out, 64);              // e_shentsize
    u16le(&mut out, 0);               // e_shnum
    u16le(&mut out, 0);               // e_shstrndx

    // PT_LOAD.
    u32le(&mut out, 1);               // p_type
    u32le(&mut out, 4);               // p_flags: R
    u64le(&mut out, 0);               // p_offset
    u64le(&mut out, 0);               // p_vaddr
    u64le(&mut out, 0);               // p_paddr
    u64le(&mut out, total as u64);    // p_filesz
    u64le(&mut out, total as u64);    // p_memsz
    u64le(&mut out, 0x1000);          // p_align

    // PT_DYNAMIC.
    u32le(&mut out, 2);               // p_type
    u32le(&mut out, 4);               // p_flags: R
    u64le(&mut out, dyn_off as u64);
    u64le(&mut out, dyn_off as u64);
    u64le(&mut out, dyn_off as u64);
    u64le(&mut out, (4 * DYNSIZE) as u64);
    u64le(&mut out, (4 * DYNSIZE) as u64);
    u64le(&mut out, 8);               // p_align

    // Dynamic string table.
    out.push(0);
    out.extend(soname.as_bytes());
    out.push(0);
    out.resize(dyn_off, 0);

    // Dynamic section: DT_SONAME, DT_STRTAB, DT_STRSZ, DT_NULL.
    u64le(&mut out, 14); u64le(&mut out, 1);
    u64le(&mut out, 5);  u64le(&mut out, strtab_off as u64);
    u64le(&mut out, 10); u64le(&mut out, strsz as u64);
    u64le(&mut out, 0);  u64le(&mut out, 0);

    debug_assert_eq!(out.len(), total);
    out
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn soname_of_fake_object()
    {
        let bytes = fake_soname_object("libdemo.so.1");
        let soname = soname_from_bytes(&bytes).unwrap();
        assert_eq!(soname.as_deref(), Some("libdemo.so.1"));
    }

    #[test]
    fn not_an_elf()
    {
        let result = soname_from_bytes(b"#!/bin/sh\nexit 0\n");
        assert!(matches!(result, Err(ElfError::Parse(_))));
    }

    #[test]
    fn truncated()
    {
        let result = soname_from_bytes(b"\x7fELF");
        assert!(matches!(result, Err(ElfError::Parse(_))));
    }
}
