// Candidate compatibility prober.
//
// Replays the verification the loader itself performs on a candidate path
// (glibc's open_path/open_verify) so that the engine and the loader never
// disagree about whether a candidate is usable.  The distinction between
// Incompatible and Fatal matters: the first lets the search continue, the
// second has to make the loader observe the failure itself.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use object::elf::{ELFOSABI_GNU, ELFOSABI_SYSV, EV_CURRENT};

// The loader's verdict over one candidate path.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Verdict {
    // Loadable by the current process.
    Compatible,
    // Not usable here (missing, foreign word size or architecture); the
    // search continues with the next candidate.
    Incompatible,
    // Broken in a way the loader treats as a hard error; the search has
    // to stop and surface the failure.
    Fatal,
}

// e_ident layout.  The object crate models the identification block as a
// struct; the prober checks the raw bytes field by field instead, since
// it has to classify objects the typed parsers would reject outright.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;
const EI_PAD: usize = 9;
const EI_NIDENT: usize = 16;

const E_MACHINE_OFF: usize = 18;

// glibc's LIBC_ABI_MAX is not retrievable at runtime; this mirrors the
// current ceiling for ELFOSABI_GNU objects.
const GNU_ABI_VERSION_MAX: u8 = 4;

#[cfg(target_pointer_width = "64")]
const EHDR_LEN: usize = 64;
#[cfg(target_pointer_width = "32")]
const EHDR_LEN: usize = 52;

#[cfg(target_pointer_width = "64")]
const EXPECTED_CLASS: u8 = object::elf::ELFCLASS64;
#[cfg(target_pointer_width = "32")]
const EXPECTED_CLASS: u8 = object::elf::ELFCLASS32;

#[cfg(target_endian = "little")]
const EXPECTED_DATA: u8 = object::elf::ELFDATA2LSB;
#[cfg(target_endian = "big")]
const EXPECTED_DATA: u8 = object::elf::ELFDATA2MSB;

#[cfg(target_arch = "x86_64")]
const EXPECTED_MACHINE: u16 = object::elf::EM_X86_64;
#[cfg(target_arch = "x86")]
const EXPECTED_MACHINE: u16 = object::elf::EM_386;
#[cfg(target_arch = "aarch64")]
const EXPECTED_MACHINE: u16 = object::elf::EM_AARCH64;
#[cfg(target_arch = "arm")]
const EXPECTED_MACHINE: u16 = object::elf::EM_ARM;
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
const EXPECTED_MACHINE: u16 = object::elf::EM_RISCV;
#[cfg(target_arch = "powerpc")]
const EXPECTED_MACHINE: u16 = object::elf::EM_PPC;
#[cfg(target_arch = "powerpc64")]
const EXPECTED_MACHINE: u16 = object::elf::EM_PPC64;
#[cfg(target_arch = "s390x")]
const EXPECTED_MACHINE: u16 = object::elf::EM_S390;
#[cfg(target_arch = "loongarch64")]
const EXPECTED_MACHINE: u16 = object::elf::EM_LOONGARCH;
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv32",
    target_arch = "riscv64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "s390x",
    target_arch = "loongarch64"
)))]
compile_error!("unsupported architecture");

pub fn probe<P: AsRef<Path>>(path: P) -> Verdict {
    let path = path.as_ref();
    log::debug!("probing {}", path.display());

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => return io_verdict(path, &e),
    };

    let mut ehdr = [0u8; EHDR_LEN];
    if let Err(e) = file.read_exact(&mut ehdr) {
        if e.kind() == ErrorKind::UnexpectedEof {
            log::error!("{}: file too short", path.display());
            return Verdict::Fatal;
        }
        return io_verdict(path, &e);
    }

    verify_header(path, &ehdr)
}

// ENOENT, ENOTDIR, and EACCES only mean this candidate does not exist for
// the current process; everything else aborts the search.
fn io_verdict(path: &Path, e: &std::io::Error) -> Verdict {
    match e.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::EACCES) => {
            log::debug!("{}: {}", path.display(), e);
            Verdict::Incompatible
        }
        _ => {
            log::error!("{}: {}", path.display(), e);
            Verdict::Fatal
        }
    }
}

fn verify_header(path: &Path, ehdr: &[u8; EHDR_LEN]) -> Verdict {
    if &ehdr[..EI_CLASS] != b"\x7fELF" {
        log::error!("{}: invalid ELF magic number", path.display());
        return Verdict::Fatal;
    }

    if ehdr[EI_CLASS] != EXPECTED_CLASS {
        // Multilib: a foreign word size only skips this candidate.
        log::debug!("{}: word size mismatch", path.display());
        return Verdict::Incompatible;
    }

    if ehdr[EI_DATA] != EXPECTED_DATA {
        log::error!("{}: byte order mismatch", path.display());
        return Verdict::Fatal;
    }

    if ehdr[EI_VERSION] != EV_CURRENT as u8 {
        log::error!("{}: ELF version mismatch", path.display());
        return Verdict::Fatal;
    }

    let osabi = ehdr[EI_OSABI];
    if osabi != ELFOSABI_SYSV && osabi != ELFOSABI_GNU {
        log::error!("{}: OS ABI mismatch", path.display());
        return Verdict::Fatal;
    }

    let abiversion = ehdr[EI_ABIVERSION];
    if !(abiversion == 0 || (osabi == ELFOSABI_GNU && abiversion < GNU_ABI_VERSION_MAX)) {
        log::error!("{}: ABI version mismatch", path.display());
        return Verdict::Fatal;
    }

    if ehdr[EI_PAD..EI_NIDENT].iter().any(|b| *b != 0) {
        log::error!("{}: non-zero padding in e_ident", path.display());
        return Verdict::Fatal;
    }

    // Endianness already matched the running process, so e_machine can be
    // read as a native value.
    let e_machine = u16::from_ne_bytes([ehdr[E_MACHINE_OFF], ehdr[E_MACHINE_OFF + 1]]);
    if e_machine != EXPECTED_MACHINE {
        // A foreign architecture only skips this candidate.
        log::debug!("{}: arch mismatch", path.display());
        return Verdict::Incompatible;
    }

    // The remaining checks the loader performs are either fatal ones it
    // will repeat itself or elf_machine_reject_phdr_p, which only exists
    // for MIPS.
    Verdict::Compatible
}

// Builds a minimal header the running process accepts.  Shared with the
// engine tests so probing scenarios hold on any supported host.
#[cfg(test)]
pub(crate) fn native_ehdr() -> Vec<u8> {
    let mut ehdr = vec![0u8; EHDR_LEN];
    ehdr[..EI_CLASS].copy_from_slice(b"\x7fELF");
    ehdr[EI_CLASS] = EXPECTED_CLASS;
    ehdr[EI_DATA] = EXPECTED_DATA;
    ehdr[EI_VERSION] = EV_CURRENT as u8;
    ehdr[EI_OSABI] = ELFOSABI_SYSV;
    // e_type = ET_DYN; the prober does not inspect it but a real shared
    // object would carry it.
    ehdr[EI_NIDENT..EI_NIDENT + 2].copy_from_slice(&(object::elf::ET_DYN).to_ne_bytes());
    ehdr[E_MACHINE_OFF..E_MACHINE_OFF + 2].copy_from_slice(&EXPECTED_MACHINE.to_ne_bytes());
    ehdr
}
