// Loader-variant detection.
//
// A process whose loader comes from the content-addressed store resolves
// differently from one running the system loader; rules can bind to
// either.  The loaded objects are walked once at initialization and the
// loader is recognized by its location plus its basename.

use std::ffi::CStr;
use std::path::Path;

use crate::phase::LoaderVariant;

// Store prefix the immutable library store lives under; overridable at
// build time for non-standard layouts.
const STORE_DIR: &str = match option_env!("NIX_STORE_DIR") {
    Some(dir) => dir,
    None => "/nix/store",
};

// glibc loader basenames, one per ABI variant.
const GLIBC_RTLD: &[&str] = &[
    "ld-linux-aarch64.so.1",         // AArch64 little-endian.
    "ld-linux-aarch64_be.so.1",      // AArch64 big-endian.
    "ld-linux-armhf.so.3",           // ARM with hard-fp.
    "ld-linux-loongarch-lp64d.so.1", // LoongArch with double fp.
    "ld-linux-riscv64-lp64d.so.1",   // riscv64.
    "ld-linux-x86-64.so.2",          // x86_64.
    "ld-linux.so.2",                 // i386.
    "ld-linux.so.3",                 // arm.
    "ld.so.1",                       // Default for 32 bits.
    "ld64.so.1",                     // powerpc64 ELFv1 and s390x.
    "ld64.so.2",                     // powerpc64 ELFv2.
];

fn is_store_rtld(store: &str, name: &str) -> bool {
    if !name.starts_with(store) || !name[store.len()..].starts_with('/') {
        return false;
    }
    let basename = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    GLIBC_RTLD.contains(&basename)
}

// Walk the loaded objects once and classify the loader.
pub fn detect() -> LoaderVariant {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        _data: *mut libc::c_void,
    ) -> libc::c_int {
        let name = (*info).dlpi_name;
        if name.is_null() {
            return 0;
        }
        match CStr::from_ptr(name).to_str() {
            // Non-zero stops the iteration.
            Ok(name) if is_store_rtld(STORE_DIR, name) => 1,
            _ => 0,
        }
    }

    let found = unsafe { libc::dl_iterate_phdr(Some(callback), std::ptr::null_mut()) };
    if found != 0 {
        log::debug!("store rtld found, loader variant: nix");
        LoaderVariant::Nix
    } else {
        LoaderVariant::Normal
    }
}
