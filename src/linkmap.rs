// Dependent-object metadata from the loader's opaque linkage handle.
//
// The cookie passed on the orig phase points at the loader's link_map
// slot for the object requesting the dependency.  Old loaders hand over
// a near-null cookie when the requested name carries interpolation
// markers, already contains a path separator, or targets another
// namespace through dlmopen; such handles degrade to a placeholder
// instead of being dereferenced.

use std::ffi::CStr;

use object::elf::{DT_NULL, DT_RUNPATH};

// Anything below this cannot be a valid pointer on a sanely configured
// system; it covers the link_map plus per-namespace audit-state offsets
// old loaders pass as bogus cookies.
const COOKIE_FLOOR: usize = 65536;

// Minimal native view of the loader's link_map, enough to reach the
// object name and its dynamic array.  The public part of the layout is
// ABI-stable.
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const libc::c_char,
    l_ld: *const ElfDyn,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

// ElfW(Dyn): a tag plus a value/pointer union, both pointer-sized.
#[repr(C)]
struct ElfDyn {
    d_tag: isize,
    d_un: usize,
}

// Facts about the object requesting the dependency, fixed for the whole
// resolution.
#[derive(Debug, Clone)]
pub struct DependentInfo {
    pub path: String,
    pub has_runpath: bool,
}

impl DependentInfo {
    // Stands in when the handle cannot be resolved.  The empty string is
    // not usable here because it denotes the main executable; "/" can
    // never name a shared object.
    pub fn placeholder() -> Self {
        DependentInfo {
            path: "/".to_string(),
            has_runpath: false,
        }
    }
}

// Resolve the linkage cookie to the requesting object's metadata.
//
// Safety: the cookie must be what the loader passes on the orig phase —
// either invalid-by-range or a live pointer to the link_map slot of the
// requesting object.
pub unsafe fn resolve_cookie(cookie: *const usize) -> Option<DependentInfo> {
    if (cookie as usize) < COOKIE_FLOOR {
        log::debug!("linkage handle {:p} out of range", cookie);
        return None;
    }

    let lm = *(cookie as *const *const LinkMap);
    if lm.is_null() || (*lm).l_name.is_null() {
        return None;
    }
    let path = CStr::from_ptr((*lm).l_name).to_string_lossy().into_owned();

    let mut has_runpath = false;
    let mut entry = (*lm).l_ld;
    if !entry.is_null() {
        while (*entry).d_tag != DT_NULL as isize {
            if (*entry).d_tag == DT_RUNPATH as isize {
                has_runpath = true;
                break;
            }
            entry = entry.add(1);
        }
    }

    Some(DependentInfo { path, has_runpath })
}
