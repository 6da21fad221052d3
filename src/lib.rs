// An LD_AUDIT module that steers the loader's per-dependency search.
//
// The loader calls la_objsearch once per search stage per dependency;
// this module answers with a substituted name, an injected candidate
// path, a "keep searching" sentinel, or the input unchanged, following
// an operator-supplied rule set.  Rules can prefer the directories a
// binary was linked against over environment overrides, swap one
// dependency for a compatibility shim, or withhold candidates from a
// given stage entirely.
//
// The module is configured through a YAML document named by the
// RLDAUDIT_CONFIG environment variable.  Without it the hook stays
// disabled and every callback returns its input unchanged, which is
// indistinguishable from the module not being loaded.  Internal errors
// behave the same way: they are reported once and permanently disable
// the engine rather than disturb the loader's own search.

pub mod config;
pub mod directive;
pub mod engine;
pub mod error;
pub mod linkmap;
pub mod phase;
pub mod probe;
pub mod rtld;
pub mod rules;
pub mod state;

use std::env;
use std::ffi::{c_char, c_uint, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use crate::engine::{Engine, SearchReply};
use crate::linkmap::DependentInfo;
use crate::phase::SearchPhase;

const CONFIG_ENV: &str = "RLDAUDIT_CONFIG";

// rtld-audit interface version.  Version 1 only differs in la_symbind.
const LAV_CURRENT: c_uint = 2;

// la_objsearch flag values from <link.h>; the libc crate does not carry
// them.
const LA_SER_ORIG: c_uint = 0x01;
const LA_SER_LIBPATH: c_uint = 0x02;
const LA_SER_RUNPATH: c_uint = 0x04;
const LA_SER_CONFIG: c_uint = 0x08;
const LA_SER_DEFAULT: c_uint = 0x40;
const LA_SER_SECURE: c_uint = 0x80;

// Returned instead of NULL to reject a candidate.  When la_objsearch
// returns NULL while the candidate's parent directory exists, the
// loader's open_path sees "no fd, no errno" and misreads it as a fatal
// error, cutting the rest of the search short.  A path whose parent
// cannot exist keeps the search going: /proc never exposes negative
// pids, so /proc/-1 is absent by construction.
static SENTINEL_PATH: &CStr = c"/proc/-1/enoent";

struct Hook {
    engine: Engine,
    // Owns the last reply handed to the loader, which copies it before
    // the next callback.
    reply: Option<CString>,
}

static HOOK: Mutex<Option<Hook>> = Mutex::new(None);

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;

extern "C" fn init() {
    // Nothing may unwind into the loader.
    let _ = catch_unwind(|| {
        let Some(path) = env::var_os(CONFIG_ENV) else {
            return;
        };
        let config = match config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                // The logger is not up yet; report directly.
                eprintln!("rldaudit: {}", e);
                return;
            }
        };

        let _ = env_logger::Builder::new()
            .filter_level(config.log_level)
            .format(|buf, record| {
                use std::io::Write;
                writeln!(buf, "[rldaudit {}] {}", record.level(), record.args())
            })
            .try_init();

        let variant = rtld::detect();
        log::debug!("config {:?} loaded, loader variant {:?}", path, variant);

        if let Ok(mut slot) = HOOK.lock() {
            *slot = Some(Hook {
                engine: Engine::new(config.rules, variant),
                reply: None,
            });
        }
    });
}

fn phase_from_flag(flag: c_uint) -> Option<SearchPhase> {
    match flag {
        LA_SER_ORIG => Some(SearchPhase::Orig),
        LA_SER_RUNPATH => Some(SearchPhase::Runpath),
        LA_SER_LIBPATH => Some(SearchPhase::Libpath),
        LA_SER_CONFIG => Some(SearchPhase::Config),
        LA_SER_DEFAULT => Some(SearchPhase::Default),
        LA_SER_SECURE => Some(SearchPhase::Secure),
        _ => None,
    }
}

fn reply_ptr(hook: &mut Hook, reply: SearchReply, passthrough: *mut c_char) -> *mut c_char {
    match reply {
        SearchReply::Passthrough => passthrough,
        SearchReply::Name(name) => match CString::new(name) {
            Ok(reply) => {
                let ptr = reply.as_ptr() as *mut c_char;
                hook.reply = Some(reply);
                ptr
            }
            // An interior NUL cannot name anything on the filesystem.
            Err(_) => passthrough,
        },
        SearchReply::Ignore => SENTINEL_PATH.as_ptr() as *mut c_char,
    }
}

/// Version handshake with the loader.
///
/// Never returns 0 even when the module is disabled: old loaders crash
/// on a zero answer (glibc bug 24122).
#[no_mangle]
pub extern "C" fn la_version(version: c_uint) -> c_uint {
    if version <= LAV_CURRENT {
        version
    } else {
        LAV_CURRENT
    }
}

/// One search-stage callback from the loader.
///
/// # Safety
///
/// `name` must be a NUL-terminated string and `cookie` the linkage
/// handle the loader passes for this dependency; both are guaranteed by
/// the rtld-audit contract.
#[no_mangle]
pub unsafe extern "C" fn la_objsearch(
    name: *const c_char,
    cookie: *mut libc::uintptr_t,
    flag: c_uint,
) -> *mut c_char {
    let passthrough = name as *mut c_char;

    let Ok(mut slot) = HOOK.lock() else {
        return passthrough;
    };
    let Some(hook) = slot.as_mut() else {
        return passthrough;
    };

    if name.is_null() {
        return passthrough;
    }
    let Ok(request) = CStr::from_ptr(name).to_str() else {
        // Leave anything that is not valid UTF-8 to the loader untouched.
        return passthrough;
    };

    let Some(phase) = phase_from_flag(flag) else {
        log::debug!("unknown search flag {:#x} for {}", flag, request);
        return passthrough;
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        hook.engine.objsearch(request, phase, || {
            linkmap::resolve_cookie(cookie as *const usize)
                .unwrap_or_else(DependentInfo::placeholder)
        })
    }));

    match result {
        Ok(Ok(reply)) => reply_ptr(hook, reply, passthrough),
        Ok(Err(e)) => {
            log::error!("disabling: {}", e);
            *slot = None;
            passthrough
        }
        Err(_) => {
            log::error!("disabling: unexpected panic");
            *slot = None;
            passthrough
        }
    }
}

/// Called once before the process entry point runs; startup dependency
/// resolution is complete at that point.
#[no_mangle]
pub extern "C" fn la_preinit(_cookie: *mut libc::uintptr_t) {
    if let Ok(mut slot) = HOOK.lock() {
        if let Some(hook) = slot.as_mut() {
            hook.engine.reset();
            hook.reply = None;
        }
    }
}
