use std::fmt;

use serde::Deserialize;

// The loader search stage reported through la_objsearch, in the order the
// loader issues them for one dependency.  Orig always comes first and
// carries the linkage handle of the requesting object.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SearchPhase {
    Orig,    // LA_SER_ORIG: the requested DT_NEEDED name.
    Runpath, // LA_SER_RUNPATH: DT_RPATH or DT_RUNPATH directories.
    Libpath, // LA_SER_LIBPATH: LD_LIBRARY_PATH directories.
    Config,  // LA_SER_CONFIG: ld.so.cache entries.
    Default, // LA_SER_DEFAULT: default system directories.
    Secure,  // LA_SER_SECURE: secure-mode directories.
}

impl SearchPhase {
    // Map the phase to the rule block consulted for it.  The runpath stage
    // covers both DT_RPATH and DT_RUNPATH; which block applies depends on
    // whether the requesting object carries a DT_RUNPATH entry.  Orig and
    // Secure have no block.
    pub fn block_name(&self, has_runpath: bool) -> Option<BlockName> {
        match self {
            SearchPhase::Orig => None,
            SearchPhase::Runpath => Some(if has_runpath {
                BlockName::Runpath
            } else {
                BlockName::Rpath
            }),
            SearchPhase::Libpath => Some(BlockName::Libpath),
            SearchPhase::Config => Some(BlockName::Config),
            SearchPhase::Default => Some(BlockName::Default),
            SearchPhase::Secure => None,
        }
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SearchPhase::Orig => write!(f, "orig"),
            SearchPhase::Runpath => write!(f, "runpath"),
            SearchPhase::Libpath => write!(f, "libpath"),
            SearchPhase::Config => write!(f, "config"),
            SearchPhase::Default => write!(f, "default"),
            SearchPhase::Secure => write!(f, "secure"),
        }
    }
}

// Rule block keys.  A closed set so a typo in the configuration fails the
// load instead of silently never matching.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockName {
    Rpath,
    Runpath,
    Libpath,
    Config,
    Default,
}

impl fmt::Display for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockName::Rpath => write!(f, "rpath"),
            BlockName::Runpath => write!(f, "runpath"),
            BlockName::Libpath => write!(f, "libpath"),
            BlockName::Config => write!(f, "config"),
            BlockName::Default => write!(f, "default"),
        }
    }
}

// Which build of the loader resolved this process: one from the content
// addressed store or the ordinary system one.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LoaderVariant {
    Nix,
    Normal,
}

// Rule condition over the loader variant.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantFilter {
    Nix,
    Normal,
    #[default]
    Any,
}

impl VariantFilter {
    pub fn admits(&self, variant: LoaderVariant) -> bool {
        match self {
            VariantFilter::Nix => variant == LoaderVariant::Nix,
            VariantFilter::Normal => variant == LoaderVariant::Normal,
            VariantFilter::Any => true,
        }
    }
}
