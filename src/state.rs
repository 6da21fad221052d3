use std::collections::HashMap;

use crate::phase::BlockName;

// Mutable state for the dependency currently being resolved.  Created on
// the orig phase and replaced wholesale when the next dependency's orig
// phase arrives; nothing from one dependency leaks into the next.
#[derive(Debug)]
pub struct SearchState {
    // Index of the selected rule; fixed for the whole resolution.
    pub rule: Option<usize>,
    // The (possibly renamed) library name dir directives join with.
    pub working_name: String,
    // Whether the requesting object carries DT_RUNPATH; selects the
    // runpath or rpath block for the dedicated phase.
    pub has_runpath: bool,
    // Per-block state.  Key presence records that the block's prepend
    // list already ran; the value holds the first compatible path the
    // block observed, if any.
    pub block_state: HashMap<BlockName, Option<String>>,
}

impl SearchState {
    pub fn matched(rule: usize, working_name: String, has_runpath: bool) -> Self {
        SearchState {
            rule: Some(rule),
            working_name,
            has_runpath,
            block_state: HashMap::new(),
        }
    }

    pub fn unmatched(has_runpath: bool) -> Self {
        SearchState {
            rule: None,
            working_name: String::new(),
            has_runpath,
            block_state: HashMap::new(),
        }
    }
}
