// Directive executor: interprets one rule block for one loader callback.
//
// Directive lists are strictly ordered and short-circuit on the first
// success; filters short-circuit on the first match of either kind.  A
// saved reference only ever sees blocks that already executed earlier in
// this dependency's phase order.

use std::path::Path;

use crate::engine::SearchReply;
use crate::phase::BlockName;
use crate::probe::{self, Verdict};
use crate::rules::{Filter, PhaseBlock, Prepend};
use crate::state::SearchState;

pub fn execute(
    name: BlockName,
    block: &PhaseBlock,
    state: &mut SearchState,
    candidate: &str,
) -> SearchReply {
    // The prepend list runs at most once per dependency per block; the
    // bare map entry also marks the block as searched for later saved
    // references.
    if !state.block_state.contains_key(&name) {
        state.block_state.insert(name, None);
        match run_prepend(name, block, state) {
            // A saving block never offers a candidate, not even one its
            // own prepend list produced; the path is already recorded.
            Some(Prepended::Offer(path)) if block.save => {
                let slot = state.block_state.entry(name).or_insert(None);
                if slot.is_none() {
                    *slot = Some(path);
                }
                return SearchReply::Ignore;
            }
            Some(Prepended::Offer(path)) => return SearchReply::Name(path),
            // A fatal candidate always goes back so the loader observes
            // the error itself and stops the search.
            Some(Prepended::Fatal(path)) => return SearchReply::Name(path),
            None => {}
        }
    }

    // First filter match of either kind decides.
    for filter in &block.filter {
        match filter {
            Filter::Include(re) => {
                if re.is_match(candidate) {
                    break;
                }
            }
            Filter::Exclude(re) => {
                if re.is_match(candidate) {
                    log::debug!("{}: excluding {}", name, candidate);
                    return SearchReply::Ignore;
                }
            }
        }
    }

    if block.save {
        // A saving block only observes: it records the first compatible
        // candidate and reports no match for every one of them.  The
        // recorded path leaves only through another block's saved
        // directive.
        if probe::probe(candidate) == Verdict::Compatible {
            let slot = state.block_state.entry(name).or_insert(None);
            if slot.is_none() {
                log::debug!("{}: saving {}", name, candidate);
                *slot = Some(candidate.to_string());
            }
        }
        return SearchReply::Ignore;
    }

    SearchReply::Passthrough
}

enum Prepended {
    // A usable candidate to offer the loader.
    Offer(String),
    // A broken candidate whose failure the loader has to see.
    Fatal(String),
}

fn run_prepend(name: BlockName, block: &PhaseBlock, state: &mut SearchState) -> Option<Prepended> {
    for directive in &block.prepend {
        let path = match directive {
            Prepend::Saved(source) => {
                if *source == name {
                    // A block cannot reuse its own slot.
                    continue;
                }
                match state.block_state.get(source) {
                    Some(Some(saved)) => {
                        log::debug!("{}: reusing path saved by {}: {}", name, source, saved);
                        return Some(Prepended::Offer(saved.clone()));
                    }
                    // Source block not searched yet, or nothing saved.
                    _ => continue,
                }
            }
            Prepend::File(path) => path.clone(),
            Prepend::Dir(dir) => Path::new(dir)
                .join(&state.working_name)
                .to_string_lossy()
                .into_owned(),
        };

        match probe::probe(&path) {
            Verdict::Compatible => {
                state.block_state.insert(name, Some(path.clone()));
                return Some(Prepended::Offer(path));
            }
            Verdict::Incompatible => continue,
            Verdict::Fatal => return Some(Prepended::Fatal(path)),
        }
    }
    None
}
