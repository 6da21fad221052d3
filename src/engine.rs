// Search-phase state machine.
//
// The loader drives this engine with one callback per search stage per
// dependency; the order and number of callbacks is the loader's, not
// ours.  The orig phase both ends the previous dependency's resolution
// and starts the new one: the live state is replaced wholesale, a rule is
// selected once, and later phases only consult it.

use crate::directive;
use crate::error::Error;
use crate::linkmap::DependentInfo;
use crate::phase::{LoaderVariant, SearchPhase};
use crate::rules::RuleStore;
use crate::state::SearchState;

// What one callback tells the loader.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum SearchReply {
    // Hand the candidate back unchanged.
    Passthrough,
    // Substitute a name, or offer a concrete path to try.
    Name(String),
    // Reject the candidate without interrupting the search.
    Ignore,
}

pub struct Engine {
    rules: RuleStore,
    variant: LoaderVariant,
    state: Option<SearchState>,
}

impl Engine {
    pub fn new(rules: RuleStore, variant: LoaderVariant) -> Self {
        Engine {
            rules,
            variant,
            state: None,
        }
    }

    // Startup resolution is over; drop any in-flight dependency state.
    pub fn reset(&mut self) {
        self.state = None;
    }

    // One la_objsearch callback.  The dependent thunk is only consulted
    // on the orig phase, where the loader supplies the linkage handle of
    // the requesting object.
    pub fn objsearch<F>(
        &mut self,
        name: &str,
        phase: SearchPhase,
        dependent: F,
    ) -> Result<SearchReply, Error>
    where
        F: FnOnce() -> DependentInfo,
    {
        if phase == SearchPhase::Orig {
            return Ok(self.begin(name, dependent()));
        }

        let state = self
            .state
            .as_mut()
            .ok_or(Error::Internal("search phase with no dependency in progress"))?;

        let Some(rule_idx) = state.rule else {
            return Ok(SearchReply::Passthrough);
        };
        let rule = self
            .rules
            .get(rule_idx)
            .ok_or(Error::Internal("selected rule out of range"))?;

        let Some(block_name) = phase.block_name(state.has_runpath) else {
            return Ok(SearchReply::Passthrough);
        };
        let Some(block) = rule.block(block_name) else {
            log::debug!("no {} block for {}, skipping", block_name, name);
            return Ok(SearchReply::Passthrough);
        };

        Ok(directive::execute(block_name, block, state, name))
    }

    // The first phase of a new dependency: select a rule and fix the
    // working name for the rest of the resolution.
    fn begin(&mut self, name: &str, dependent: DependentInfo) -> SearchReply {
        log::debug!(
            "resolving {} requested by {} (runpath={})",
            name,
            dependent.path,
            dependent.has_runpath
        );
        match self.rules.select(self.variant, name, &dependent.path) {
            Some((rule, working_name)) => {
                let reply = SearchReply::Name(working_name.clone());
                self.state = Some(SearchState::matched(
                    rule,
                    working_name,
                    dependent.has_runpath,
                ));
                reply
            }
            None => {
                log::debug!("no matching rule for {}", name);
                self.state = Some(SearchState::unmatched(dependent.has_runpath));
                SearchReply::Passthrough
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::probe::native_ehdr;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn new_engine(doc: &str, variant: LoaderVariant) -> Engine {
        Engine::new(config::parse(doc).unwrap().rules, variant)
    }

    fn dependent(path: &str, has_runpath: bool) -> impl FnOnce() -> DependentInfo + '_ {
        move || DependentInfo {
            path: path.to_string(),
            has_runpath,
        }
    }

    fn no_dependent() -> DependentInfo {
        panic!("dependent metadata requested outside the orig phase");
    }

    fn write_native_object<P: AsRef<Path>>(path: P) {
        let mut file = File::create(path).unwrap();
        file.write_all(&native_ehdr()).unwrap();
    }

    fn write_broken_object<P: AsRef<Path>>(path: P) {
        let mut ehdr = native_ehdr();
        ehdr[0] = b'!';
        let mut file = File::create(path).unwrap();
        file.write_all(&ehdr).unwrap();
    }

    #[test]
    fn unmatched_dependency_passes_every_phase_through() {
        let mut engine = new_engine(
            r#"rules: [{cond: {lib: libnomatch\.so}}]"#,
            LoaderVariant::Normal,
        );

        let reply = engine
            .objsearch("libm.so.6", SearchPhase::Orig, dependent("/usr/bin/app", true))
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);

        for phase in [
            SearchPhase::Runpath,
            SearchPhase::Libpath,
            SearchPhase::Config,
            SearchPhase::Default,
            SearchPhase::Secure,
        ] {
            let reply = engine
                .objsearch("/usr/lib/libm.so.6", phase, no_dependent)
                .unwrap();
            assert_eq!(reply, SearchReply::Passthrough);
        }
    }

    #[test]
    fn phase_without_dependency_is_an_internal_error() {
        let mut engine = new_engine("rules: []", LoaderVariant::Normal);
        assert!(engine
            .objsearch("libm.so.6", SearchPhase::Default, no_dependent)
            .is_err());
    }

    #[test]
    fn rename_substitutes_and_feeds_dir_directives() {
        let tmpdir = TempDir::new().unwrap();
        write_native_object(tmpdir.path().join("libfoo-shim.so.2"));

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libfoo\.so\.(\d+)
    rename: libfoo-shim.so.$1
    default:
      prepend:
        - dir: {}
"#,
            tmpdir.path().display()
        );
        let mut engine = new_engine(&doc, LoaderVariant::Normal);

        let reply = engine
            .objsearch("libfoo.so.2", SearchPhase::Orig, dependent("/usr/bin/app", true))
            .unwrap();
        assert_eq!(reply, SearchReply::Name("libfoo-shim.so.2".to_string()));

        let expected = tmpdir.path().join("libfoo-shim.so.2");
        let reply = engine
            .objsearch("libfoo.so.2", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(
            reply,
            SearchReply::Name(expected.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn save_block_observes_and_releases_through_saved() {
        let tmpdir = TempDir::new().unwrap();
        let first = tmpdir.path().join("libbar.so");
        let second = tmpdir.path().join("libbar-second.so");
        write_native_object(&first);
        write_native_object(&second);

        let doc = r#"
rules:
  - cond:
      lib: libbar\.so
    libpath:
      save: true
    default:
      prepend:
        - saved: libpath
"#;
        let mut engine = new_engine(doc, LoaderVariant::Normal);

        let reply = engine
            .objsearch("libbar.so", SearchPhase::Orig, dependent("/usr/bin/app", true))
            .unwrap();
        assert_eq!(reply, SearchReply::Name("libbar.so".to_string()));

        // The saving phase never leaks a real path, not even on the call
        // that records the match, and only the first match is kept.
        let first_str = first.to_string_lossy();
        let reply = engine
            .objsearch(&first_str, SearchPhase::Libpath, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);
        let reply = engine
            .objsearch(&second.to_string_lossy(), SearchPhase::Libpath, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);

        let reply = engine
            .objsearch("libbar.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Name(first_str.into_owned()));
    }

    #[test]
    fn save_block_never_offers_its_own_prepend_result() {
        let tmpdir = TempDir::new().unwrap();
        let shim = tmpdir.path().join("libshim.so");
        write_native_object(&shim);

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libbar\.so
    libpath:
      save: true
      prepend:
        - file: {}
    default:
      prepend:
        - saved: libpath
"#,
            shim.display()
        );
        let mut engine = new_engine(&doc, LoaderVariant::Normal);
        engine
            .objsearch("libbar.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();

        // Even a compatible path from the block's own prepend list stays
        // recorded instead of being offered.
        let reply = engine
            .objsearch("/env/libbar.so", SearchPhase::Libpath, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);

        let reply = engine
            .objsearch("libbar.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Name(shim.to_string_lossy().into_owned()));
    }

    #[test]
    fn saved_from_unsearched_block_is_skipped() {
        let mut engine = new_engine(
            r#"
rules:
  - cond:
      lib: libbar\.so
    libpath:
      save: true
    default:
      prepend:
        - saved: libpath
"#,
            LoaderVariant::Normal,
        );

        engine
            .objsearch("libbar.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        // The libpath phase never ran (e.g. LD_LIBRARY_PATH unset): the
        // saved directive is skipped silently.
        let reply = engine
            .objsearch("libbar.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);
    }

    #[test]
    fn filter_order_is_significant() {
        let doc = r#"
rules:
  - cond:
      lib: libz\.so.*
    default:
      filter:
        - include: /usr/.*
        - exclude: .*
"#;
        let mut engine = new_engine(doc, LoaderVariant::Normal);
        engine
            .objsearch("libz.so.1", SearchPhase::Orig, dependent("/", false))
            .unwrap();

        // First include match falls through; anything else is rejected.
        let reply = engine
            .objsearch("/usr/lib/libz.so.1", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);
        let reply = engine
            .objsearch("/opt/lib/libz.so.1", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);

        // With the order reversed the exclude shadows the include.
        let doc = r#"
rules:
  - cond:
      lib: libz\.so.*
    default:
      filter:
        - exclude: .*
        - include: /usr/.*
"#;
        let mut engine = new_engine(doc, LoaderVariant::Normal);
        engine
            .objsearch("libz.so.1", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        let reply = engine
            .objsearch("/usr/lib/libz.so.1", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);
    }

    #[test]
    fn runpath_flag_selects_the_block() {
        let doc = r#"
rules:
  - cond:
      lib: libq\.so
    rpath:
      filter:
        - exclude: .*
"#;
        // Requesting object has only DT_RPATH: the rpath block applies.
        let mut engine = new_engine(doc, LoaderVariant::Normal);
        engine
            .objsearch("libq.so", SearchPhase::Orig, dependent("/usr/bin/app", false))
            .unwrap();
        let reply = engine
            .objsearch("/opt/lib/libq.so", SearchPhase::Runpath, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Ignore);

        // With DT_RUNPATH the runpath block applies instead, and this
        // rule has none.
        let mut engine = new_engine(doc, LoaderVariant::Normal);
        engine
            .objsearch("libq.so", SearchPhase::Orig, dependent("/usr/bin/app", true))
            .unwrap();
        let reply = engine
            .objsearch("/opt/lib/libq.so", SearchPhase::Runpath, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);
    }

    #[test]
    fn prepend_file_runs_once_per_dependency() {
        let tmpdir = TempDir::new().unwrap();
        let shim = tmpdir.path().join("libshim.so");
        write_native_object(&shim);

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libp\.so
    default:
      prepend:
        - file: {}
"#,
            shim.display()
        );
        let mut engine = new_engine(&doc, LoaderVariant::Normal);
        engine
            .objsearch("libp.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();

        let reply = engine
            .objsearch("libp.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Name(shim.to_string_lossy().into_owned()));

        // Subsequent candidates of the same phase fall through to the
        // filters instead of re-running the prepend list.
        let reply = engine
            .objsearch("/usr/lib/libp.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);
    }

    #[test]
    fn fatal_prepend_candidate_is_propagated() {
        let tmpdir = TempDir::new().unwrap();
        let broken = tmpdir.path().join("libbroken.so");
        write_broken_object(&broken);

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libp\.so
    default:
      prepend:
        - file: {}
"#,
            broken.display()
        );
        let mut engine = new_engine(&doc, LoaderVariant::Normal);
        engine
            .objsearch("libp.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();

        // The broken path goes back as-is so the loader fails on it.
        let reply = engine
            .objsearch("libp.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(
            reply,
            SearchReply::Name(broken.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn incompatible_prepend_candidates_are_skipped_in_order() {
        let tmpdir = TempDir::new().unwrap();
        let good = tmpdir.path().join("libgood.so");
        write_native_object(&good);

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libp\.so
    default:
      prepend:
        - file: {}/libmissing.so
        - file: {}
"#,
            tmpdir.path().display(),
            good.display()
        );
        let mut engine = new_engine(&doc, LoaderVariant::Normal);
        engine
            .objsearch("libp.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();

        let reply = engine
            .objsearch("libp.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Name(good.to_string_lossy().into_owned()));
    }

    #[test]
    fn variant_gates_rule_selection() {
        let doc = r#"
rules:
  - cond:
      rtld: nix
      lib: libm\.so\.6
    rename: libm-shim.so.6
"#;
        let mut engine = new_engine(doc, LoaderVariant::Normal);
        let reply = engine
            .objsearch("libm.so.6", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);

        let mut engine = new_engine(doc, LoaderVariant::Nix);
        let reply = engine
            .objsearch("libm.so.6", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        assert_eq!(reply, SearchReply::Name("libm-shim.so.6".to_string()));
    }

    #[test]
    fn replay_is_idempotent() {
        let tmpdir = TempDir::new().unwrap();
        write_native_object(tmpdir.path().join("libr.so"));

        let doc = format!(
            r#"
rules:
  - cond:
      lib: libr\.so
    libpath:
      save: true
    default:
      prepend:
        - saved: libpath
        - dir: {}
"#,
            tmpdir.path().display()
        );
        let candidate = tmpdir.path().join("libr.so");
        let candidate = candidate.to_string_lossy();

        let run = || {
            let mut engine = new_engine(&doc, LoaderVariant::Normal);
            let mut replies = Vec::new();
            replies.push(
                engine
                    .objsearch("libr.so", SearchPhase::Orig, dependent("/usr/bin/app", true))
                    .unwrap(),
            );
            replies.push(
                engine
                    .objsearch(&candidate, SearchPhase::Libpath, no_dependent)
                    .unwrap(),
            );
            replies.push(
                engine
                    .objsearch("libr.so", SearchPhase::Default, no_dependent)
                    .unwrap(),
            );
            replies
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn orig_replaces_previous_dependency_state() {
        let tmpdir = TempDir::new().unwrap();
        let saved = tmpdir.path().join("libone.so");
        write_native_object(&saved);

        let doc = r#"
rules:
  - cond:
      lib: lib(one|two)\.so
    libpath:
      save: true
    default:
      prepend:
        - saved: libpath
"#;
        let mut engine = new_engine(doc, LoaderVariant::Normal);

        engine
            .objsearch("libone.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        engine
            .objsearch(&saved.to_string_lossy(), SearchPhase::Libpath, no_dependent)
            .unwrap();

        // The next dependency starts from scratch: nothing saved by the
        // previous one is visible.
        engine
            .objsearch("libtwo.so", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        let reply = engine
            .objsearch("libtwo.so", SearchPhase::Default, no_dependent)
            .unwrap();
        assert_eq!(reply, SearchReply::Passthrough);
    }

    #[test]
    fn reset_drops_the_live_state() {
        let mut engine = new_engine("rules: [{}]", LoaderVariant::Normal);
        engine
            .objsearch("libm.so.6", SearchPhase::Orig, dependent("/", false))
            .unwrap();
        engine.reset();
        assert!(engine
            .objsearch("libm.so.6", SearchPhase::Default, no_dependent)
            .is_err());
    }
}
