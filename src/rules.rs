// Compiled rule store.
//
// Rules are compiled once from the configuration document and immutable
// for the process lifetime.  Selection walks them in declaration order;
// the first rule whose conditions all hold wins and stays selected for
// every phase of that dependency.

use regex::Regex;

use crate::error::Error;
use crate::phase::{BlockName, LoaderVariant, VariantFilter};

// Compile a configured pattern for full-string matching: the whole
// candidate has to match, not a substring.
pub fn compile_full_match(pattern: &str) -> Result<Regex, Error> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

// An absent pattern matches anything.  This is distinct from an explicit
// ".*": absence never even looks at the candidate.
fn matches_opt(pattern: &Option<Regex>, s: &str) -> bool {
    match pattern {
        Some(re) => re.is_match(s),
        None => true,
    }
}

pub struct Condition {
    pub rtld: VariantFilter,
    pub lib: Option<Regex>,
    pub dependent_lib: Option<Regex>,
}

// One prepend directive, tried in declared order before the loader's own
// candidates for the block's phase.
pub enum Prepend {
    // Reuse the first compatible path another block recorded.
    Saved(BlockName),
    // A literal candidate path.
    File(String),
    // A directory joined with the working library name.
    Dir(String),
}

pub enum Filter {
    Include(Regex),
    Exclude(Regex),
}

pub struct PhaseBlock {
    pub prepend: Vec<Prepend>,
    pub filter: Vec<Filter>,
    // A saving block never offers a candidate; it only records the first
    // compatible one it observes for other blocks to reuse.
    pub save: bool,
}

pub struct Rule {
    pub cond: Condition,
    pub rename: Option<String>,
    pub rpath: Option<PhaseBlock>,
    pub runpath: Option<PhaseBlock>,
    pub libpath: Option<PhaseBlock>,
    pub config: Option<PhaseBlock>,
    pub default: Option<PhaseBlock>,
}

impl Rule {
    pub fn block(&self, name: BlockName) -> Option<&PhaseBlock> {
        match name {
            BlockName::Rpath => self.rpath.as_ref(),
            BlockName::Runpath => self.runpath.as_ref(),
            BlockName::Libpath => self.libpath.as_ref(),
            BlockName::Config => self.config.as_ref(),
            BlockName::Default => self.default.as_ref(),
        }
    }
}

pub struct RuleStore {
    rules: Vec<Rule>,
}

impl RuleStore {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleStore { rules }
    }

    pub fn get(&self, idx: usize) -> Option<&Rule> {
        self.rules.get(idx)
    }

    // First matching rule for the dependency, together with the working
    // name all dir-joined directives will use: the rename template
    // expanded with the lib pattern's capture groups, or the requested
    // name unchanged.
    pub fn select(
        &self,
        variant: LoaderVariant,
        lib: &str,
        dependent: &str,
    ) -> Option<(usize, String)> {
        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.cond.rtld.admits(variant) {
                continue;
            }
            let caps = match &rule.cond.lib {
                Some(re) => match re.captures(lib) {
                    Some(caps) => Some(caps),
                    None => continue,
                },
                None => None,
            };
            if !matches_opt(&rule.cond.dependent_lib, dependent) {
                continue;
            }
            log::debug!("rule {} matched for {}", idx, lib);

            let working_name = match (&rule.rename, &caps) {
                (Some(template), Some(caps)) => {
                    let mut name = String::new();
                    caps.expand(template, &mut name);
                    name
                }
                // No lib pattern, so no captures: the template stands.
                (Some(template), None) => template.clone(),
                (None, _) => lib.to_string(),
            };
            return Some((idx, working_name));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_rule(rtld: VariantFilter, lib: Option<&str>, dependent: Option<&str>) -> Rule {
        Rule {
            cond: Condition {
                rtld,
                lib: lib.map(|p| compile_full_match(p).unwrap()),
                dependent_lib: dependent.map(|p| compile_full_match(p).unwrap()),
            },
            rename: None,
            rpath: None,
            runpath: None,
            libpath: None,
            config: None,
            default: None,
        }
    }

    #[test]
    fn first_match_wins() {
        let store = RuleStore::new(vec![
            plain_rule(VariantFilter::Any, Some(r"libz\.so.*"), None),
            plain_rule(VariantFilter::Any, Some(r"lib.*"), None),
        ]);
        let (idx, _) = store
            .select(LoaderVariant::Normal, "libz.so.1", "/")
            .unwrap();
        assert_eq!(idx, 0);
        let (idx, _) = store
            .select(LoaderVariant::Normal, "libcrypto.so.3", "/")
            .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn patterns_match_whole_string() {
        let store = RuleStore::new(vec![plain_rule(VariantFilter::Any, Some(r"libz\.so"), None)]);
        assert!(store
            .select(LoaderVariant::Normal, "libz.so.1", "/")
            .is_none());
        assert!(store.select(LoaderVariant::Normal, "libz.so", "/").is_some());
    }

    #[test]
    fn variant_condition_is_honored() {
        let store = RuleStore::new(vec![plain_rule(VariantFilter::Nix, None, None)]);
        assert!(store.select(LoaderVariant::Nix, "libm.so.6", "/").is_some());
        assert!(store
            .select(LoaderVariant::Normal, "libm.so.6", "/")
            .is_none());
    }

    #[test]
    fn dependent_condition_is_honored() {
        let store = RuleStore::new(vec![plain_rule(
            VariantFilter::Any,
            None,
            Some(r"/opt/app/.*"),
        )]);
        assert!(store
            .select(LoaderVariant::Normal, "libm.so.6", "/opt/app/bin/app")
            .is_some());
        assert!(store
            .select(LoaderVariant::Normal, "libm.so.6", "/usr/bin/app")
            .is_none());
    }

    #[test]
    fn rename_expands_captures() {
        let mut rule = plain_rule(VariantFilter::Any, Some(r"libfoo\.so\.(\d+)"), None);
        rule.rename = Some("libfoo-shim.so.$1".to_string());
        let store = RuleStore::new(vec![rule]);

        let (_, working) = store
            .select(LoaderVariant::Normal, "libfoo.so.2", "/")
            .unwrap();
        assert_eq!(working, "libfoo-shim.so.2");
    }

    #[test]
    fn rename_without_lib_pattern_is_literal() {
        let mut rule = plain_rule(VariantFilter::Any, None, None);
        rule.rename = Some("libshim.so".to_string());
        let store = RuleStore::new(vec![rule]);

        let (_, working) = store
            .select(LoaderVariant::Normal, "libanything.so", "/")
            .unwrap();
        assert_eq!(working, "libshim.so");
    }

    #[test]
    fn no_rename_keeps_requested_name() {
        let store = RuleStore::new(vec![plain_rule(VariantFilter::Any, Some(r"lib.*"), None)]);
        let (_, working) = store
            .select(LoaderVariant::Normal, "libm.so.6", "/")
            .unwrap();
        assert_eq!(working, "libm.so.6");
    }
}
