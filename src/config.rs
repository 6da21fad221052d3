// Configuration document parsing.
//
// The document is YAML: a log level plus an ordered rule list.  Parsing
// is two-stage: serde mirrors the document shape, then the patterns are
// compiled.  The key sets are closed, so a typo in a rule, block, or
// directive fails the load as a configuration error instead of silently
// never matching.

use std::fmt;
use std::path::Path;

use log::LevelFilter;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::error::Error;
use crate::phase::{BlockName, VariantFilter};
use crate::rules::{compile_full_match, Condition, Filter, PhaseBlock, Prepend, Rule, RuleStore};

pub struct Config {
    pub log_level: LevelFilter,
    pub rules: RuleStore,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    cond: RawCondition,
    rename: Option<String>,
    rpath: Option<RawBlock>,
    runpath: Option<RawBlock>,
    libpath: Option<RawBlock>,
    config: Option<RawBlock>,
    default: Option<RawBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCondition {
    rtld: Option<VariantFilter>,
    lib: Option<String>,
    dependent_lib: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBlock {
    #[serde(default)]
    prepend: Vec<RawPrepend>,
    #[serde(default)]
    filter: Vec<RawFilter>,
    #[serde(default)]
    save: bool,
}

#[derive(Debug)]
enum RawPrepend {
    Saved(BlockName),
    File(String),
    Dir(String),
}

// Each directive is written as a single-key map in the document
// (`saved: <block>`, `file: <path>`, `dir: <path>`); the key selects the
// variant and its value carries the payload.
impl<'de> Deserialize<'de> for RawPrepend {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawPrependVisitor;

        impl<'de> Visitor<'de> for RawPrependVisitor {
            type Value = RawPrepend;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-key map: saved, file, or dir")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawPrepend, A::Error> {
                let key: String = match map.next_key()? {
                    Some(key) => key,
                    None => return Err(de::Error::invalid_length(0, &self)),
                };
                let value = match key.as_str() {
                    "saved" => RawPrepend::Saved(map.next_value()?),
                    "file" => RawPrepend::File(map.next_value()?),
                    "dir" => RawPrepend::Dir(map.next_value()?),
                    other => {
                        return Err(de::Error::unknown_field(other, &["saved", "file", "dir"]))
                    }
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("expected a single-key map"));
                }
                Ok(value)
            }
        }

        deserializer.deserialize_map(RawPrependVisitor)
    }
}

#[derive(Debug)]
enum RawFilter {
    Include(String),
    Exclude(String),
}

// As with `RawPrepend`, a filter is a single-key map (`include: <regex>`
// or `exclude: <regex>`).
impl<'de> Deserialize<'de> for RawFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawFilterVisitor;

        impl<'de> Visitor<'de> for RawFilterVisitor {
            type Value = RawFilter;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-key map: include or exclude")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawFilter, A::Error> {
                let key: String = match map.next_key()? {
                    Some(key) => key,
                    None => return Err(de::Error::invalid_length(0, &self)),
                };
                let value = match key.as_str() {
                    "include" => RawFilter::Include(map.next_value()?),
                    "exclude" => RawFilter::Exclude(map.next_value()?),
                    other => return Err(de::Error::unknown_field(other, &["include", "exclude"])),
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("expected a single-key map"));
                }
                Ok(value)
            }
        }

        deserializer.deserialize_map(RawFilterVisitor)
    }
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
    let data = std::fs::read_to_string(path)?;
    parse(&data)
}

pub fn parse(data: &str) -> Result<Config, Error> {
    let raw: RawDocument = serde_yaml::from_str(data)?;

    let log_level = match &raw.log_level {
        Some(level) => level
            .parse::<LevelFilter>()
            .map_err(|_| Error::BadLogLevel(level.clone()))?,
        None => LevelFilter::Warn,
    };

    let mut rules = Vec::with_capacity(raw.rules.len());
    for rule in raw.rules {
        rules.push(compile_rule(rule)?);
    }

    Ok(Config {
        log_level,
        rules: RuleStore::new(rules),
    })
}

fn compile_rule(raw: RawRule) -> Result<Rule, Error> {
    Ok(Rule {
        cond: Condition {
            rtld: raw.cond.rtld.unwrap_or_default(),
            lib: raw.cond.lib.as_deref().map(compile_full_match).transpose()?,
            dependent_lib: raw
                .cond
                .dependent_lib
                .as_deref()
                .map(compile_full_match)
                .transpose()?,
        },
        rename: raw.rename,
        rpath: raw.rpath.map(compile_block).transpose()?,
        runpath: raw.runpath.map(compile_block).transpose()?,
        libpath: raw.libpath.map(compile_block).transpose()?,
        config: raw.config.map(compile_block).transpose()?,
        default: raw.default.map(compile_block).transpose()?,
    })
}

fn compile_block(raw: RawBlock) -> Result<PhaseBlock, Error> {
    let prepend = raw
        .prepend
        .into_iter()
        .map(|p| match p {
            RawPrepend::Saved(name) => Prepend::Saved(name),
            RawPrepend::File(path) => Prepend::File(path),
            RawPrepend::Dir(dir) => Prepend::Dir(dir),
        })
        .collect();

    let filter = raw
        .filter
        .into_iter()
        .map(|f| {
            Ok(match f {
                RawFilter::Include(p) => Filter::Include(compile_full_match(&p)?),
                RawFilter::Exclude(p) => Filter::Exclude(compile_full_match(&p)?),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(PhaseBlock {
        prepend,
        filter,
        save: raw.save,
    })
}
