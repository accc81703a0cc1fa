// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
//
// Picks the options we care about out of a launcher command line and
// leaves everything else alone, in the original order, so that it can
// be handed back to the underlying launcher untouched.
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKind {
    Value,
    Flag,
}

#[derive(Debug, Clone, Copy)]
pub struct OptSpec {
    pub dest: &'static str,
    pub names: &'static [&'static str],
    pub kind: OptKind,
}

impl OptSpec {
    pub const fn value(dest: &'static str, names: &'static [&'static str]) -> Self {
        Self {
            dest,
            names,
            kind: OptKind::Value,
        }
    }

    pub const fn flag(dest: &'static str, names: &'static [&'static str]) -> Self {
        Self {
            dest,
            names,
            kind: OptKind::Flag,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ParsedOpts {
    values: BTreeMap<&'static str, String>,
    flags: BTreeSet<&'static str>,
    pub unparsed: Vec<String>,
}

impl ParsedOpts {
    pub fn value(&self, dest: &str) -> Option<&str> {
        self.values.get(dest).map(|x| x.as_str())
    }

    pub fn owned(&self, dest: &str) -> Option<String> {
        self.values.get(dest).cloned()
    }

    pub fn int(&self, dest: &str) -> Result<Option<usize>> {
        match self.values.get(dest) {
            Some(v) => Ok(Some(v.trim().parse::<usize>().with_context(|| {
                format!("option {:?} expects an integer, got {:?}", dest, v)
            })?)),
            None => Ok(None),
        }
    }

    pub fn flag(&self, dest: &str) -> bool {
        self.flags.contains(dest)
    }
}

enum Matched<'a> {
    Exact(&'a OptSpec, &'a str),
    Inline(&'a OptSpec, &'a str, String),
}

fn match_opt<'a>(specs: &'a [OptSpec], arg: &str) -> Option<Matched<'a>> {
    for spec in specs.iter() {
        for name in spec.names.iter() {
            if arg == *name {
                return Some(Matched::Exact(spec, name));
            }
            if name.starts_with("--") && arg.starts_with(name) && arg[name.len()..].starts_with('=')
            {
                return Some(Matched::Inline(spec, name, arg[name.len() + 1..].to_string()));
            }
        }
    }

    // "-n4" style, only for single letter options and only after all
    // exact matches failed so that e.g. "-np" isn't read as "-n p".
    if arg.starts_with("--") {
        return None;
    }
    for spec in specs.iter().filter(|s| s.kind == OptKind::Value) {
        for name in spec.names.iter().filter(|n| n.len() == 2) {
            if arg.len() > 2 && arg.starts_with(name) {
                return Some(Matched::Inline(spec, name, arg[2..].to_string()));
            }
        }
    }
    None
}

/// Parse the options described by `specs` out of `argv`. Parsing stops
/// at "--" which is kept along with everything after it. Repeated
/// options are last-wins.
pub fn parse_subset(specs: &[OptSpec], argv: &[String]) -> Result<ParsedOpts> {
    let mut parsed = ParsedOpts::default();
    let mut idx = 0;

    while idx < argv.len() {
        let arg = &argv[idx];
        if arg == "--" {
            parsed.unparsed.extend(argv[idx..].iter().cloned());
            break;
        }

        match match_opt(specs, arg) {
            Some(Matched::Exact(spec, name)) => match spec.kind {
                OptKind::Flag => {
                    parsed.flags.insert(spec.dest);
                }
                OptKind::Value => {
                    idx += 1;
                    match argv.get(idx) {
                        Some(v) => {
                            parsed.values.insert(spec.dest, v.clone());
                        }
                        None => bail!("option {} requires an argument", name),
                    }
                }
            },
            Some(Matched::Inline(spec, name, val)) => match spec.kind {
                OptKind::Flag => bail!("option {} does not take a value", name),
                OptKind::Value => {
                    parsed.values.insert(spec.dest, val);
                }
            },
            None => parsed.unparsed.push(arg.clone()),
        }
        idx += 1;
    }
    Ok(parsed)
}
