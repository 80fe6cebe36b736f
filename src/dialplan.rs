// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The seam towards the host's dialplan. The engine only ever asks four
//! questions about a local context and expands destination templates; the
//! pattern-matching machinery itself lives with the host.

use std::collections::HashMap;

/// Probes the engine runs against a local dialplan context when evaluating
/// a mapping. Implementations are assumed synchronous and are only called
/// from worker tasks, never from the network loop.
pub trait Dialplan: Send + Sync {
    /// An exact extension match exists.
    fn exists(&self, context: &str, number: &str) -> bool;
    /// A partial or exact match exists.
    fn canmatch(&self, context: &str, number: &str) -> bool;
    /// A partial match exists that needs more digits.
    fn matchmore(&self, context: &str, number: &str) -> bool;
    /// The context keeps dialtone on this prefix.
    fn ignore_pattern(&self, context: &str, number: &str) -> bool;
    /// Every extension of a context, for seeding full precache runs.
    /// Hosts without enumerable contexts may leave this empty.
    fn extensions(&self, _context: &str) -> Vec<String> {
        Vec::new()
    }
}

/// A literal extension table, enough for tests and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct StaticDialplan {
    contexts: HashMap<String, Vec<String>>,
    ignore_prefixes: HashMap<String, Vec<String>>,
}

impl StaticDialplan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_extension(&mut self, context: &str, exten: &str) -> &mut Self {
        self.contexts
            .entry(context.to_string())
            .or_default()
            .push(exten.to_string());
        self
    }

    pub fn add_ignore_prefix(&mut self, context: &str, prefix: &str) -> &mut Self {
        self.ignore_prefixes
            .entry(context.to_string())
            .or_default()
            .push(prefix.to_string());
        self
    }

    fn extens(&self, context: &str) -> &[String] {
        self.contexts.get(context).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Dialplan for StaticDialplan {
    fn exists(&self, context: &str, number: &str) -> bool {
        self.extens(context).iter().any(|e| e == number)
    }

    fn canmatch(&self, context: &str, number: &str) -> bool {
        self.extens(context).iter().any(|e| e.starts_with(number))
    }

    fn matchmore(&self, context: &str, number: &str) -> bool {
        self.extens(context)
            .iter()
            .any(|e| e.starts_with(number) && e != number)
    }

    fn ignore_pattern(&self, context: &str, number: &str) -> bool {
        self.ignore_prefixes
            .get(context)
            .is_some_and(|ps| ps.iter().any(|p| number.starts_with(p.as_str())))
    }

    fn extensions(&self, context: &str) -> Vec<String> {
        self.extens(context).to_vec()
    }
}

/// Variables available to a mapping's destination template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub number: &'a str,
    pub eid: &'a str,
    pub secret: &'a str,
    pub ipaddr: &'a str,
}

/// Expands `${NUMBER}`, `${EID}`, `${SECRET}` and `${IPADDR}` in a
/// destination template. Unknown variables expand to nothing.
pub fn expand_template(template: &str, vars: TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        match &after[..end] {
            "NUMBER" => out.push_str(vars.number),
            "EID" => out.push_str(vars.eid),
            "SECRET" => out.push_str(vars.secret),
            "IPADDR" => out.push_str(vars.ipaddr),
            _ => {},
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
