// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::dialplan::{Dialplan, StaticDialplan, TemplateVars, expand_template};

fn plan() -> StaticDialplan {
    let mut plan = StaticDialplan::new();
    plan.add_extension("local", "4155551212")
        .add_extension("local", "4155559999")
        .add_extension("local", "911")
        .add_ignore_prefix("local", "9");
    plan
}

#[test]
fn exists_is_exact() {
    let plan = plan();
    assert!(plan.exists("local", "4155551212"));
    assert!(!plan.exists("local", "415555"));
    assert!(!plan.exists("other", "4155551212"));
}

#[test]
fn canmatch_accepts_partial_or_exact() {
    let plan = plan();
    assert!(plan.canmatch("local", "415"));
    assert!(plan.canmatch("local", "4155551212"));
    assert!(!plan.canmatch("local", "510"));
}

#[test]
fn matchmore_needs_more_digits() {
    let plan = plan();
    assert!(plan.matchmore("local", "415555"));
    assert!(!plan.matchmore("local", "4155551212"));
}

#[test]
fn ignore_pattern_is_prefix_based() {
    let plan = plan();
    assert!(plan.ignore_pattern("local", "911"));
    assert!(!plan.ignore_pattern("local", "411"));
}

#[test]
fn extensions_enumerate_a_context() {
    let plan = plan();
    assert_eq!(plan.extensions("local").len(), 3);
    assert!(plan.extensions("missing").is_empty());
}

#[test]
fn template_expansion() {
    let vars = TemplateVars {
        number: "4155551212",
        eid: "00:50:8b:ae:43:32",
        secret: "s3cret",
        ipaddr: "10.1.2.3",
    };
    assert_eq!(
        expand_template("IAX2/priv:${SECRET}@${IPADDR}/${NUMBER}", vars),
        "IAX2/priv:s3cret@10.1.2.3/4155551212"
    );
    assert_eq!(expand_template("${EID}", vars), "00:50:8b:ae:43:32");
    // Unknown variables vanish, unterminated ones stay literal.
    assert_eq!(expand_template("a${NOPE}b", vars), "ab");
    assert_eq!(expand_template("a${NUMBER", vars), "a${NUMBER");
    assert_eq!(expand_template("plain", vars), "plain");
}
