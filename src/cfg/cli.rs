// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Canonicalizes a config path relative to the current working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Splits a `number[@context]` argument the way the lookup tooling writes
/// it; the context defaults to `e164` downstream when absent.
pub fn split_number_context(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('@') {
        Some((number, context)) if !context.is_empty() => (number, Some(context)),
        Some((number, _)) => (number, None),
        None => (arg, None),
    }
}
