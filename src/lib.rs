// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cache;
pub mod cfg;
pub mod crypto;
pub mod dialplan;
pub mod engine;
pub mod models;
pub mod peer;
pub mod precache;
pub mod request;
pub mod store;
pub mod utils;

pub use crate::{
    dialplan::{Dialplan, StaticDialplan},
    engine::{Engine, LookupOptions},
    models::Eid,
    request::{EntityInfo, LookupResult},
    store::Store,
};
