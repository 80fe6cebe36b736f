// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    cfg::enums::{
        AutokillSetting, MappingOption, ModelKind, PeerOrder, QualifySetting, TosSetting,
    },
    models::{DUNDI_PORT, Eid, Tech},
};

/// Default hop budget for new requests, and its configured upper bound.
pub const DEFAULT_TTL: u16 = 120;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Engine-wide settings plus local identity metadata.
    pub general: GeneralConfig,
    /// Externally advertised contexts mapped onto local dialplan probes.
    #[serde(default)]
    pub mappings: BTreeMap<String, Vec<MappingConfig>>,
    /// Remote peers keyed by their entity identifier.
    #[serde(default)]
    pub peers: BTreeMap<Eid, PeerConfig>,
    /// Literal extension tables for the demo binary's static dialplan.
    /// Real hosts plug in their own `Dialplan` and leave this empty.
    #[serde(default)]
    pub dialplan: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bindaddr")]
    pub bindaddr: IpAddr,
    /// Our entity identifier; generated at startup when absent.
    #[serde(default)]
    pub entityid: Option<Eid>,
    #[serde(default = "default_ttl")]
    pub ttl: u16,
    #[serde(default)]
    pub autokill: AutokillSetting,
    #[serde(default)]
    pub tos: TosSetting,
    #[serde(default)]
    pub authdebug: bool,
    #[serde(default)]
    pub storehistory: bool,
    /// Seconds a registration stays valid on the server side.
    #[serde(default = "default_expiration")]
    pub default_expiration: u32,
    /// Store family holding the rolling shared secret.
    #[serde(default = "default_secretpath")]
    pub secretpath: String,
    /// Directory holding `<name>.pub` / `<name>.key` RSA keys.
    #[serde(default)]
    pub keydir: Option<PathBuf>,
    /// Our address as handed to templates and entity queries; derived from
    /// the bound socket when absent.
    #[serde(default)]
    pub ipaddr: Option<String>,

    // Identity metadata served to entity queries.
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub stateprov: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            port: default_port(),
            bindaddr: default_bindaddr(),
            entityid: None,
            ttl: default_ttl(),
            autokill: AutokillSetting::default(),
            tos: TosSetting::default(),
            authdebug: false,
            storehistory: false,
            default_expiration: default_expiration(),
            secretpath: default_secretpath(),
            keydir: None,
            ipaddr: None,
            department: String::new(),
            organization: String::new(),
            locality: String::new(),
            stateprov: String::new(),
            country: String::new(),
            email: String::new(),
            phone: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig::default(),
            mappings: BTreeMap::new(),
            peers: BTreeMap::new(),
            dialplan: BTreeMap::new(),
        }
    }
}

fn default_port() -> u16 {
    DUNDI_PORT
}

fn default_bindaddr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_ttl() -> u16 {
    DEFAULT_TTL
}

fn default_expiration() -> u32 {
    60
}

fn default_secretpath() -> String {
    "dundi".to_string()
}

/// One dialplan exposure: `dcontext` (the map key) resolved by probing
/// `lcontext` and answering with the expanded destination template.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MappingConfig {
    pub lcontext: String,
    pub weight: u16,
    pub tech: Tech,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<MappingOption>,
}

/// How to reach a peer: `host:port` (or bare host on the default port),
/// or the literal `dynamic` for peers that register themselves.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct HostSetting(pub String);

impl Default for HostSetting {
    fn default() -> Self {
        HostSetting("dynamic".to_string())
    }
}

impl HostSetting {
    pub fn is_dynamic(&self) -> bool {
        self.0.eq_ignore_ascii_case("dynamic")
    }

    /// Resolves a static host to a socket address, defaulting the port.
    pub fn resolve(&self) -> Result<Option<SocketAddr>> {
        if self.is_dynamic() {
            return Ok(None);
        }
        let candidate = if self.0.contains(':') {
            self.0.clone()
        } else {
            format!("{}:{DUNDI_PORT}", self.0)
        };
        let addr = candidate
            .to_socket_addrs()
            .with_context(|| format!("unable to find host '{}'", self.0))?
            .next()
            .with_context(|| format!("unable to find host '{}'", self.0))?;
        Ok(Some(addr))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PeerConfig {
    #[serde(default)]
    pub host: HostSetting,
    #[serde(default)]
    pub inkey: Option<String>,
    #[serde(default)]
    pub outkey: Option<String>,
    /// The local EID presented to this peer (multi-identity hosts).
    #[serde(default)]
    pub ustothem: Option<Eid>,
    /// Ordered context list we may ask them about; `!name` denies.
    #[serde(default)]
    pub include: Vec<String>,
    /// Ordered context list they may ask us about; `!name` denies.
    #[serde(default)]
    pub permit: Vec<String>,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub order: PeerOrder,
    #[serde(default)]
    pub qualify: QualifySetting,
    #[serde(default)]
    pub model: ModelKind,
    #[serde(default)]
    pub precache: ModelKind,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())
            .with_context(|| format!("unable to load config {:?}", path.as_ref()))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and drops peers whose model combination can
    /// never be consulted, mirroring the config semantics of the wire
    /// protocol's reference deployment.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            (1..=DEFAULT_TTL).contains(&self.general.ttl),
            "ttl must be between 1 and {DEFAULT_TTL}"
        );
        ensure!(
            self.general.default_expiration >= 1,
            "default_expiration must be >= 1"
        );

        for (dcontext, maps) in &self.mappings {
            for map in maps {
                ensure!(
                    map.weight < 60000,
                    "invalid weight {} in mapping '{dcontext}/{}'",
                    map.weight,
                    map.lcontext
                );
                ensure!(
                    map.tech != Tech::None,
                    "mapping '{dcontext}/{}' needs a technology",
                    map.lcontext
                );
            }
        }

        let mut dropped = Vec::new();
        for (eid, peer) in &self.peers {
            let model = peer.model;
            let pcmodel = peer.precache;
            let inbound =
                matches!(model, ModelKind::Inbound | ModelKind::Symmetric);
            let outbound =
                matches!(model, ModelKind::Outbound | ModelKind::Symmetric);
            let pc_inbound =
                matches!(pcmodel, ModelKind::Inbound | ModelKind::Symmetric);
            let pc_outbound =
                matches!(pcmodel, ModelKind::Outbound | ModelKind::Symmetric);
            if model == ModelKind::None && pcmodel == ModelKind::None {
                warn!(peer = %eid, "peer lacks a model or precache model, discarding");
                dropped.push(*eid);
            } else if inbound && pc_outbound {
                warn!(peer = %eid,
                    "peer may not be both inbound model and outbound precache, discarding");
                dropped.push(*eid);
            } else if outbound && pc_inbound {
                warn!(peer = %eid,
                    "peer may not be both outbound model and inbound precache, discarding");
                dropped.push(*eid);
            } else if !peer.include.is_empty() && !outbound && !pc_inbound {
                warn!(peer = %eid,
                    "peer has include logic but isn't outbound or inbound-precache");
            } else if !peer.permit.is_empty() && !inbound && !pc_outbound {
                warn!(peer = %eid,
                    "peer has permit logic but isn't inbound or outbound-precache");
            }
            if (peer.inkey.is_some() || peer.outkey.is_some())
                && self.general.keydir.is_none()
            {
                warn!(peer = %eid, "peer names RSA keys but no keydir is configured");
            }
        }
        self.peers.retain(|eid, _| !dropped.contains(eid));
        Ok(())
    }

    /// True when any peer subscribes to our precache pushes, which makes
    /// startup seed the full precache queue.
    pub fn any_precache_outbound(&self) -> bool {
        self.peers.values().any(|p| {
            matches!(p.precache, ModelKind::Outbound | ModelKind::Symmetric)
        })
    }
}
