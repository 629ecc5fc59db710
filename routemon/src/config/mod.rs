use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::queue::QueueOptions;

/// Longest peer -> group -> parent chain a resolver will walk.
pub const MAX_GROUP_CHAIN: usize = 4;

pub const BGP_PORT: u16 = 179;
pub const DEFAULT_HOLD_TIME: u16 = 180;
pub const DEFAULT_BGP_VERSION: u8 = 4;

/// What the labeling module does with a session's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelAction {
    NoAction,
    #[default]
    Label,
    StoreRibOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Require,
    Refuse,
}

/// A capability announced in our OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceCapability {
    pub code: u8,
    pub value: Vec<u8>,
}

/// A rule against a capability the peer announces. `value: None` matches
/// any value of the code; a concrete value matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRule {
    pub action: RuleAction,
    pub code: u8,
    pub value: Option<Vec<u8>>,
}

const fn unset_int() -> i64 {
    -1
}

/// One peer or peer-group stanza. Integer fields use the sentinel `-1`
/// for "unset", text fields the empty string; unset inherits through the
/// group chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerStanza {
    pub name: String,
    pub group: String,
    pub remote_addr: String,
    pub remote_port: i64,
    pub remote_as: i64,
    pub remote_bgp_id: String,
    pub remote_bgp_version: i64,
    pub remote_hold_time: i64,
    pub local_addr: String,
    pub local_port: i64,
    pub local_as: i64,
    pub local_bgp_id: String,
    pub md5_password: String,
    pub label_action: String,
    pub route_refresh_action: i64,
    pub enabled: i64,
    pub announce: Vec<CapabilityStanza>,
    pub receive: Vec<RequirementStanza>,
}

impl Default for PeerStanza {
    fn default() -> Self {
        Self {
            name: String::new(),
            group: String::new(),
            remote_addr: String::new(),
            remote_port: unset_int(),
            remote_as: unset_int(),
            remote_bgp_id: String::new(),
            remote_bgp_version: unset_int(),
            remote_hold_time: unset_int(),
            local_addr: String::new(),
            local_port: unset_int(),
            local_as: unset_int(),
            local_bgp_id: String::new(),
            md5_password: String::new(),
            label_action: String::new(),
            route_refresh_action: unset_int(),
            enabled: unset_int(),
            announce: Vec::new(),
            receive: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityStanza {
    pub code: u8,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequirementStanza {
    pub action: String,
    pub code: u8,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub router_id: String,
    pub local_as: i64,
    pub max_peers: usize,
    pub max_peer_groups: usize,
    pub max_sessions: usize,
    pub supervisor_interval: u64,
    pub dead_interval: i64,
    pub status_interval: u64,
    pub prefix_buckets: usize,
    pub attr_buckets: usize,
    pub max_bucket_collisions: usize,
    pub rib_dump_seconds: u64,
    /// Period between RIB snapshots to subscribers; 0 disables them.
    pub rib_dump_interval: u64,
    /// Period between route-refresh requests on willing sessions; 0
    /// disables them.
    pub route_refresh_interval: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            router_id: "127.0.0.1".into(),
            local_as: unset_int(),
            max_peers: 64,
            max_peer_groups: 16,
            max_sessions: 128,
            supervisor_interval: 5,
            dead_interval: 30,
            status_interval: 15,
            prefix_buckets: 1021,
            attr_buckets: 1021,
            max_bucket_collisions: 128,
            rib_dump_seconds: 120,
            rib_dump_interval: 0,
            route_refresh_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MrtConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub listen_port: u16,
    pub label_action: String,
}

impl Default for MrtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0".into(),
            listen_port: 7779,
            label_action: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub peer: QueueOptions,
    pub mrt: QueueOptions,
    pub labeled: QueueOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub queues: QueuesConfig,
    pub mrt: MrtConfig,
    pub peer_groups: Vec<PeerStanza>,
    pub default_group: String,
    pub peers: Vec<PeerStanza>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Option<&PeerStanza> {
        if name.is_empty() {
            return None;
        }
        self.peer_groups.iter().find(|g| g.name == name)
    }

    /// Resolve one peer's effective configuration by walking the group
    /// chain and the default group, first set value wins per field.
    pub fn resolve_peer(&self, peer: &PeerStanza) -> Result<ResolvedPeer> {
        let chain = self.stanza_chain(peer);
        resolve_chain(&chain, &self.global)
    }

    /// peer -> group -> parent... -> default group, bounded, cycle-safe.
    fn stanza_chain<'a>(&'a self, peer: &'a PeerStanza) -> Vec<&'a PeerStanza> {
        let mut chain = vec![peer];
        let mut seen: HashSet<&str> = HashSet::new();
        let mut next = peer.group.as_str();
        while !next.is_empty() && chain.len() <= MAX_GROUP_CHAIN {
            if !seen.insert(next) {
                warn!("peer {}: peer-group cycle at {}", peer.name, next);
                break;
            }
            let Some(group) = self.group(next) else {
                warn!("peer {}: peer-group {} not found", peer.name, next);
                break;
            };
            chain.push(group);
            next = group.group.as_str();
        }
        if !self.default_group.is_empty() && !seen.contains(self.default_group.as_str()) {
            if let Some(default) = self.group(&self.default_group) {
                if !std::ptr::eq(default, peer) {
                    chain.push(default);
                }
            }
        }
        chain
    }
}

/// A peer's configuration-in-use: every field resolved, snapshotted into
/// the session at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPeer {
    pub peer_name: String,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub remote_as: u32,
    pub remote_bgp_id: Option<Ipv4Addr>,
    pub bgp_version: u8,
    pub hold_time: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub local_as: u32,
    pub local_bgp_id: Ipv4Addr,
    pub md5_password: Option<String>,
    pub label_action: LabelAction,
    pub route_refresh_action: bool,
    pub enabled: bool,
    pub announce: Vec<AnnounceCapability>,
    pub receive: Vec<CapabilityRule>,
}

fn first_int(chain: &[&PeerStanza], get: impl Fn(&PeerStanza) -> i64) -> Option<i64> {
    chain.iter().map(|s| get(s)).find(|v| *v != -1)
}

fn first_str<'a, F>(chain: &[&'a PeerStanza], get: F) -> Option<&'a str>
where
    F: Fn(&'a PeerStanza) -> &'a str,
{
    chain.iter().map(|s| get(s)).find(|v| !v.is_empty())
}

fn parse_label_action(text: &str) -> Result<LabelAction> {
    match text {
        "no-action" => Ok(LabelAction::NoAction),
        "label" => Ok(LabelAction::Label),
        "store-rib-only" => Ok(LabelAction::StoreRibOnly),
        other => Err(anyhow!("unknown label action {:?}", other)),
    }
}

pub fn parse_rule_action(text: &str) -> Result<RuleAction> {
    match text {
        "allow" => Ok(RuleAction::Allow),
        "require" => Ok(RuleAction::Require),
        "refuse" => Ok(RuleAction::Refuse),
        other => Err(anyhow!("unknown capability rule action {:?}", other)),
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).map_err(|_| anyhow!("bad hex value {:?}", text))
}

fn resolve_chain(chain: &[&PeerStanza], global: &GlobalConfig) -> Result<ResolvedPeer> {
    let peer = chain[0];
    let name = if peer.name.is_empty() {
        peer.remote_addr.clone()
    } else {
        peer.name.clone()
    };

    let remote_addr = first_str(chain, |s| &s.remote_addr)
        .ok_or_else(|| anyhow!("peer {}: remote_addr is required", name))?
        .parse::<IpAddr>()
        .with_context(|| format!("peer {}: remote_addr", name))?;
    let remote_as = first_int(chain, |s| s.remote_as)
        .ok_or_else(|| anyhow!("peer {}: remote_as is required", name))?;
    let local_as = first_int(chain, |s| s.local_as).unwrap_or(global.local_as);
    if local_as == -1 {
        return Err(anyhow!("peer {}: local_as is required", name));
    }

    let local_addr = match first_str(chain, |s| &s.local_addr) {
        Some(text) => text
            .parse::<IpAddr>()
            .with_context(|| format!("peer {}: local_addr", name))?,
        None => match remote_addr {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        },
    };
    let local_bgp_id = match first_str(chain, |s| &s.local_bgp_id) {
        Some(text) => text
            .parse::<Ipv4Addr>()
            .with_context(|| format!("peer {}: local_bgp_id", name))?,
        None => global
            .router_id
            .parse::<Ipv4Addr>()
            .context("global router_id")?,
    };
    let remote_bgp_id = match first_str(chain, |s| &s.remote_bgp_id) {
        Some(text) => Some(
            text.parse::<Ipv4Addr>()
                .with_context(|| format!("peer {}: remote_bgp_id", name))?,
        ),
        None => None,
    };

    let label_action = match first_str(chain, |s| &s.label_action) {
        Some(text) => parse_label_action(text)?,
        None => LabelAction::default(),
    };

    let mut announce = Vec::new();
    for stanza in chain.iter() {
        for cap in stanza.announce.iter() {
            let value = decode_hex(&cap.value)?;
            let entry = AnnounceCapability {
                code: cap.code,
                value,
            };
            if !announce.contains(&entry) {
                announce.push(entry);
            }
        }
    }
    let mut receive = Vec::new();
    for stanza in chain.iter() {
        for req in stanza.receive.iter() {
            let value = match &req.value {
                Some(text) => Some(decode_hex(text)?),
                None => None,
            };
            let rule = CapabilityRule {
                action: parse_rule_action(&req.action)?,
                code: req.code,
                value,
            };
            if !receive.contains(&rule) {
                receive.push(rule);
            }
        }
    }

    Ok(ResolvedPeer {
        peer_name: name.clone(),
        remote_addr,
        remote_port: first_int(chain, |s| s.remote_port).unwrap_or(BGP_PORT as i64) as u16,
        remote_as: remote_as as u32,
        remote_bgp_id,
        bgp_version: first_int(chain, |s| s.remote_bgp_version)
            .unwrap_or(DEFAULT_BGP_VERSION as i64) as u8,
        hold_time: first_int(chain, |s| s.remote_hold_time).unwrap_or(DEFAULT_HOLD_TIME as i64)
            as u16,
        local_addr,
        local_port: first_int(chain, |s| s.local_port).unwrap_or(0) as u16,
        local_as: local_as as u32,
        local_bgp_id,
        md5_password: first_str(chain, |s| &s.md5_password).map(|s| s.to_string()),
        label_action,
        route_refresh_action: first_int(chain, |s| s.route_refresh_action).unwrap_or(0) != 0,
        enabled: first_int(chain, |s| s.enabled).unwrap_or(1) != 0,
        announce,
        receive,
    })
}

impl ResolvedPeer {
    /// Synthetic configuration for an MRT-backed session; only the label
    /// action and the identifying tuple are meaningful.
    pub fn mrt_synthetic(
        remote_as: u32,
        remote_addr: IpAddr,
        collector_addr: IpAddr,
        label_action: LabelAction,
    ) -> Self {
        Self {
            peer_name: format!("mrt-{}-{}", remote_as, remote_addr),
            remote_addr,
            remote_port: 0,
            remote_as,
            remote_bgp_id: None,
            bgp_version: DEFAULT_BGP_VERSION,
            hold_time: 0,
            local_addr: collector_addr,
            local_port: 0,
            local_as: 0,
            local_bgp_id: Ipv4Addr::UNSPECIFIED,
            md5_password: None,
            label_action,
            route_refresh_action: false,
            enabled: true,
            announce: Vec::new(),
            receive: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(text: &str) -> Config {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn sentinel_means_inherit() {
        let config = config_from(
            r#"
global:
  local_as: 65002
peer_groups:
  - name: upstream
    remote_hold_time: 90
peers:
  - name: r1
    group: upstream
    remote_addr: 192.0.2.1
    remote_as: 65001
"#,
        );
        let resolved = config.resolve_peer(&config.peers[0]).unwrap();
        assert_eq!(resolved.remote_as, 65001);
        assert_eq!(resolved.local_as, 65002);
        assert_eq!(resolved.hold_time, 90);
        assert_eq!(resolved.remote_port, BGP_PORT);
        assert!(resolved.enabled);
    }

    #[test]
    fn peer_value_wins_over_group() {
        let config = config_from(
            r#"
peer_groups:
  - name: upstream
    remote_hold_time: 90
    local_as: 65002
peers:
  - name: r1
    group: upstream
    remote_addr: 192.0.2.1
    remote_as: 65001
    remote_hold_time: 30
"#,
        );
        let resolved = config.resolve_peer(&config.peers[0]).unwrap();
        assert_eq!(resolved.hold_time, 30);
    }

    #[test]
    fn default_group_is_last_resort() {
        let config = config_from(
            r#"
default_group: defaults
peer_groups:
  - name: defaults
    local_as: 65002
    remote_hold_time: 45
  - name: upstream
    remote_hold_time: 90
peers:
  - name: r1
    group: upstream
    remote_addr: 192.0.2.1
    remote_as: 65001
"#,
        );
        let resolved = config.resolve_peer(&config.peers[0]).unwrap();
        assert_eq!(resolved.hold_time, 90);
        assert_eq!(resolved.local_as, 65002);
    }

    #[test]
    fn group_cycle_is_detected() {
        let config = config_from(
            r#"
peer_groups:
  - name: a
    group: b
  - name: b
    group: a
    local_as: 65002
peers:
  - name: r1
    group: a
    remote_addr: 192.0.2.1
    remote_as: 65001
"#,
        );
        // The walk must terminate and still resolve what it saw.
        let resolved = config.resolve_peer(&config.peers[0]).unwrap();
        assert_eq!(resolved.local_as, 65002);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let config = config_from(
            r#"
peers:
  - name: r1
    remote_addr: 192.0.2.1
"#,
        );
        assert!(config.resolve_peer(&config.peers[0]).is_err());
    }

    #[test]
    fn capability_rules_merge_across_chain() {
        let config = config_from(
            r#"
global:
  local_as: 65002
peer_groups:
  - name: upstream
    receive:
      - action: require
        code: 1
        value: "00010001"
peers:
  - name: r1
    group: upstream
    remote_addr: 192.0.2.1
    remote_as: 65001
    receive:
      - action: refuse
        code: 128
"#,
        );
        let resolved = config.resolve_peer(&config.peers[0]).unwrap();
        assert_eq!(resolved.receive.len(), 2);
        assert_eq!(resolved.receive[0].action, RuleAction::Refuse);
        assert_eq!(resolved.receive[1].action, RuleAction::Require);
        assert_eq!(resolved.receive[1].value.as_deref(), Some(&[0, 1, 0, 1][..]));
    }

    #[test]
    fn label_action_parses() {
        assert_eq!(parse_label_action("label").unwrap(), LabelAction::Label);
        assert_eq!(
            parse_label_action("store-rib-only").unwrap(),
            LabelAction::StoreRibOnly
        );
        assert!(parse_label_action("bogus").is_err());
    }
}
