//! DNS chain state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageHealth {
    #[default]
    Unknown,
    Healthy,
    Failed,
}

/// One resolver process in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStage {
    pub name: String,
    pub listen_port: u16,
    /// Upstreams as understood by the resolver (`tls://1.1.1.1`, `127.0.0.1:5354`, ...)
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub health: StageHealth,
}

/// Single resolver, or a cascade where each stage forwards to the next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DnsMode {
    Single { resolver: ResolverStage },
    Chain { stages: Vec<ResolverStage> },
}

impl DnsMode {
    pub fn stages(&self) -> &[ResolverStage] {
        match self {
            DnsMode::Single { resolver } => std::slice::from_ref(resolver),
            DnsMode::Chain { stages } => stages,
        }
    }

    fn stages_mut(&mut self) -> &mut [ResolverStage] {
        match self {
            DnsMode::Single { resolver } => std::slice::from_mut(resolver),
            DnsMode::Chain { stages } => stages,
        }
    }

    /// Port clients (and the canary) query
    pub fn entry_port(&self) -> Option<u16> {
        self.stages().first().map(|s| s.listen_port)
    }

    pub fn label(&self) -> String {
        let names: Vec<&str> = self.stages().iter().map(|s| s.name.as_str()).collect();
        match self {
            DnsMode::Single { .. } => format!("single({})", names.join("")),
            DnsMode::Chain { .. } => format!("chain({})", names.join(" -> ")),
        }
    }

    /// Structural checks before anything is touched
    pub fn validate(&self) -> Result<(), String> {
        let stages = self.stages();
        if stages.is_empty() {
            return Err("a chain needs at least one stage".to_string());
        }
        let mut ports: Vec<u16> = stages.iter().map(|s| s.listen_port).collect();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != stages.len() {
            return Err("stages must listen on distinct ports".to_string());
        }
        if ports.contains(&0) {
            return Err("listen port 0 is not allowed".to_string());
        }
        let mut names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != stages.len() || names.iter().any(|n| n.is_empty()) {
            return Err("stage names must be unique and non-empty".to_string());
        }
        if let Some(last) = stages.last() {
            if last.upstreams.is_empty() {
                return Err(format!("stage '{}' has no upstreams", last.name));
            }
        }
        Ok(())
    }

    /// Stages as they must run: every stage but the last forwards to the
    /// next stage's listen port.
    pub fn wired(&self) -> Vec<ResolverStage> {
        let stages = self.stages();
        stages
            .iter()
            .enumerate()
            .map(|(i, stage)| match stages.get(i + 1) {
                Some(next) => ResolverStage {
                    upstreams: vec![format!("127.0.0.1:{}", next.listen_port)],
                    ..stage.clone()
                },
                None => stage.clone(),
            })
            .collect()
    }

    /// Set the health of the stage called `name`; false if there is none
    pub fn set_stage_health(&mut self, name: &str, health: StageHealth) -> bool {
        match self.stages_mut().iter_mut().find(|s| s.name == name) {
            Some(stage) => {
                stage.health = health;
                true
            }
            None => false,
        }
    }

    pub(crate) fn with_health(mut self, health: StageHealth) -> Self {
        for stage in self.stages_mut() {
            stage.health = health;
        }
        self
    }
}

/// Authoritative DNS state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DnsChainState {
    /// Active mode; `None` until the first successful switch
    pub mode: Option<DnsMode>,
    /// Rollback target
    pub last_known_good: Option<DnsMode>,
    pub switched_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, port: u16, upstream: &str) -> ResolverStage {
        ResolverStage {
            name: name.into(),
            listen_port: port,
            upstreams: vec![upstream.into()],
            health: StageHealth::Unknown,
        }
    }

    #[test]
    fn test_chain_wiring() {
        let mode = DnsMode::Chain {
            stages: vec![
                stage("adblock", 5353, "ignored"),
                stage("dnscrypt", 5354, "sdns://example"),
            ],
        };
        let wired = mode.wired();
        assert_eq!(wired[0].upstreams, vec!["127.0.0.1:5354".to_string()]);
        assert_eq!(wired[1].upstreams, vec!["sdns://example".to_string()]);
        assert_eq!(mode.entry_port(), Some(5353));
        assert_eq!(mode.label(), "chain(adblock -> dnscrypt)");
    }

    #[test]
    fn test_validation() {
        assert!(DnsMode::Chain { stages: vec![] }.validate().is_err());
        let dup = DnsMode::Chain {
            stages: vec![stage("a", 5353, "x"), stage("b", 5353, "y")],
        };
        assert!(dup.validate().is_err());
        let ok = DnsMode::Single {
            resolver: stage("doh", 5353, "https://1.1.1.1/dns-query"),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_mode_serde_tag() {
        let mode = DnsMode::Single {
            resolver: stage("doh", 5353, "https://1.1.1.1/dns-query"),
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "single");
        assert_eq!(json["resolver"]["listen_port"], 5353);
    }
}
