//! Firewall policy model and nftables rendering.

use serde::{Deserialize, Serialize};
use sentinel_protocols::Transport;
use std::fmt::{self, Write};

/// Name of the nftables table owned by the orchestrator
pub const TABLE: &str = "sentinel";

/// Packet mark for traffic that bypasses the VPN
pub const BYPASS_MARK: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Lan,
    Wan,
    Vpn,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Lan => f.write_str("lan"),
            Zone::Wan => f.write_str("wan"),
            Zone::Vpn => f.write_str("vpn"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDef {
    pub zone: Zone,
    /// Interface names; `*` wildcards allowed
    pub interfaces: Vec<String>,
}

/// Permitted zone-to-zone forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwarding {
    pub src: Zone,
    pub dest: Zone,
}

/// Base chains, in render order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Marking before routing
    Mangle,
    /// Destination NAT
    Dnat,
    Input,
    Forward,
    Output,
    /// Source NAT
    Snat,
}

impl Chain {
    pub fn name(&self) -> &'static str {
        match self {
            Chain::Mangle => "mangle",
            Chain::Dnat => "dnat",
            Chain::Input => "input",
            Chain::Forward => "forward",
            Chain::Output => "output",
            Chain::Snat => "snat",
        }
    }

    fn declaration(&self) -> &'static str {
        match self {
            Chain::Mangle => "type filter hook prerouting priority mangle; policy accept;",
            Chain::Dnat => "type nat hook prerouting priority dstnat; policy accept;",
            Chain::Input => "type filter hook input priority filter; policy drop;",
            Chain::Forward => "type filter hook forward priority filter; policy drop;",
            Chain::Output => "type filter hook output priority filter; policy accept;",
            Chain::Snat => "type nat hook postrouting priority srcnat; policy accept;",
        }
    }

    const ALL: [Chain; 6] = [
        Chain::Mangle,
        Chain::Dnat,
        Chain::Input,
        Chain::Forward,
        Chain::Output,
        Chain::Snat,
    ];
}

/// Precedence class inside a chain; lower sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Connection tracking, loopback, DNS lock-down, leak and flood protection
    Guard,
    /// Host and port
    Exact,
    /// Host or port
    Partial,
    /// Named address set
    Set,
    /// Interfaces only
    Zone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtState {
    New,
    Established,
    Related,
    Invalid,
}

impl CtState {
    fn as_str(&self) -> &'static str {
        match self {
            CtState::New => "new",
            CtState::Established => "established",
            CtState::Related => "related",
            CtState::Invalid => "invalid",
        }
    }
}

/// One match expression or side-effect statement of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum Match {
    InZone { zone: Zone },
    OutZone { zone: Zone },
    InLoopback,
    Family { family: Family },
    SrcAddr { addr: String },
    DstAddr { addr: String },
    NotDstAddr { addr: String },
    SrcSet { set: String, family: Family },
    DstSet { set: String, family: Family },
    DstPorts { transport: Transport, ports: Vec<u16> },
    Icmp { family: Family },
    CtState { states: Vec<CtState> },
    CtStatusDnat,
    MarkIs { mark: u32 },
    /// `limit rate over N/second burst B packets`
    RateOver { per_second: u32, burst: u32 },
    /// Per-source concurrent connection ceiling tracked in `set`
    ConnCountOver { set: String, count: u32 },
    /// Record the source address in `set` for `timeout_secs`
    AddSource { set: String, timeout_secs: u32 },
}

impl Match {
    fn names_host(&self) -> bool {
        matches!(
            self,
            Match::SrcAddr { .. } | Match::DstAddr { .. } | Match::NotDstAddr { .. }
        )
    }

    fn names_port(&self) -> bool {
        matches!(self, Match::DstPorts { .. })
    }

    fn names_set(&self) -> bool {
        matches!(self, Match::SrcSet { .. } | Match::DstSet { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
    Return,
    Dnat { addr: String, port: u16 },
    Redirect { port: u16 },
    Masquerade,
    SetMark { mark: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub chain: Chain,
    pub tier: Tier,
    pub matches: Vec<Match>,
    pub verdict: Verdict,
    pub comment: String,
}

impl Rule {
    /// Build a rule whose tier follows from what it matches on
    pub fn new(
        chain: Chain,
        matches: Vec<Match>,
        verdict: Verdict,
        comment: impl Into<String>,
    ) -> Self {
        let tier = classify(&matches);
        Self {
            chain,
            tier,
            matches,
            verdict,
            comment: comment.into(),
        }
    }

    /// Pin the rule ahead of everything else in its chain
    pub fn guard(mut self) -> Self {
        self.tier = Tier::Guard;
        self
    }
}

fn classify(matches: &[Match]) -> Tier {
    let host = matches.iter().any(Match::names_host);
    let port = matches.iter().any(Match::names_port);
    if host && port {
        Tier::Exact
    } else if host || port {
        Tier::Partial
    } else if matches.iter().any(Match::names_set) {
        Tier::Set
    } else {
        Tier::Zone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetKind {
    Ipv4,
    Ipv6,
}

/// Named nftables set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedSet {
    pub name: String,
    pub kind: SetKind,
    /// Prefixes allowed (`flags interval`)
    pub interval: bool,
    /// Filled at runtime by rules (`flags dynamic,timeout`)
    pub dynamic: bool,
    pub elements: Vec<String>,
}

/// A complete, self-contained ruleset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub zones: Vec<ZoneDef>,
    pub forwardings: Vec<Forwarding>,
    pub sets: Vec<NamedSet>,
    pub rules: Vec<Rule>,
}

impl FirewallPolicy {
    fn interfaces(&self, zone: Zone) -> Vec<&str> {
        self.zones
            .iter()
            .filter(|z| z.zone == zone)
            .flat_map(|z| z.interfaces.iter().map(String::as_str))
            .collect()
    }

    /// Render as one `nft -f` script that replaces the whole table
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Creating then deleting makes the first load succeed too
        let _ = writeln!(out, "table inet {TABLE}");
        let _ = writeln!(out, "delete table inet {TABLE}");
        let _ = writeln!(out, "table inet {TABLE} {{");

        for set in &self.sets {
            render_set(&mut out, set);
        }

        for chain in Chain::ALL {
            let _ = writeln!(out, "    chain {} {{", chain.name());
            let _ = writeln!(out, "        {}", chain.declaration());
            for rule in self.rules.iter().filter(|r| r.chain == chain) {
                let _ = writeln!(out, "        {}", self.render_rule(rule));
            }
            let _ = writeln!(out, "    }}");
        }

        let _ = writeln!(out, "}}");
        out
    }

    fn render_rule(&self, rule: &Rule) -> String {
        let mut parts: Vec<String> = rule.matches.iter().map(|m| self.render_match(m)).collect();
        parts.push(render_verdict(&rule.verdict));
        if !rule.comment.is_empty() {
            parts.push(format!("comment \"{}\"", rule.comment.replace('"', "'")));
        }
        parts.join(" ")
    }

    fn render_match(&self, m: &Match) -> String {
        match m {
            Match::InZone { zone } => format!("iifname {}", iface_set(&self.interfaces(*zone))),
            Match::OutZone { zone } => format!("oifname {}", iface_set(&self.interfaces(*zone))),
            Match::InLoopback => "iif \"lo\"".to_string(),
            Match::Family { family } => match family {
                Family::V4 => "meta nfproto ipv4".to_string(),
                Family::V6 => "meta nfproto ipv6".to_string(),
            },
            Match::SrcAddr { addr } => format!("{} saddr {}", addr_family(addr), addr),
            Match::DstAddr { addr } => format!("{} daddr {}", addr_family(addr), addr),
            Match::NotDstAddr { addr } => format!("{} daddr != {}", addr_family(addr), addr),
            Match::SrcSet { set, family } => format!("{} saddr @{}", family_kw(*family), set),
            Match::DstSet { set, family } => format!("{} daddr @{}", family_kw(*family), set),
            Match::DstPorts { transport, ports } => {
                format!("{} dport {}", transport, port_list(ports))
            }
            Match::Icmp { family } => match family {
                Family::V4 => "meta l4proto icmp".to_string(),
                Family::V6 => "meta l4proto ipv6-icmp".to_string(),
            },
            Match::CtState { states } => {
                let list: Vec<&str> = states.iter().map(CtState::as_str).collect();
                if list.len() == 1 {
                    format!("ct state {}", list[0])
                } else {
                    format!("ct state {{ {} }}", list.join(", "))
                }
            }
            Match::CtStatusDnat => "ct status dnat".to_string(),
            Match::MarkIs { mark } => format!("meta mark {mark:#x}"),
            Match::RateOver { per_second, burst } => {
                format!("limit rate over {per_second}/second burst {burst} packets")
            }
            Match::ConnCountOver { set, count } => {
                format!("add @{set} {{ ip saddr ct count over {count} }}")
            }
            Match::AddSource { set, timeout_secs } => {
                format!("add @{set} {{ ip saddr timeout {timeout_secs}s }}")
            }
        }
    }
}

fn render_set(out: &mut String, set: &NamedSet) {
    let _ = writeln!(out, "    set {} {{", set.name);
    let kind = match set.kind {
        SetKind::Ipv4 => "ipv4_addr",
        SetKind::Ipv6 => "ipv6_addr",
    };
    let _ = writeln!(out, "        type {kind}");
    let mut flags = Vec::new();
    if set.interval {
        flags.push("interval");
    }
    if set.dynamic {
        flags.push("dynamic");
        flags.push("timeout");
    }
    if !flags.is_empty() {
        let _ = writeln!(out, "        flags {}", flags.join(","));
    }
    if !set.elements.is_empty() {
        let _ = writeln!(out, "        elements = {{ {} }}", set.elements.join(", "));
    }
    let _ = writeln!(out, "    }}");
}

fn render_verdict(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Accept => "accept".to_string(),
        Verdict::Drop => "drop".to_string(),
        Verdict::Reject => "reject".to_string(),
        Verdict::Return => "return".to_string(),
        Verdict::Dnat { addr, port } => {
            if addr.contains(':') {
                format!("dnat ip6 to [{addr}]:{port}")
            } else {
                format!("dnat ip to {addr}:{port}")
            }
        }
        Verdict::Redirect { port } => format!("redirect to :{port}"),
        Verdict::Masquerade => "masquerade".to_string(),
        Verdict::SetMark { mark } => format!("meta mark set {mark:#x}"),
    }
}

fn iface_set(names: &[&str]) -> String {
    match names {
        [single] => format!("\"{single}\""),
        _ => {
            let quoted: Vec<String> = names.iter().map(|n| format!("\"{n}\"")).collect();
            format!("{{ {} }}", quoted.join(", "))
        }
    }
}

fn port_list(ports: &[u16]) -> String {
    match ports {
        [single] => single.to_string(),
        _ => {
            let list: Vec<String> = ports.iter().map(u16::to_string).collect();
            format!("{{ {} }}", list.join(", "))
        }
    }
}

fn addr_family(addr: &str) -> &'static str {
    if addr.contains(':') { "ip6" } else { "ip" }
}

fn family_kw(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_classification() {
        let exact = Rule::new(
            Chain::Forward,
            vec![
                Match::DstAddr {
                    addr: "192.168.1.10".into(),
                },
                Match::DstPorts {
                    transport: Transport::Tcp,
                    ports: vec![8080],
                },
            ],
            Verdict::Accept,
            "",
        );
        assert_eq!(exact.tier, Tier::Exact);

        let set = Rule::new(
            Chain::Input,
            vec![Match::SrcSet {
                set: "geoip_cn_v4".into(),
                family: Family::V4,
            }],
            Verdict::Drop,
            "",
        );
        assert_eq!(set.tier, Tier::Set);

        let zone = Rule::new(
            Chain::Forward,
            vec![Match::InZone { zone: Zone::Lan }],
            Verdict::Accept,
            "",
        );
        assert_eq!(zone.tier, Tier::Zone);
        assert_eq!(zone.guard().tier, Tier::Guard);
        assert!(Tier::Exact < Tier::Set && Tier::Set < Tier::Zone);
    }

    #[test]
    fn test_render_shape() {
        let policy = FirewallPolicy {
            zones: vec![
                ZoneDef {
                    zone: Zone::Lan,
                    interfaces: vec!["br-lan".into()],
                },
                ZoneDef {
                    zone: Zone::Vpn,
                    interfaces: vec!["wg*".into(), "tun*".into()],
                },
            ],
            forwardings: vec![],
            sets: vec![NamedSet {
                name: "geoip_cn_v4".into(),
                kind: SetKind::Ipv4,
                interval: true,
                dynamic: false,
                elements: vec!["1.0.1.0/24".into()],
            }],
            rules: vec![
                Rule::new(
                    Chain::Forward,
                    vec![
                        Match::InZone { zone: Zone::Lan },
                        Match::OutZone { zone: Zone::Vpn },
                    ],
                    Verdict::Accept,
                    "lan->vpn",
                ),
                Rule::new(
                    Chain::Dnat,
                    vec![Match::DstPorts {
                        transport: Transport::Udp,
                        ports: vec![53],
                    }],
                    Verdict::Redirect { port: 5353 },
                    "",
                ),
            ],
        };
        let script = policy.render();
        assert!(script.starts_with("table inet sentinel\ndelete table inet sentinel\n"));
        assert!(script.contains("flags interval"));
        assert!(script.contains("elements = { 1.0.1.0/24 }"));
        assert!(script.contains(
            "iifname \"br-lan\" oifname { \"wg*\", \"tun*\" } accept comment \"lan->vpn\""
        ));
        assert!(script.contains("udp dport 53 redirect to :5353"));
        // Chains render in hook order
        let dnat = script.find("chain dnat").unwrap();
        let forward = script.find("chain forward").unwrap();
        assert!(dnat < forward);
    }

    #[test]
    fn test_render_verdicts() {
        assert_eq!(
            render_verdict(&Verdict::Dnat {
                addr: "192.168.1.10".into(),
                port: 22
            }),
            "dnat ip to 192.168.1.10:22"
        );
        assert_eq!(
            render_verdict(&Verdict::SetMark { mark: BYPASS_MARK }),
            "meta mark set 0x1"
        );
    }
}
