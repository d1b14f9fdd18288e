//! Policy synthesis: active instances + routing config -> ruleset.
//!
//! Sections are emitted in a fixed order:
//!
//! 1. skeleton (conntrack, loopback, LAN services, NAT, zone forwarding)
//! 2. one accept per declared listen port of each active instance
//! 3. DNS lock-down
//! 4. routing config (bypass, GeoIP, port forwards, stealth, leak guards)
//!
//! and then stably sorted by `(chain, tier)`, so inside a chain the most
//! specific rule wins while equal tiers keep declaration order.

use super::model::*;
use super::routing::{FirewallSettings, GeoIpAction, GeoIpDirection, RoutingConfig};
use sentinel_protocols::{
    Category, Exposure, ProtocolInstance, ProtocolKind, Transport, interface_name,
};

/// Build the policy for `active` instances. Pure and deterministic.
pub fn synthesize(
    active: &[ProtocolInstance],
    routing: &RoutingConfig,
    settings: &FirewallSettings,
) -> FirewallPolicy {
    let mut instances: Vec<&ProtocolInstance> = active.iter().collect();
    instances.sort_by(|a, b| a.name.cmp(&b.name));

    let vpn_active = instances.iter().any(|i| i.category() == Category::Vpn);
    let mut policy = FirewallPolicy {
        zones: zones(&instances, settings),
        forwardings: forwardings(routing, vpn_active),
        sets: Vec::new(),
        rules: Vec::new(),
    };

    skeleton(&mut policy, routing, settings);
    protocol_rules(&mut policy, &instances);
    dns_lockdown(&mut policy, settings);
    routing_rules(&mut policy, routing);

    policy.rules.sort_by_key(|rule| (rule.chain, rule.tier));
    policy
}

fn or_default(list: &[String], fallback: &str) -> Vec<String> {
    if list.is_empty() {
        vec![fallback.to_string()]
    } else {
        list.to_vec()
    }
}

fn zones(instances: &[&ProtocolInstance], settings: &FirewallSettings) -> Vec<ZoneDef> {
    let mut vpn = or_default(&settings.vpn_interfaces, "tun*");
    for inst in instances {
        if matches!(
            inst.kind,
            ProtocolKind::Wireguard | ProtocolKind::Amneziawg | ProtocolKind::Openvpn
        ) {
            let iface = interface_name(inst.kind, &inst.name);
            if !vpn.contains(&iface) {
                vpn.push(iface);
            }
        }
    }

    vec![
        ZoneDef {
            zone: Zone::Lan,
            interfaces: or_default(&settings.lan_interfaces, "br-lan"),
        },
        ZoneDef {
            zone: Zone::Wan,
            interfaces: or_default(&settings.wan_interfaces, "eth0"),
        },
        ZoneDef {
            zone: Zone::Vpn,
            interfaces: vpn,
        },
    ]
}

fn forwardings(routing: &RoutingConfig, vpn_active: bool) -> Vec<Forwarding> {
    let mut out = vec![Forwarding {
        src: Zone::Lan,
        dest: Zone::Vpn,
    }];
    if !routing.kill_switch {
        out.push(Forwarding {
            src: Zone::Lan,
            dest: Zone::Wan,
        });
    } else if !vpn_active {
        tracing::warn!("Kill switch on with no VPN active: LAN has no internet path");
    }
    out
}

fn skeleton(policy: &mut FirewallPolicy, routing: &RoutingConfig, settings: &FirewallSettings) {
    let established = || Match::CtState {
        states: vec![CtState::Established, CtState::Related],
    };
    let rules = &mut policy.rules;

    for chain in [Chain::Input, Chain::Forward] {
        rules.push(Rule::new(chain, vec![established()], Verdict::Accept, "established").guard());
        rules.push(
            Rule::new(
                chain,
                vec![Match::CtState {
                    states: vec![CtState::Invalid],
                }],
                Verdict::Drop,
                "invalid",
            )
            .guard(),
        );
    }
    rules.push(Rule::new(Chain::Input, vec![Match::InLoopback], Verdict::Accept, "loopback").guard());

    for (transport, ports) in [
        (Transport::Tcp, &settings.lan_tcp_services),
        (Transport::Udp, &settings.lan_udp_services),
    ] {
        if ports.is_empty() {
            continue;
        }
        rules.push(Rule::new(
            Chain::Input,
            vec![
                Match::InZone { zone: Zone::Lan },
                Match::DstPorts {
                    transport,
                    ports: ports.clone(),
                },
            ],
            Verdict::Accept,
            "lan services",
        ));
    }

    for family in [Family::V4, Family::V6] {
        rules.push(Rule::new(
            Chain::Input,
            vec![Match::InZone { zone: Zone::Lan }, Match::Icmp { family }],
            Verdict::Accept,
            "lan icmp",
        ));
        if !routing.stealth.drop_icmp {
            rules.push(Rule::new(
                Chain::Input,
                vec![Match::InZone { zone: Zone::Wan }, Match::Icmp { family }],
                Verdict::Accept,
                "wan icmp",
            ));
        }
    }

    for fwd in policy.forwardings.clone() {
        policy.rules.push(Rule::new(
            Chain::Forward,
            vec![
                Match::InZone { zone: fwd.src },
                Match::OutZone { zone: fwd.dest },
            ],
            Verdict::Accept,
            format!("{}->{}", fwd.src, fwd.dest),
        ));
    }

    for zone in [Zone::Wan, Zone::Vpn] {
        policy.rules.push(Rule::new(
            Chain::Snat,
            vec![Match::OutZone { zone }],
            Verdict::Masquerade,
            format!("masquerade {zone}"),
        ));
    }
}

fn protocol_rules(policy: &mut FirewallPolicy, instances: &[&ProtocolInstance]) {
    for inst in instances {
        let mut listen = inst.listen.clone();
        listen.sort();
        listen.dedup();
        for spec in listen {
            let zone = match spec.exposure {
                Exposure::Lan => Zone::Lan,
                Exposure::Wan => Zone::Wan,
            };
            policy.rules.push(Rule::new(
                Chain::Input,
                vec![
                    Match::InZone { zone },
                    Match::DstPorts {
                        transport: spec.transport,
                        ports: vec![spec.port],
                    },
                ],
                Verdict::Accept,
                format!("{} {}", inst.kind, inst.name),
            ));
        }
    }
}

fn dns_lockdown(policy: &mut FirewallPolicy, settings: &FirewallSettings) {
    let resolver = settings.resolver_port;
    let rules = &mut policy.rules;

    for transport in [Transport::Udp, Transport::Tcp] {
        let dns = Match::DstPorts {
            transport,
            ports: vec![53],
        };
        // LAN clients always land on the local chain
        rules.push(
            Rule::new(
                Chain::Dnat,
                vec![Match::InZone { zone: Zone::Lan }, dns.clone()],
                Verdict::Redirect { port: resolver },
                "dns hijack",
            )
            .guard(),
        );
        rules.push(
            Rule::new(
                Chain::Input,
                vec![
                    Match::InZone { zone: Zone::Lan },
                    Match::DstPorts {
                        transport,
                        ports: vec![resolver],
                    },
                ],
                Verdict::Accept,
                "local resolver",
            )
            .guard(),
        );
        rules.push(
            Rule::new(
                Chain::Forward,
                vec![Match::InZone { zone: Zone::Lan }, dns.clone()],
                Verdict::Reject,
                "dns bypass",
            )
            .guard(),
        );
        for loopback in ["127.0.0.1", "::1"] {
            rules.push(
                Rule::new(
                    Chain::Output,
                    vec![
                        Match::NotDstAddr {
                            addr: loopback.to_string(),
                        },
                        dns.clone(),
                    ],
                    Verdict::Reject,
                    "dns leak",
                )
                .guard(),
            );
        }
    }
}

fn routing_rules(policy: &mut FirewallPolicy, routing: &RoutingConfig) {
    bypass_rules(policy, routing);
    geoip_rules(policy, routing);
    port_forward_rules(policy, routing);
    stealth_rules(policy, routing);

    if routing.block_ipv6_leaks {
        for chain in [Chain::Forward, Chain::Output] {
            policy.rules.push(
                Rule::new(
                    chain,
                    vec![
                        Match::OutZone { zone: Zone::Wan },
                        Match::Family { family: Family::V6 },
                    ],
                    Verdict::Reject,
                    "ipv6 leak",
                )
                .guard(),
            );
        }
    }
}

fn bypass_rules(policy: &mut FirewallPolicy, routing: &RoutingConfig) {
    if routing.bypass.is_empty() {
        return;
    }
    for addr in &routing.bypass.addrs {
        policy.rules.push(Rule::new(
            Chain::Mangle,
            vec![Match::DstAddr { addr: addr.clone() }],
            Verdict::SetMark { mark: BYPASS_MARK },
            "bypass",
        ));
    }
    if !routing.bypass.ports.is_empty() {
        for transport in [Transport::Tcp, Transport::Udp] {
            policy.rules.push(Rule::new(
                Chain::Mangle,
                vec![Match::DstPorts {
                    transport,
                    ports: routing.bypass.ports.clone(),
                }],
                Verdict::SetMark { mark: BYPASS_MARK },
                "bypass",
            ));
        }
    }
    policy.rules.push(Rule::new(
        Chain::Forward,
        vec![
            Match::InZone { zone: Zone::Lan },
            Match::OutZone { zone: Zone::Wan },
            Match::MarkIs { mark: BYPASS_MARK },
        ],
        Verdict::Accept,
        "bypass",
    ));
}

fn geoip_rules(policy: &mut FirewallPolicy, routing: &RoutingConfig) {
    for rule in &routing.geoip {
        let verdict = match rule.action {
            GeoIpAction::Allow => Verdict::Accept,
            GeoIpAction::Deny => Verdict::Drop,
        };
        let (v6, v4): (Vec<String>, Vec<String>) =
            rule.cidrs.iter().cloned().partition(|c| c.contains(':'));

        for (family, kind, elements) in [(Family::V4, SetKind::Ipv4, v4), (Family::V6, SetKind::Ipv6, v6)] {
            if elements.is_empty() {
                continue;
            }
            let suffix = match family {
                Family::V4 => "v4",
                Family::V6 => "v6",
            };
            let set = format!("geoip_{}_{}", sanitize(&rule.name), suffix);
            policy.sets.push(NamedSet {
                name: set.clone(),
                kind,
                interval: true,
                dynamic: false,
                elements,
            });

            let comment = format!("geoip {}", rule.name);
            match rule.direction {
                GeoIpDirection::Inbound => {
                    for chain in [Chain::Input, Chain::Forward] {
                        policy.rules.push(Rule::new(
                            chain,
                            vec![
                                Match::InZone { zone: Zone::Wan },
                                Match::SrcSet {
                                    set: set.clone(),
                                    family,
                                },
                            ],
                            verdict.clone(),
                            comment.clone(),
                        ));
                    }
                }
                GeoIpDirection::Outbound => {
                    policy.rules.push(Rule::new(
                        Chain::Forward,
                        vec![
                            Match::InZone { zone: Zone::Lan },
                            Match::DstSet {
                                set: set.clone(),
                                family,
                            },
                        ],
                        verdict.clone(),
                        comment,
                    ));
                }
            }
        }
    }
}

fn port_forward_rules(policy: &mut FirewallPolicy, routing: &RoutingConfig) {
    for fwd in &routing.port_forwards {
        let comment = format!("forward {}", fwd.name);
        policy.rules.push(Rule::new(
            Chain::Dnat,
            vec![
                Match::InZone { zone: Zone::Wan },
                Match::DstPorts {
                    transport: fwd.transport,
                    ports: vec![fwd.public_port],
                },
            ],
            Verdict::Dnat {
                addr: fwd.target_addr.clone(),
                port: fwd.target_port,
            },
            comment.clone(),
        ));
        policy.rules.push(Rule::new(
            Chain::Forward,
            vec![
                Match::InZone { zone: Zone::Wan },
                Match::DstAddr {
                    addr: fwd.target_addr.clone(),
                },
                Match::DstPorts {
                    transport: fwd.transport,
                    ports: vec![fwd.target_port],
                },
                Match::CtStatusDnat,
            ],
            Verdict::Accept,
            comment,
        ));
    }
}

fn stealth_rules(policy: &mut FirewallPolicy, routing: &RoutingConfig) {
    let stealth = &routing.stealth;
    let new_from_wan = || {
        vec![
            Match::InZone { zone: Zone::Wan },
            Match::CtState {
                states: vec![CtState::New],
            },
        ]
    };

    if let Some(count) = stealth.conn_limit {
        policy.sets.push(NamedSet {
            name: "stealth_conn".to_string(),
            kind: SetKind::Ipv4,
            interval: false,
            dynamic: true,
            elements: Vec::new(),
        });
        let mut matches = new_from_wan();
        matches.push(Match::ConnCountOver {
            set: "stealth_conn".to_string(),
            count,
        });
        policy
            .rules
            .push(Rule::new(Chain::Input, matches, Verdict::Drop, "conn limit").guard());
    }

    if let Some(rate) = stealth.new_conn_rate {
        let mut matches = new_from_wan();
        matches.push(Match::RateOver {
            per_second: rate,
            burst: stealth.burst,
        });
        policy
            .rules
            .push(Rule::new(Chain::Input, matches, Verdict::Drop, "rate limit").guard());
    }

    if let Some(knock) = &stealth.knock {
        if knock.sequence.is_empty() {
            return;
        }
        let stage_set = |i: usize| format!("knock_{}", i + 1);
        for i in 0..knock.sequence.len() {
            policy.sets.push(NamedSet {
                name: stage_set(i),
                kind: SetKind::Ipv4,
                interval: false,
                dynamic: true,
                elements: Vec::new(),
            });
        }
        for (i, port) in knock.sequence.iter().enumerate() {
            let mut matches = vec![
                Match::InZone { zone: Zone::Wan },
                Match::DstPorts {
                    transport: Transport::Tcp,
                    ports: vec![*port],
                },
            ];
            if i > 0 {
                matches.push(Match::SrcSet {
                    set: stage_set(i - 1),
                    family: Family::V4,
                });
            }
            matches.push(Match::AddSource {
                set: stage_set(i),
                timeout_secs: knock.timeout_secs,
            });
            policy.rules.push(
                Rule::new(Chain::Input, matches, Verdict::Drop, format!("knock {}", i + 1))
                    .guard(),
            );
        }
        let protected = Match::DstPorts {
            transport: Transport::Tcp,
            ports: vec![knock.protected_port],
        };
        policy.rules.push(
            Rule::new(
                Chain::Input,
                vec![
                    Match::InZone { zone: Zone::Wan },
                    protected.clone(),
                    Match::SrcSet {
                        set: stage_set(knock.sequence.len() - 1),
                        family: Family::V4,
                    },
                ],
                Verdict::Accept,
                "knock open",
            )
            .guard(),
        );
        policy.rules.push(
            Rule::new(
                Chain::Input,
                vec![Match::InZone { zone: Zone::Wan }, protected],
                Verdict::Drop,
                "knock closed",
            )
            .guard(),
        );
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::routing::{GeoIpRule, PortForward, PortKnock};
    use sentinel_protocols::parse_config;

    fn instance(name: &str, raw: &str) -> ProtocolInstance {
        let parsed = parse_config(raw, None).unwrap();
        ProtocolInstance::new(name, parsed.kind, parsed.descriptor)
    }

    fn sample_instances() -> Vec<ProtocolInstance> {
        vec![
            instance("tor-main", "SOCKSPort 9050\n"),
            instance(
                "ss-home",
                "ss://YWVzLTI1Ni1nY206cHc@198.51.100.7:8388#home",
            ),
        ]
    }

    fn position(policy: &FirewallPolicy, chain: Chain, comment: &str) -> usize {
        policy
            .rules
            .iter()
            .position(|r| r.chain == chain && r.comment == comment)
            .unwrap_or_else(|| panic!("no {comment} rule in {chain:?}"))
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let routing = RoutingConfig {
            geoip: vec![GeoIpRule {
                name: "CN".into(),
                cidrs: vec!["1.0.1.0/24".into(), "2001:db8::/32".into()],
                action: GeoIpAction::Deny,
                direction: GeoIpDirection::Inbound,
            }],
            ..RoutingConfig::default()
        };
        let settings = FirewallSettings::default();
        let mut instances = sample_instances();
        let first = synthesize(&instances, &routing, &settings).render();
        instances.reverse();
        let second = synthesize(&instances, &routing, &settings).render();
        assert_eq!(first, second);
        assert_eq!(first, synthesize(&instances, &routing, &settings).render());
    }

    #[test]
    fn test_listen_ports_opened() {
        let policy = synthesize(
            &sample_instances(),
            &RoutingConfig::default(),
            &FirewallSettings::default(),
        );
        let script = policy.render();
        assert!(script.contains("tcp dport 9050 accept comment \"tor tor-main\""));
        assert!(script.contains("tcp dport 1080 accept comment \"shadowsocks ss-home\""));
    }

    #[test]
    fn test_dns_lockdown_precedes_forwarding() {
        let routing = RoutingConfig {
            port_forwards: vec![PortForward {
                name: "nas".into(),
                transport: Transport::Tcp,
                public_port: 8443,
                target_addr: "192.168.1.20".into(),
                target_port: 443,
            }],
            ..RoutingConfig::default()
        };
        let policy = synthesize(&[], &routing, &FirewallSettings::default());

        let hijack = position(&policy, Chain::Dnat, "dns hijack");
        let dnat = position(&policy, Chain::Dnat, "forward nas");
        assert!(hijack < dnat);

        let dns_bypass = position(&policy, Chain::Forward, "dns bypass");
        let forward = position(&policy, Chain::Forward, "forward nas");
        let lan_wan = position(&policy, Chain::Forward, "lan->wan");
        assert!(dns_bypass < forward);
        assert!(dns_bypass < lan_wan);

        let script = policy.render();
        assert!(script.contains("ip daddr != 127.0.0.1 udp dport 53 reject"));
        assert!(script.contains("ip6 daddr != ::1 tcp dport 53 reject"));
        assert!(script.contains("udp dport 53 redirect to :5353"));
    }

    #[test]
    fn test_port_forward_beats_geoip() {
        let routing = RoutingConfig {
            geoip: vec![GeoIpRule {
                name: "XX".into(),
                cidrs: vec!["203.0.113.0/24".into()],
                action: GeoIpAction::Deny,
                direction: GeoIpDirection::Inbound,
            }],
            port_forwards: vec![PortForward {
                name: "game".into(),
                transport: Transport::Udp,
                public_port: 27015,
                target_addr: "192.168.1.30".into(),
                target_port: 27015,
            }],
            ..RoutingConfig::default()
        };
        let policy = synthesize(&[], &routing, &FirewallSettings::default());
        let forward = position(&policy, Chain::Forward, "forward game");
        let geoip = position(&policy, Chain::Forward, "geoip XX");
        assert!(forward < geoip);
        assert_eq!(policy.rules[forward].tier, Tier::Exact);
        assert_eq!(policy.rules[geoip].tier, Tier::Set);
    }

    #[test]
    fn test_kill_switch_drops_lan_wan() {
        let vpn = instance(
            "home",
            "[Interface]\nPrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\nAddress = 10.8.0.2/32\n\n[Peer]\nPublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\nEndpoint = 203.0.113.1:51820\nAllowedIPs = 0.0.0.0/0\n",
        );
        let routing = RoutingConfig {
            kill_switch: true,
            ..RoutingConfig::default()
        };
        let policy = synthesize(&[vpn], &routing, &FirewallSettings::default());
        assert!(!policy.rules.iter().any(|r| r.comment == "lan->wan"));
        assert!(policy.rules.iter().any(|r| r.comment == "lan->vpn"));
        let vpn_zone = policy.zones.iter().find(|z| z.zone == Zone::Vpn).unwrap();
        assert!(vpn_zone.interfaces.contains(&"wg-home".to_string()));
    }

    #[test]
    fn test_stealth_and_knock() {
        let routing = RoutingConfig {
            stealth: crate::firewall::routing::StealthPolicy {
                conn_limit: Some(20),
                new_conn_rate: Some(25),
                burst: 50,
                drop_icmp: true,
                knock: Some(PortKnock {
                    sequence: vec![7000, 8000],
                    protected_port: 22,
                    timeout_secs: 10,
                }),
            },
            block_ipv6_leaks: true,
            ..RoutingConfig::default()
        };
        let policy = synthesize(&[], &routing, &FirewallSettings::default());
        let script = policy.render();
        assert!(script.contains("add @stealth_conn { ip saddr ct count over 20 } drop"));
        assert!(script.contains("limit rate over 25/second burst 50 packets drop"));
        assert!(script.contains("tcp dport 8000 ip saddr @knock_1 add @knock_2 { ip saddr timeout 10s } drop"));
        assert!(script.contains("tcp dport 22 ip saddr @knock_2 accept"));
        assert!(!script.contains("wan icmp"));
        assert!(script.contains("meta nfproto ipv6 reject comment \"ipv6 leak\""));

        let open = position(&policy, Chain::Input, "knock open");
        let closed = position(&policy, Chain::Input, "knock closed");
        assert!(open < closed);
    }

    #[test]
    fn test_bypass_marks() {
        let routing = RoutingConfig {
            bypass: crate::firewall::routing::DirectBypass {
                addrs: vec!["192.0.2.10".into()],
                ports: vec![6881],
            },
            ..RoutingConfig::default()
        };
        let script = synthesize(&[], &routing, &FirewallSettings::default()).render();
        assert!(script.contains("ip daddr 192.0.2.10 meta mark set 0x1"));
        assert!(script.contains("udp dport 6881 meta mark set 0x1"));
        assert!(script.contains("meta mark 0x1 accept comment \"bypass\""));
    }
}
