//! 基于规则的出站选路

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use crate::common::Address;
use crate::config::types::RouterConfig;
use crate::proxy::Session;

enum RuleMatcher {
    DomainSuffix(Vec<String>),
    IpCidr(Vec<IpNet>),
    Port(Vec<u16>),
}

struct Rule {
    matcher: RuleMatcher,
    outbound: String,
}

pub struct Router {
    rules: Vec<Rule>,
    default: String,
}

impl Router {
    pub fn new(config: &RouterConfig) -> Self {
        let mut rules = Vec::new();
        for rc in &config.rules {
            let matcher = match rc.rule_type.as_str() {
                "domain-suffix" => RuleMatcher::DomainSuffix(rc.values.clone()),
                "ip-cidr" => {
                    let nets = rc
                        .values
                        .iter()
                        .filter_map(|s| s.parse::<IpNet>().ok())
                        .collect();
                    RuleMatcher::IpCidr(nets)
                }
                "port" => {
                    let ports = rc.values.iter().filter_map(|s| s.parse().ok()).collect();
                    RuleMatcher::Port(ports)
                }
                other => {
                    warn!(rule_type = other, "unknown rule type, skipping");
                    continue;
                }
            };
            rules.push(Rule {
                matcher,
                outbound: rc.outbound.clone(),
            });
        }
        Self {
            rules,
            default: config.default.clone(),
        }
    }

    pub fn route(&self, session: &Session) -> &str {
        for rule in &self.rules {
            if rule.matches(&session.target) {
                return &rule.outbound;
            }
        }
        &self.default
    }
}

impl Rule {
    fn matches(&self, target: &Address) -> bool {
        match &self.matcher {
            RuleMatcher::DomainSuffix(suffixes) => match target {
                Address::Domain(domain, _) => {
                    suffixes.iter().any(|s| domain == s || domain.ends_with(&format!(".{}", s)))
                }
                Address::Ip(_) => false,
            },
            RuleMatcher::IpCidr(nets) => match target {
                Address::Ip(addr) => {
                    let ip: IpAddr = addr.ip();
                    nets.iter().any(|n| n.contains(&ip))
                }
                Address::Domain(_, _) => false,
            },
            RuleMatcher::Port(ports) => ports.contains(&target.port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RuleConfig;
    use crate::proxy::Network;

    fn session(target: Address) -> Session {
        Session {
            target,
            source: None,
            inbound_tag: "test-in".to_string(),
            network: Network::Tcp,
        }
    }

    fn router_with(rules: Vec<RuleConfig>) -> Router {
        Router::new(&RouterConfig {
            rules,
            default: "direct".to_string(),
        })
    }

    #[test]
    fn default_route() {
        let router = router_with(vec![]);
        let s = session(Address::Domain("example.com".to_string(), 443));
        assert_eq!(router.route(&s), "direct");
    }

    #[test]
    fn domain_suffix_match() {
        let router = router_with(vec![RuleConfig {
            rule_type: "domain-suffix".to_string(),
            values: vec!["internal.net".to_string()],
            outbound: "relay".to_string(),
        }]);
        let s = session(Address::Domain("api.internal.net".to_string(), 443));
        assert_eq!(router.route(&s), "relay");
        let s = session(Address::Domain("internal.net".to_string(), 443));
        assert_eq!(router.route(&s), "relay");
        let s = session(Address::Domain("notinternal.net".to_string(), 443));
        assert_eq!(router.route(&s), "direct");
    }

    #[test]
    fn ip_cidr_match() {
        let router = router_with(vec![RuleConfig {
            rule_type: "ip-cidr".to_string(),
            values: vec!["10.0.0.0/8".to_string()],
            outbound: "relay".to_string(),
        }]);
        let s = session(Address::Ip("10.1.2.3:80".parse().unwrap()));
        assert_eq!(router.route(&s), "relay");
        let s = session(Address::Ip("192.168.1.1:80".parse().unwrap()));
        assert_eq!(router.route(&s), "direct");
    }

    #[test]
    fn port_match() {
        let router = router_with(vec![RuleConfig {
            rule_type: "port".to_string(),
            values: vec!["53".to_string()],
            outbound: "dns-out".to_string(),
        }]);
        let s = session(Address::Ip("8.8.8.8:53".parse().unwrap()));
        assert_eq!(router.route(&s), "dns-out");
    }
}
