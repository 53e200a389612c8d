//! A single kernel rule, structured.
//!
//! Rules are compared structurally rather than textually: the kernel echoes
//! back implicit matches (`-m tcp`) and comments that were never part of
//! what we asked for, and those must not count as differences.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{NatError, Result};
use crate::types::Transport;

/// What happens to a matching packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Leave the current chain.
    Return,
    /// Accept.
    Accept,
    /// Rewrite source to the outgoing interface address.
    Masquerade,
    /// Divert to a local port.
    Redirect {
        /// Local listener port.
        to_port: u16,
    },
    /// Jump to another chain or any other target.
    Jump(String),
}

impl Target {
    fn push_args(&self, args: &mut Vec<String>) {
        args.push("-j".into());
        match self {
            Self::Return => args.push("RETURN".into()),
            Self::Accept => args.push("ACCEPT".into()),
            Self::Masquerade => args.push("MASQUERADE".into()),
            Self::Redirect { to_port } => {
                args.extend(["REDIRECT".into(), "--to-ports".into(), to_port.to_string()]);
            }
            Self::Jump(chain) => args.push(chain.clone()),
        }
    }
}

/// A rule as a set of matches plus a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// `-s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpNet>,
    /// `-d`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<IpNet>,
    /// `-o`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    /// `-p`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Transport>,
    /// `--dport`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    /// Anything else the kernel reported. Never produced by this crate,
    /// so a rule carrying extras never equals one of ours.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
    /// `-j`
    pub target: Target,
}

impl Rule {
    fn with_target(target: Target) -> Self {
        Self {
            source: None,
            destination: None,
            out_interface: None,
            protocol: None,
            dport: None,
            extra: Vec::new(),
            target,
        }
    }

    /// Stop processing packets headed to `net`.
    pub fn exempt_destination(net: IpNet) -> Self {
        Self {
            destination: Some(net),
            ..Self::with_target(Target::Return)
        }
    }

    /// Stop processing packets coming from `net`.
    pub fn exempt_source(net: IpNet) -> Self {
        Self {
            source: Some(net),
            ..Self::with_target(Target::Return)
        }
    }

    /// Divert one transport into its local listener.
    pub fn redirect(transport: Transport, port: u16) -> Self {
        Self {
            protocol: Some(transport),
            ..Self::with_target(Target::Redirect { to_port: port })
        }
    }

    /// Masquerade `subnet` leaving through `interface`.
    pub fn masquerade(subnet: IpNet, interface: &str) -> Self {
        Self {
            source: Some(subnet),
            out_interface: Some(interface.to_string()),
            ..Self::with_target(Target::Masquerade)
        }
    }

    /// Accept traffic to a local port.
    pub fn accept_port(transport: Transport, port: u16) -> Self {
        Self {
            protocol: Some(transport),
            dport: Some(port),
            ..Self::with_target(Target::Accept)
        }
    }

    /// Jump into `chain`, optionally only for one source range.
    pub fn jump(chain: &str, source: Option<IpNet>) -> Self {
        Self {
            source,
            ..Self::with_target(Target::Jump(chain.to_string()))
        }
    }

    /// Whether this rule jumps into `chain`.
    pub fn jumps_to(&self, chain: &str) -> bool {
        matches!(&self.target, Target::Jump(c) if c == chain)
    }

    /// Rule specification as iptables arguments, without `-A CHAIN`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(source) = self.source {
            args.extend(["-s".into(), source.to_string()]);
        }
        if let Some(destination) = self.destination {
            args.extend(["-d".into(), destination.to_string()]);
        }
        if let Some(interface) = &self.out_interface {
            args.extend(["-o".into(), interface.clone()]);
        }
        if let Some(protocol) = self.protocol {
            args.extend(["-p".into(), protocol.as_str().into()]);
            if let Some(port) = self.dport {
                args.extend([
                    "-m".into(),
                    protocol.as_str().into(),
                    "--dport".into(),
                    port.to_string(),
                ]);
            }
        }
        args.extend(self.extra.iter().cloned());
        self.target.push_args(&mut args);
        args
    }

    /// Whether the rule matches a packet. Rules carrying unknown matches
    /// never do.
    pub fn matches(
        &self,
        source: IpAddr,
        destination: IpAddr,
        transport: Transport,
        dport: u16,
        out_interface: Option<&str>,
    ) -> bool {
        self.extra.is_empty()
            && self.source.is_none_or(|n| n.contains(&source))
            && self.destination.is_none_or(|n| n.contains(&destination))
            && self.protocol.is_none_or(|p| p == transport)
            && self.dport.is_none_or(|p| p == dport)
            && self
                .out_interface
                .as_deref()
                .is_none_or(|i| out_interface == Some(i))
    }

    /// Parse one line of `iptables -S` output.
    ///
    /// Returns the chain and rule for `-A` lines and `None` for chain
    /// declarations (`-N`, `-P`).
    pub fn parse_spec(line: &str) -> Result<Option<(String, Self)>> {
        let tokens = split_spec(line);
        let mut iter = tokens.into_iter();
        match iter.next().as_deref() {
            Some("-A") => {}
            Some("-N" | "-P") | None => return Ok(None),
            Some(other) => {
                return Err(invalid(line, &format!("unexpected command {other}")));
            }
        }
        let chain = iter
            .next()
            .ok_or_else(|| invalid(line, "missing chain name"))?;

        let mut rule = Self::with_target(Target::Return);
        let mut target = None;
        let mut negate = false;
        while let Some(token) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .ok_or_else(|| invalid(line, &format!("{name} without value")))
            };
            match token.as_str() {
                "!" => {
                    negate = true;
                    rule.extra.push(token.clone());
                    continue;
                }
                _ if negate => {
                    let v = value(&token)?;
                    rule.extra.extend([token.clone(), v]);
                }
                "-s" => rule.source = Some(parse_net(line, &value("-s")?)?),
                "-d" => rule.destination = Some(parse_net(line, &value("-d")?)?),
                "-o" => rule.out_interface = Some(value("-o")?),
                "-p" => {
                    let v = value("-p")?;
                    match v.parse::<Transport>() {
                        Ok(t) => rule.protocol = Some(t),
                        Err(_) => rule.extra.extend(["-p".into(), v]),
                    }
                }
                "-m" => {
                    let module = value("-m")?;
                    match module.as_str() {
                        "tcp" | "udp" => {}
                        "comment" => {
                            let _ = iter.next_if(|t| t == "--comment").and_then(|_| iter.next());
                        }
                        _ => rule.extra.extend(["-m".into(), module]),
                    }
                }
                "--dport" => {
                    let v = value("--dport")?;
                    rule.dport = Some(
                        v.parse()
                            .map_err(|_| invalid(line, &format!("bad port {v}")))?,
                    );
                }
                "-j" => {
                    let name = value("-j")?;
                    target = Some(match name.as_str() {
                        "RETURN" => Target::Return,
                        "ACCEPT" => Target::Accept,
                        "MASQUERADE" => Target::Masquerade,
                        "REDIRECT" => {
                            let port = iter
                                .next_if(|t| t == "--to-ports")
                                .and_then(|_| iter.next())
                                .ok_or_else(|| invalid(line, "REDIRECT without --to-ports"))?;
                            Target::Redirect {
                                to_port: port
                                    .parse()
                                    .map_err(|_| invalid(line, &format!("bad port {port}")))?,
                            }
                        }
                        _ => Target::Jump(name),
                    });
                }
                _ => rule.extra.push(token.clone()),
            }
            negate = false;
        }

        rule.target = target.ok_or_else(|| invalid(line, "no target"))?;
        Ok(Some((chain, rule)))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

fn invalid(line: &str, reason: &str) -> NatError {
    NatError::InvalidRule {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_net(line: &str, raw: &str) -> Result<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| invalid(line, &format!("bad address {raw}")))
}

/// Split a rule line into words, honouring double quotes and backslash
/// escapes the way `iptables -S` emits comments.
fn split_spec(line: &str) -> std::iter::Peekable<std::vec::IntoIter<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words.into_iter().peekable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn parse(line: &str) -> (String, Rule) {
        Rule::parse_spec(line).expect("parse").expect("rule line")
    }

    #[test]
    fn redirect_args() {
        assert_eq!(
            Rule::redirect(Transport::Udp, 11081).to_string(),
            "-p udp -j REDIRECT --to-ports 11081"
        );
    }

    #[test]
    fn masquerade_args() {
        assert_eq!(
            Rule::masquerade(net("10.0.0.0/24"), "eth0").to_string(),
            "-s 10.0.0.0/24 -o eth0 -j MASQUERADE"
        );
    }

    #[test_case(Rule::exempt_destination("10.0.0.0/8".parse().expect("cidr")), "-A HOPNET-REDIRECT -d 10.0.0.0/8 -j RETURN" ; "exempt destination")]
    #[test_case(Rule::exempt_source("10.9.0.0/16".parse().expect("cidr")), "-A HOPNET-REDIRECT -s 10.9.0.0/16 -j RETURN" ; "exempt source")]
    #[test_case(Rule::redirect(Transport::Tcp, 11081), "-A HOPNET-REDIRECT -p tcp -j REDIRECT --to-ports 11081" ; "redirect")]
    #[test_case(Rule::accept_port(Transport::Tcp, 443), "-A HOPNET-REDIRECT -p tcp -m tcp --dport 443 -j ACCEPT" ; "accept port")]
    #[test_case(Rule::jump("HOPNET-REDIRECT", Some("10.0.0.0/24".parse().expect("cidr"))), "-A HOPNET-REDIRECT -s 10.0.0.0/24 -j HOPNET-REDIRECT" ; "scoped jump")]
    fn kernel_echo_parses_back_equal(rule: Rule, line: &str) {
        let (chain, parsed) = parse(line);
        assert_eq!(chain, "HOPNET-REDIRECT");
        assert_eq!(parsed, rule);
    }

    #[test]
    fn host_address_without_prefix_parses() {
        let (_, rule) = parse("-A POSTROUTING -s 192.0.2.1 -j MASQUERADE");
        assert_eq!(rule.source, Some(net("192.0.2.1/32")));
    }

    #[test]
    fn comments_and_implicit_matches_are_ignored() {
        let (_, rule) = parse(
            r#"-A HOPNET-INPUT -p tcp -m tcp --dport 22 -m comment --comment "keep \"ssh\" open" -j ACCEPT"#,
        );
        assert_eq!(rule, Rule::accept_port(Transport::Tcp, 22));
    }

    #[test]
    fn foreign_matches_are_kept_as_extra() {
        let (_, rule) = parse("-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER");
        assert!(rule.jumps_to("DOCKER"));
        assert_eq!(rule.extra, vec!["-m", "addrtype", "--dst-type", "LOCAL"]);
        assert_ne!(rule, Rule::jump("DOCKER", None));
    }

    #[test]
    fn negated_match_never_equals_plain_rule() {
        let (_, rule) = parse("-A PREROUTING ! -s 10.0.0.0/24 -j HOPNET-REDIRECT");
        assert_eq!(rule.source, None);
        assert!(rule.jumps_to("HOPNET-REDIRECT"));
        assert_ne!(rule, Rule::jump("HOPNET-REDIRECT", None));
    }

    #[test]
    fn chain_declarations_are_skipped() {
        assert!(Rule::parse_spec("-N HOPNET-REDIRECT").expect("parse").is_none());
        assert!(Rule::parse_spec("-P PREROUTING ACCEPT").expect("parse").is_none());
        assert!(Rule::parse_spec("").expect("parse").is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(Rule::parse_spec("-A X -s").is_err());
        assert!(Rule::parse_spec("-A X -d 10.0.0.0/8").is_err());
        assert!(Rule::parse_spec("-A X -j REDIRECT").is_err());
        assert!(Rule::parse_spec("-X bogus").is_err());
    }

    #[test]
    fn matching_respects_every_field() {
        let rule = Rule::masquerade(net("10.0.0.0/24"), "eth0");
        let src: IpAddr = "10.0.0.5".parse().expect("ip");
        let dst: IpAddr = "1.1.1.1".parse().expect("ip");
        assert!(rule.matches(src, dst, Transport::Tcp, 443, Some("eth0")));
        assert!(!rule.matches(src, dst, Transport::Tcp, 443, Some("wg0")));
        assert!(!rule.matches(dst, dst, Transport::Tcp, 443, Some("eth0")));
    }
}
