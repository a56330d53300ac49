//! iptables chain programming.
//!
//! Every invocation goes through the command runner with `-w` first, so
//! concurrent daemons queue on the kernel lock instead of failing. A
//! [`Chain`] owns one instance chain plus its companion log chain and
//! translates high-level egress rules into the deterministic command
//! sequence the packet filter is programmed with.

use crate::NetworkError;
use burrow_schema::types::{NetOutRule, PortRange, Protocol};
use burrow_system::{Cmd, CommandRunner};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

pub const IPTABLES_BIN: &str = "/sbin/iptables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Return,
    Reject,
    Drop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Return => "RETURN",
            Action::Reject => "REJECT",
            Action::Drop => "DROP",
        }
    }
}

pub struct Chain {
    name: String,
    kernel_logging: bool,
    runner: Arc<dyn CommandRunner>,
}

impl Chain {
    pub fn new(name: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: name.into(),
            kernel_logging: false,
            runner,
        }
    }

    /// A chain whose log companion uses the kernel `LOG` target rather
    /// than user-space `NFLOG`.
    pub fn with_kernel_logging(
        name: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            kernel_logging: true,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn log_chain(&self) -> String {
        format!("{}-log", self.name)
    }

    /// Run one iptables invocation, returning the raw runner error.
    fn run(&self, args: &[&str]) -> Result<(), NetworkError> {
        let mut cmd = Cmd::new(IPTABLES_BIN).arg("-w").args(args.iter().copied());
        self.runner.run(&mut cmd)?;
        Ok(())
    }

    /// Run one iptables invocation, attaching captured stderr to the
    /// error: `iptables: <err>, <stderr>`.
    fn run_with_stderr(&self, args: Vec<String>) -> Result<(), NetworkError> {
        let mut cmd = Cmd::new(IPTABLES_BIN).arg("-w").args(args);
        self.runner
            .run(&mut cmd)
            .map_err(|e| NetworkError::Iptables(format!("{e}, {}", cmd.stderr_str())))
    }

    /// (Re)create the log chain: flush → delete → create → logging rule
    /// → RETURN rule. Flush and delete failures are expected when the
    /// chain does not exist yet and are ignored.
    pub fn setup(&self, log_prefix: &str) -> Result<(), NetworkError> {
        let log_chain = self.log_chain();
        debug!(chain = %self.name, "setting up log chain");

        let _ = self.run(&["-F", &log_chain]);
        let _ = self.run(&["-X", &log_chain]);

        self.run(&["-N", &log_chain])
            .map_err(|e| NetworkError::LogChainSetup(e.to_string()))?;

        let mut logging_rule = vec![
            "-A",
            &log_chain,
            "-m",
            "conntrack",
            "--ctstate",
            "NEW,UNTRACKED,INVALID",
            "--protocol",
            "tcp",
        ];
        if self.kernel_logging {
            logging_rule.extend(["--jump", "LOG", "--log-prefix", log_prefix]);
        } else {
            logging_rule.extend([
                "--jump",
                "NFLOG",
                "--nflog-prefix",
                log_prefix,
                "--nflog-group",
                "1",
            ]);
        }
        self.run(&logging_rule)
            .map_err(|e| NetworkError::LogChainSetup(e.to_string()))?;

        self.run(&["-A", &log_chain, "--jump", "RETURN"])
            .map_err(|e| NetworkError::LogChainSetup(e.to_string()))?;

        Ok(())
    }

    /// Flush and delete the log chain and the instance chain. All
    /// failures are ignored; teardown must win against chains that were
    /// never created.
    pub fn tear_down(&self) {
        let log_chain = self.log_chain();
        let _ = self.run(&["-F", &log_chain]);
        let _ = self.run(&["-X", &log_chain]);
        let _ = self.run(&["-F", &self.name]);
        let _ = self.run(&["-X", &self.name]);
    }

    pub fn append_rule(
        &self,
        source: &str,
        destination: &str,
        jump: Action,
    ) -> Result<(), NetworkError> {
        self.run(&Self::rule_args("-A", &self.name, source, destination, jump))
    }

    pub fn delete_rule(
        &self,
        source: &str,
        destination: &str,
        jump: Action,
    ) -> Result<(), NetworkError> {
        self.run(&Self::rule_args("-D", &self.name, source, destination, jump))
    }

    pub fn append_nat_rule(
        &self,
        source: &str,
        destination: &str,
        jump: Action,
        to: Option<Ipv4Addr>,
    ) -> Result<(), NetworkError> {
        self.run_nat("-A", source, destination, jump, to)
    }

    pub fn delete_nat_rule(
        &self,
        source: &str,
        destination: &str,
        jump: Action,
        to: Option<Ipv4Addr>,
    ) -> Result<(), NetworkError> {
        self.run_nat("-D", source, destination, jump, to)
    }

    fn rule_args<'a>(
        op: &'a str,
        chain: &'a str,
        source: &'a str,
        destination: &'a str,
        jump: Action,
    ) -> Vec<&'a str> {
        let mut args = vec![op, chain];
        if !source.is_empty() {
            args.extend(["--source", source]);
        }
        if !destination.is_empty() {
            args.extend(["--destination", destination]);
        }
        args.extend(["--jump", jump.as_str()]);
        args
    }

    fn run_nat(
        &self,
        op: &str,
        source: &str,
        destination: &str,
        jump: Action,
        to: Option<Ipv4Addr>,
    ) -> Result<(), NetworkError> {
        let mut args: Vec<String> = vec!["-t".into(), "nat".into(), op.into(), self.name.clone()];
        if !source.is_empty() {
            args.extend(["--source".into(), source.into()]);
        }
        if !destination.is_empty() {
            args.extend(["--destination".into(), destination.into()]);
        }
        args.extend(["--jump".into(), jump.as_str().into()]);
        if let Some(ip) = to {
            args.extend(["--to".into(), ip.to_string()]);
        }

        let mut cmd = Cmd::new(IPTABLES_BIN).arg("-w").args(args);
        self.runner.run(&mut cmd)?;
        Ok(())
    }

    /// Translate an egress allow-rule into the Cartesian product of
    /// (network × port) invocations, prepending each at position 1 of
    /// the instance chain. Networks are the outer loop.
    pub fn prepend_filter_rule(&self, rule: &NetOutRule) -> Result<(), NetworkError> {
        let protocol = match rule.protocol {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other(n) => return Err(NetworkError::InvalidProtocol(n)),
        };

        if !rule.ports.is_empty() && !matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) {
            let name = match rule.protocol {
                Protocol::All => "ALL",
                Protocol::Icmp => "ICMP",
                _ => unreachable!("tcp and udp accept ports"),
            };
            return Err(NetworkError::PortsNotAllowed(name));
        }

        let no_network = [Default::default()];
        let networks: &[burrow_schema::types::IpRange] = if rule.networks.is_empty() {
            &no_network
        } else {
            &rule.networks
        };
        let ports: Vec<Option<PortRange>> = if rule.ports.is_empty() {
            vec![None]
        } else {
            rule.ports.iter().copied().map(Some).collect()
        };

        for network in networks {
            for port in &ports {
                let mut args: Vec<String> = vec![
                    "-I".into(),
                    self.name.clone(),
                    "1".into(),
                    "--protocol".into(),
                    protocol.into(),
                ];

                match (network.start, network.end) {
                    (None, None) => {}
                    (Some(start), None) => {
                        args.extend(["--destination".into(), start.to_string()]);
                    }
                    (None, Some(end)) => {
                        args.extend(["--destination".into(), end.to_string()]);
                    }
                    (Some(start), Some(end)) => {
                        args.extend([
                            "-m".into(),
                            "iprange".into(),
                            "--dst-range".into(),
                            format!("{start}-{end}"),
                        ]);
                    }
                }

                if let Some(range) = port {
                    let spec = if range.start == range.end {
                        range.start.to_string()
                    } else {
                        format!("{}:{}", range.start, range.end)
                    };
                    args.extend(["--destination-port".into(), spec]);
                }

                if let Some(icmp) = rule.icmps {
                    let spec = match icmp.code {
                        Some(code) => format!("{}/{code}", icmp.icmp_type),
                        None => icmp.icmp_type.to_string(),
                    };
                    args.extend(["--icmp-type".into(), spec]);
                }

                if rule.log {
                    args.extend(["--goto".into(), self.log_chain()]);
                } else {
                    args.extend(["--jump".into(), "RETURN".into()]);
                }

                self.run_with_stderr(args)?;
            }
        }

        Ok(())
    }
}
