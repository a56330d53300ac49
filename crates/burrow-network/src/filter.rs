//! Per-container filter seam and chain lifecycle.
//!
//! The pool and the container handle only see the [`Filter`] and
//! [`FilterProvider`] traits; the real implementation programs the
//! container's instance chain through [`Chain`]. The
//! [`IptablesManager`] owns teardown of every per-container chain so
//! release and prune can reclaim kernel state without knowing chain
//! naming details.

use crate::iptables::Chain;
use crate::NetworkError;
use burrow_schema::types::NetOutRule;
use burrow_schema::Config;
use burrow_system::CommandRunner;
use std::sync::Arc;

pub trait Filter: Send + Sync {
    /// Install the instance log chain, using `log_prefix` (normally the
    /// container handle) as the packet log prefix.
    fn setup(&self, log_prefix: &str) -> Result<(), NetworkError>;

    /// Remove the instance chains. Never fails: teardown must win
    /// against partially created state.
    fn tear_down(&self);

    /// Prepend an egress allow-rule to the instance chain.
    fn net_out(&self, rule: &NetOutRule) -> Result<(), NetworkError>;
}

pub struct InstanceFilter {
    chain: Chain,
}

impl Filter for InstanceFilter {
    fn setup(&self, log_prefix: &str) -> Result<(), NetworkError> {
        self.chain.setup(log_prefix)
    }

    fn tear_down(&self) {
        self.chain.tear_down();
    }

    fn net_out(&self, rule: &NetOutRule) -> Result<(), NetworkError> {
        self.chain.prepend_filter_rule(rule)
    }
}

pub trait FilterProvider: Send + Sync {
    fn provide(&self, container_id: &str) -> Arc<dyn Filter>;
}

pub struct InstanceFilterProvider {
    config: Config,
    kernel_logging: bool,
    runner: Arc<dyn CommandRunner>,
}

impl InstanceFilterProvider {
    pub fn new(config: Config, kernel_logging: bool, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            kernel_logging,
            runner,
        }
    }
}

impl FilterProvider for InstanceFilterProvider {
    fn provide(&self, container_id: &str) -> Arc<dyn Filter> {
        let name = self.config.instance_chain(container_id);
        let chain = if self.kernel_logging {
            Chain::with_kernel_logging(name, Arc::clone(&self.runner))
        } else {
            Chain::new(name, Arc::clone(&self.runner))
        };
        Arc::new(InstanceFilter { chain })
    }
}

/// Tears down every per-container chain (filter and NAT). The chains
/// themselves are created by `create.sh`; the daemon only ever needs to
/// make them disappear.
pub trait ChainTeardown: Send + Sync {
    fn container_teardown(&self, container_id: &str) -> Result<(), NetworkError>;
}

pub struct IptablesManager {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

impl IptablesManager {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }
}

impl IptablesManager {
    fn run_ignoring_failure(&self, args: &[&str]) {
        let mut cmd = burrow_system::Cmd::new(crate::iptables::IPTABLES_BIN)
            .arg("-w")
            .args(args.iter().copied());
        let _ = self.runner.run(&mut cmd);
    }
}

impl ChainTeardown for IptablesManager {
    fn container_teardown(&self, container_id: &str) -> Result<(), NetworkError> {
        let filter_instance = format!("{}{container_id}", self.config.filter.instance_prefix);
        let nat_instance = format!("{}{container_id}", self.config.nat.instance_prefix);

        // Missing chains are the common case after a crash; everything
        // here is best-effort.
        self.run_ignoring_failure(&["-F", &filter_instance]);
        self.run_ignoring_failure(&["-X", &filter_instance]);
        self.run_ignoring_failure(&["-F", &format!("{filter_instance}-log")]);
        self.run_ignoring_failure(&["-X", &format!("{filter_instance}-log")]);
        self.run_ignoring_failure(&["-t", "nat", "-F", &nat_instance]);
        self.run_ignoring_failure(&["-t", "nat", "-X", &nat_instance]);
        Ok(())
    }
}

pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFilter {
        pub setups: Mutex<Vec<String>>,
        pub teardowns: Mutex<usize>,
        pub rules: Mutex<Vec<NetOutRule>>,
        pub setup_error: Mutex<Option<String>>,
    }

    impl Filter for FakeFilter {
        fn setup(&self, log_prefix: &str) -> Result<(), NetworkError> {
            if let Some(message) = self.setup_error.lock().unwrap().clone() {
                return Err(NetworkError::Iptables(message));
            }
            self.setups.lock().unwrap().push(log_prefix.to_owned());
            Ok(())
        }

        fn tear_down(&self) {
            *self.teardowns.lock().unwrap() += 1;
        }

        fn net_out(&self, rule: &NetOutRule) -> Result<(), NetworkError> {
            self.rules.lock().unwrap().push(rule.clone());
            Ok(())
        }
    }

    pub struct FakeFilterProvider {
        pub filter: Arc<FakeFilter>,
        pub provided: Mutex<Vec<String>>,
    }

    impl Default for FakeFilterProvider {
        fn default() -> Self {
            Self {
                filter: Arc::new(FakeFilter::default()),
                provided: Mutex::new(Vec::new()),
            }
        }
    }

    impl FilterProvider for FakeFilterProvider {
        fn provide(&self, container_id: &str) -> Arc<dyn Filter> {
            self.provided.lock().unwrap().push(container_id.to_owned());
            Arc::clone(&self.filter) as Arc<dyn Filter>
        }
    }

    #[derive(Default)]
    pub struct FakeChainTeardown {
        pub torn_down: Mutex<Vec<String>>,
        pub fail: Mutex<Option<String>>,
    }

    impl ChainTeardown for FakeChainTeardown {
        fn container_teardown(&self, container_id: &str) -> Result<(), NetworkError> {
            if let Some(message) = self.fail.lock().unwrap().clone() {
                return Err(NetworkError::Iptables(message));
            }
            self.torn_down.lock().unwrap().push(container_id.to_owned());
            Ok(())
        }
    }
}
