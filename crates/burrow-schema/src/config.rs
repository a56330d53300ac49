//! Daemon-wide naming configuration.
//!
//! Every host-visible artifact (iptables chains, network interfaces) is
//! namespaced by a short daemon tag so several daemons can share a host
//! without clobbering each other's state.

#[derive(Debug, Clone)]
pub struct Config {
    pub tag: String,
    /// Prefix for host-side network interfaces (bridges, veth pairs).
    pub network_interface_prefix: String,
    pub filter: FilterConfig,
    pub nat: NatConfig,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub allow_host_access: bool,
    pub input_chain: String,
    pub forward_chain: String,
    pub default_chain: String,
    pub instance_prefix: String,
}

#[derive(Debug, Clone)]
pub struct NatConfig {
    pub prerouting_chain: String,
    pub postrouting_chain: String,
    pub instance_prefix: String,
}

impl Config {
    pub fn new(tag: &str, allow_host_access: bool) -> Self {
        Self {
            tag: tag.to_owned(),
            network_interface_prefix: format!("w{tag}"),
            filter: FilterConfig {
                allow_host_access,
                input_chain: format!("w-{tag}-input"),
                forward_chain: format!("w-{tag}-forward"),
                default_chain: format!("w-{tag}-default"),
                instance_prefix: format!("w-{tag}-instance-"),
            },
            nat: NatConfig {
                prerouting_chain: format!("w-{tag}-prerouting"),
                postrouting_chain: format!("w-{tag}-postrouting"),
                instance_prefix: format!("w-{tag}-instance-"),
            },
        }
    }

    /// Name of the filter instance chain for one container.
    pub fn instance_chain(&self, container_id: &str) -> String {
        format!("{}{container_id}", self.filter.instance_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_derive_from_tag() {
        let config = Config::new("0", false);
        assert_eq!(config.filter.input_chain, "w-0-input");
        assert_eq!(config.filter.forward_chain, "w-0-forward");
        assert_eq!(config.filter.default_chain, "w-0-default");
        assert_eq!(config.nat.prerouting_chain, "w-0-prerouting");
        assert_eq!(config.nat.postrouting_chain, "w-0-postrouting");
        assert_eq!(config.network_interface_prefix, "w0");
    }

    #[test]
    fn instance_chain_appends_the_container_id() {
        let config = Config::new("4", true);
        assert_eq!(config.instance_chain("abc123"), "w-4-instance-abc123");
    }
}
