//! Resource pool lifecycle suite: acquire/release/prune/restore against
//! fake collaborators, with the real subnet, bridge, and port pools.

use burrow_network::bridge::fake::{FakeBridgeDestroyer, FakeBridgeLister};
use burrow_network::bridge::{BridgeDestroyer, BridgeLister};
use burrow_network::filter::fake::{FakeChainTeardown, FakeFilterProvider};
use burrow_network::iptables::{Chain, IPTABLES_BIN};
use burrow_network::{BridgeManager, ChainTeardown, FilterProvider, PortPool, SubnetPool};
use burrow_pool::providers::fake::{FakeMkdirChowner, FakeRootFsCleaner, FakeRootFsProvider};
use burrow_pool::{PoolConfig, ResourcePool};
use burrow_schema::record::{ContainerRecord, Network, State};
use burrow_schema::snapshot::{ContainerSnapshot, NetworkSnapshot, ResourcesSnapshot};
use burrow_schema::types::{
    BindMount, BindMountMode, BindMountOrigin, ContainerSpec, DiskLimitScope, DiskLimits,
};
use burrow_schema::Config;
use burrow_system::command::fake::{CommandSpec, FakeCommandRunner};
use burrow_system::{CommandRunner, SystemError};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _depot_dir: tempfile::TempDir,
    depot_path: PathBuf,
    runner: Arc<FakeCommandRunner>,
    bridges: Arc<BridgeManager>,
    bridge_destroyer: Arc<FakeBridgeDestroyer>,
    bridge_lister: Arc<FakeBridgeLister>,
    chain_teardown: Arc<FakeChainTeardown>,
    filter_provider: Arc<FakeFilterProvider>,
    port_pool: Arc<PortPool>,
    subnet_pool: Arc<SubnetPool>,
    provider: Arc<FakeRootFsProvider>,
    cleaner: Arc<FakeRootFsCleaner>,
    mkdir: Arc<FakeMkdirChowner>,
    pool: ResourcePool,
}

fn fixture() -> Fixture {
    let depot_dir = tempfile::tempdir().unwrap();
    let depot_path = depot_dir.path().to_path_buf();

    let runner = Arc::new(FakeCommandRunner::new());
    let bridge_destroyer = Arc::new(FakeBridgeDestroyer::default());
    let bridge_lister = Arc::new(FakeBridgeLister::default());
    let bridges = Arc::new(BridgeManager::new(
        "w0b-",
        Arc::clone(&bridge_destroyer) as Arc<dyn BridgeDestroyer>,
        Arc::clone(&bridge_lister) as Arc<dyn BridgeLister>,
    ));
    let chain_teardown = Arc::new(FakeChainTeardown::default());
    let filter_provider = Arc::new(FakeFilterProvider::default());
    let port_pool = Arc::new(PortPool::new(61001, 100));
    let subnet_pool = Arc::new(SubnetPool::new("10.2.0.0/28".parse().unwrap()));
    let provider = Arc::new(FakeRootFsProvider::default());
    let cleaner = Arc::new(FakeRootFsCleaner::default());
    let mkdir = Arc::new(FakeMkdirChowner::default());

    let pool = ResourcePool::new(PoolConfig {
        bin_path: PathBuf::from("/root/path"),
        depot_path: depot_path.clone(),
        config: Config::new("0", false),
        uid_mapping_base: 700000,
        external_ip: "1.2.3.4".parse().unwrap(),
        mtu: 345,
        allow_networks: vec![
            "1.1.1.1/32".to_owned(),
            String::new(),
            "2.2.2.2/32".to_owned(),
        ],
        deny_networks: vec![
            "1.1.0.0/16".to_owned(),
            String::new(),
            "2.2.0.0/16".to_owned(),
        ],
        version: semver::Version::new(1, 0, 0),
        subnet_pool: Arc::clone(&subnet_pool),
        bridges: Arc::clone(&bridges),
        chain_teardown: Arc::clone(&chain_teardown) as Arc<dyn ChainTeardown>,
        filter_provider: Arc::clone(&filter_provider) as Arc<dyn FilterProvider>,
        global_chain: Chain::new(
            "global-default-chain",
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
        ),
        port_pool: Arc::clone(&port_pool),
        rootfs_provider: Arc::clone(&provider) as _,
        rootfs_cleaner: Arc::clone(&cleaner) as _,
        mkdir_chowner: Arc::clone(&mkdir) as _,
        runner: Arc::clone(&runner) as Arc<dyn CommandRunner>,
    });

    Fixture {
        _depot_dir: depot_dir,
        depot_path,
        runner,
        bridges,
        bridge_destroyer,
        bridge_lister,
        chain_teardown,
        filter_provider,
        port_pool,
        subnet_pool,
        provider,
        cleaner,
        mkdir,
        pool,
    }
}

fn iptables_spec(args: &[&str]) -> CommandSpec {
    let mut full = vec!["-w".to_owned()];
    full.extend(args.iter().map(|s| (*s).to_owned()));
    CommandSpec::with_args(IPTABLES_BIN, full)
}

fn fail(message: &str) -> SystemError {
    SystemError::Failed(message.to_owned())
}

mod setup {
    use super::*;

    #[test]
    fn executes_setup_sh_with_the_depot_environment() {
        let f = fixture();
        f.pool.setup().unwrap();

        let commands = f.runner.executed_commands();
        let setup = commands
            .iter()
            .find(|c| c.path == "/root/path/setup.sh")
            .expect("setup.sh should run");
        let env = setup.env.clone().unwrap();
        assert!(env.contains(&format!("CONTAINER_DEPOT_PATH={}", f.depot_path.display())));
        assert!(env.contains(&format!("PATH={}", std::env::var("PATH").unwrap())));
    }

    #[test]
    fn installs_allow_rules_before_deny_rules_skipping_empties() {
        let f = fixture();
        f.pool.setup().unwrap();

        assert!(f.runner.executed_serially(&[
            CommandSpec::path("/root/path/setup.sh"),
            iptables_spec(&[
                "-A", "global-default-chain", "--destination", "1.1.1.1/32",
                "--jump", "RETURN",
            ]),
            iptables_spec(&[
                "-A", "global-default-chain", "--destination", "2.2.2.2/32",
                "--jump", "RETURN",
            ]),
            iptables_spec(&[
                "-A", "global-default-chain", "--destination", "1.1.0.0/16",
                "--jump", "REJECT",
            ]),
            iptables_spec(&[
                "-A", "global-default-chain", "--destination", "2.2.0.0/16",
                "--jump", "REJECT",
            ]),
        ]));
    }

    #[test]
    fn surfaces_setup_sh_failures_unwrapped() {
        let f = fixture();
        f.runner
            .when_running(CommandSpec::path("/root/path/setup.sh"), |_| {
                Err(fail("oh no!"))
            });

        assert_eq!(f.pool.setup().unwrap_err().to_string(), "oh no!");
    }

    #[test]
    fn wraps_global_rule_failures() {
        let f = fixture();
        f.runner
            .when_running(CommandSpec::path(IPTABLES_BIN), |_| Err(fail("oh no!")));

        assert_eq!(
            f.pool.setup().unwrap_err().to_string(),
            "resource_pool: setting up allow rules in iptables: oh no!"
        );
    }
}

mod acquiring {
    use super::*;

    #[test]
    fn returns_containers_with_unique_ids() {
        let f = fixture();
        let first = f.pool.acquire(ContainerSpec::default()).unwrap();
        let second = f.pool.acquire(ContainerSpec::default()).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn keeps_grace_time_and_properties() {
        let f = fixture();
        let record = f
            .pool
            .acquire(ContainerSpec {
                grace_time: Duration::from_secs(1),
                properties: BTreeMap::from([("foo".to_owned(), "bar".to_owned())]),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(record.grace_time, Duration::from_secs(1));
        assert_eq!(record.properties.get("foo").unwrap(), "bar");
        assert_eq!(record.state, State::Born);
    }

    #[test]
    fn sets_up_the_filter_with_the_handle_as_log_prefix() {
        let f = fixture();
        let record = f
            .pool
            .acquire(ContainerSpec {
                handle: "test-handle".to_owned(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            *f.filter_provider.provided.lock().unwrap(),
            vec![record.id.to_string()]
        );
        assert_eq!(
            *f.filter_provider.filter.setups.lock().unwrap(),
            vec!["test-handle".to_owned()]
        );
    }

    #[test]
    fn forwards_disk_limits_to_the_rootfs_provider() {
        let f = fixture();
        f.pool
            .acquire(ContainerSpec {
                disk_limits: DiskLimits {
                    byte_hard: 98765,
                    scope: DiskLimitScope::Exclusive,
                },
                ..Default::default()
            })
            .unwrap();

        let created = f.provider.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.quota_size, 98765);
        assert_eq!(created[0].1.quota_scope, DiskLimitScope::Exclusive);
    }

    #[test]
    fn unprivileged_containers_are_namespaced_with_mapped_root() {
        let f = fixture();
        let record = f
            .pool
            .acquire(ContainerSpec {
                privileged: false,
                ..Default::default()
            })
            .unwrap();

        assert!(f.provider.created.lock().unwrap()[0].1.namespaced);
        assert_eq!(record.resources.root_uid, 700000);
    }

    #[test]
    fn executes_create_sh_with_the_documented_environment() {
        let f = fixture();
        let record = f.pool.acquire(ContainerSpec::default()).unwrap();

        let container_path = f.depot_path.join(record.id.as_str());
        let commands = f.runner.executed_commands();
        let create = commands
            .iter()
            .find(|c| c.path == "/root/path/create.sh")
            .expect("create.sh should run");

        assert_eq!(
            create.args,
            vec![container_path.to_string_lossy().into_owned()]
        );
        assert_eq!(
            create.env.clone().unwrap(),
            vec![
                format!("PATH={}", std::env::var("PATH").unwrap()),
                "bridge_iface=w0b-0a020000".to_owned(),
                "container_iface_mtu=345".to_owned(),
                "external_ip=1.2.3.4".to_owned(),
                format!("id={}", record.id),
                "network_cidr=10.2.0.0/30".to_owned(),
                "network_cidr_suffix=30".to_owned(),
                "network_container_ip=10.2.0.2".to_owned(),
                "network_host_ip=10.2.0.1".to_owned(),
                "root_uid=700000".to_owned(),
                "rootfs_path=/provided/rootfs/path".to_owned(),
            ]
        );
    }

    #[test]
    fn privileged_containers_run_create_sh_with_root_uid_zero() {
        let f = fixture();
        f.pool
            .acquire(ContainerSpec {
                privileged: true,
                ..Default::default()
            })
            .unwrap();

        let commands = f.runner.executed_commands();
        let create = commands
            .iter()
            .find(|c| c.path == "/root/path/create.sh")
            .unwrap();
        assert!(create
            .env
            .clone()
            .unwrap()
            .contains(&"root_uid=0".to_owned()));
    }

    #[test]
    fn a_static_network_is_respected_in_the_create_environment() {
        let f = fixture();
        f.pool
            .acquire(ContainerSpec {
                network: "10.3.0.0/29".to_owned(),
                ..Default::default()
            })
            .unwrap();

        let commands = f.runner.executed_commands();
        let env = commands
            .iter()
            .find(|c| c.path == "/root/path/create.sh")
            .unwrap()
            .env
            .clone()
            .unwrap();
        assert!(env.contains(&"network_cidr=10.3.0.0/29".to_owned()));
        assert!(env.contains(&"network_cidr_suffix=29".to_owned()));
        assert!(env.contains(&"network_container_ip=10.3.0.2".to_owned()));
        assert!(env.contains(&"network_host_ip=10.3.0.1".to_owned()));
    }

    #[test]
    fn an_invalid_network_spec_has_no_side_effects() {
        let f = fixture();
        let err = f
            .pool
            .acquire(ContainerSpec {
                network: "not a network".to_owned(),
                ..Default::default()
            })
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("create container: invalid network spec"));
        assert!(f.runner.executed_commands().is_empty());
        assert!(f.provider.created.lock().unwrap().is_empty());
        assert!(f.pool.depot().list().unwrap().is_empty());
    }

    #[test]
    fn writes_bridge_name_provider_tag_and_version_to_the_depot() {
        let f = fixture();
        let record = f.pool.acquire(ContainerSpec::default()).unwrap();
        let dir = f.depot_path.join(record.id.as_str());

        assert_eq!(
            std::fs::read_to_string(dir.join("bridge-name")).unwrap(),
            "w0b-0a020000"
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("rootfs-provider")).unwrap(),
            "fake-provider"
        );
        assert_eq!(std::fs::read_to_string(dir.join("version")).unwrap(), "1.0.0");
        assert_eq!(record.version, Some(semver::Version::new(1, 0, 0)));
    }

    #[test]
    fn merges_rootfs_env_with_spec_env_spec_takes_precedence() {
        let f = fixture();
        f.provider.create_result.lock().unwrap().1 = vec![
            "var2=rootfs-value-2".to_owned(),
            "var3=rootfs-value-3".to_owned(),
        ];

        let record = f
            .pool
            .acquire(ContainerSpec {
                env: vec!["var1=spec-value1".to_owned(), "var2=spec-value2".to_owned()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            record.env,
            vec![
                "var1=spec-value1".to_owned(),
                "var2=spec-value2".to_owned(),
                "var3=rootfs-value-3".to_owned(),
            ]
        );
    }

    #[test]
    fn cleans_the_provided_rootfs() {
        let f = fixture();
        f.pool.acquire(ContainerSpec::default()).unwrap();
        assert_eq!(
            *f.cleaner.cleaned.lock().unwrap(),
            vec![PathBuf::from("/provided/rootfs/path")]
        );
    }

    #[test]
    fn runs_rootfs_garbage_collection_and_ignores_its_failures() {
        let f = fixture();
        f.pool.acquire(ContainerSpec::default()).unwrap();
        assert_eq!(*f.provider.gc_count.lock().unwrap(), 1);

        *f.provider.gc_error.lock().unwrap() = Some("potato".to_owned());
        assert!(f.pool.acquire(ContainerSpec::default()).is_ok());
    }
}

mod acquire_failures {
    use super::*;

    fn assert_no_container_directory(f: &Fixture) {
        assert!(f.pool.depot().list().unwrap().is_empty());
    }

    #[test]
    fn a_malformed_environment_unwinds_everything_before_create() {
        let f = fixture();
        let err = f
            .pool
            .acquire(ContainerSpec {
                env: vec![
                    "hello=world".to_owned(),
                    "invalidstring".to_owned(),
                    String::new(),
                    "=12".to_owned(),
                ],
                ..Default::default()
            })
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("process: malformed environment"));
        assert!(f.runner.never_ran(&CommandSpec::path("/root/path/create.sh")));
        assert_eq!(f.provider.destroyed.lock().unwrap().len(), 1);
        assert_eq!(
            *f.bridge_destroyer.destroyed.lock().unwrap(),
            vec!["w0b-0a020000".to_owned()]
        );
        assert_no_container_directory(&f);

        // The subnet made it back: the pool can still fill to capacity.
        for _ in 0..f.pool.max_containers() {
            f.pool.acquire(ContainerSpec::default()).unwrap();
        }
    }

    #[test]
    fn a_rootfs_provider_failure_releases_subnet_and_bridge() {
        let f = fixture();
        *f.provider.create_error.lock().unwrap() = Some("oh no!".to_owned());

        let err = f.pool.acquire(ContainerSpec::default()).unwrap_err();
        assert_eq!(err.to_string(), "oh no!");
        assert!(f.runner.never_ran(&CommandSpec::path("/root/path/create.sh")));
        assert!(f.runner.never_ran(&CommandSpec::path("/root/path/destroy.sh")));
        assert_eq!(
            *f.bridge_destroyer.destroyed.lock().unwrap(),
            vec!["w0b-0a020000".to_owned()]
        );
        assert_no_container_directory(&f);
    }

    #[test]
    fn a_rootfs_cleaner_failure_destroys_the_provided_rootfs() {
        let f = fixture();
        *f.cleaner.clean_error.lock().unwrap() = Some("oh no!".to_owned());

        let err = f.pool.acquire(ContainerSpec::default()).unwrap_err();
        assert_eq!(err.to_string(), "oh no!");
        assert_eq!(f.provider.destroyed.lock().unwrap().len(), 1);
        assert!(f.runner.never_ran(&CommandSpec::path("/root/path/create.sh")));
        assert_no_container_directory(&f);
    }

    #[test]
    fn a_create_sh_failure_runs_the_destroy_script_and_unwinds() {
        let f = fixture();
        f.runner
            .when_running(CommandSpec::path("/root/path/create.sh"), |_| {
                Err(fail("oh no!"))
            });

        let err = f.pool.acquire(ContainerSpec::default()).unwrap_err();
        assert_eq!(err.to_string(), "oh no!");

        assert!(f.runner.executed_serially(&[
            CommandSpec::path("/root/path/create.sh"),
            CommandSpec::path("/root/path/destroy.sh"),
        ]));
        assert_eq!(f.chain_teardown.torn_down.lock().unwrap().len(), 1);
        assert_eq!(f.provider.destroyed.lock().unwrap().len(), 1);
        assert_eq!(
            *f.bridge_destroyer.destroyed.lock().unwrap(),
            vec!["w0b-0a020000".to_owned()]
        );
        assert_no_container_directory(&f);
    }

    #[test]
    fn a_filter_setup_failure_is_wrapped_and_unwinds() {
        let f = fixture();
        *f.filter_provider.filter.setup_error.lock().unwrap() =
            Some("iptables says no".to_owned());

        let err = f.pool.acquire(ContainerSpec::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource_pool: set up filter: iptables: iptables says no"
        );

        assert!(f.runner.executed_serially(&[
            CommandSpec::path("/root/path/create.sh"),
            CommandSpec::path("/root/path/destroy.sh"),
        ]));
        assert_eq!(f.provider.destroyed.lock().unwrap().len(), 1);
        assert_no_container_directory(&f);
    }

    #[test]
    fn a_mkdir_chowner_failure_propagates() {
        let f = fixture();
        *f.mkdir.fail.lock().unwrap() = Some("wow!".to_owned());

        let err = f
            .pool
            .acquire(ContainerSpec {
                bind_mounts: vec![BindMount {
                    src_path: "/src".to_owned(),
                    dst_path: "/dst".to_owned(),
                    mode: BindMountMode::ReadOnly,
                    origin: BindMountOrigin::Host,
                }],
                ..Default::default()
            })
            .unwrap_err();

        assert!(err.to_string().contains("wow"));
        assert!(f.runner.executed_serially(&[
            CommandSpec::path("/root/path/create.sh"),
            CommandSpec::path("/root/path/destroy.sh"),
        ]));
    }

    #[test]
    fn a_hook_append_failure_runs_the_destroy_script() {
        let f = fixture();
        f.runner
            .when_running(CommandSpec::path("bash"), |_| Err(fail("oh no!")));

        let err = f
            .pool
            .acquire(ContainerSpec {
                bind_mounts: vec![BindMount {
                    src_path: "/src/path-ro".to_owned(),
                    dst_path: "/dst/path-ro".to_owned(),
                    mode: BindMountMode::ReadOnly,
                    origin: BindMountOrigin::Host,
                }],
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "oh no!");
        assert!(f.runner.executed_serially(&[
            CommandSpec::path("/root/path/create.sh"),
            CommandSpec::path("/root/path/destroy.sh"),
        ]));
        assert_eq!(f.provider.destroyed.lock().unwrap().len(), 1);
    }

    #[test]
    fn an_exhausted_subnet_pool_surfaces_without_side_effects() {
        let f = fixture();
        for _ in 0..f.pool.max_containers() {
            f.pool.acquire(ContainerSpec::default()).unwrap();
        }
        let executed_before = f.runner.executed_commands().len();

        let err = f.pool.acquire(ContainerSpec::default()).unwrap_err();
        assert!(err.to_string().contains("insufficient subnets"));
        assert_eq!(f.runner.executed_commands().len(), executed_before);
    }
}

mod bind_mounts {
    use super::*;

    fn bash_echo(line: &str) -> CommandSpec {
        CommandSpec::with_args("bash", ["-c", line])
    }

    #[test]
    fn appends_mount_commands_to_the_pre_clone_hook() {
        let f = fixture();
        let record = f
            .pool
            .acquire(ContainerSpec {
                bind_mounts: vec![
                    BindMount {
                        src_path: "/src/path-ro".to_owned(),
                        dst_path: "/dst/path-ro".to_owned(),
                        mode: BindMountMode::ReadOnly,
                        origin: BindMountOrigin::Host,
                    },
                    BindMount {
                        src_path: "/src/path-rw".to_owned(),
                        dst_path: "/dst/path-rw".to_owned(),
                        mode: BindMountMode::ReadWrite,
                        origin: BindMountOrigin::Host,
                    },
                    BindMount {
                        src_path: "/src/path-rw".to_owned(),
                        dst_path: "/dst/path-rw".to_owned(),
                        mode: BindMountMode::ReadWrite,
                        origin: BindMountOrigin::Container,
                    },
                ],
                ..Default::default()
            })
            .unwrap();

        let hook = f
            .depot_path
            .join(record.id.as_str())
            .join("lib/hook-parent-before-clone.sh");
        let hook = hook.display();
        let rootfs = "/provided/rootfs/path";

        assert!(f.runner.executed_serially(&[
            bash_echo(&format!("echo >> {hook}")),
            bash_echo(&format!(
                "echo mount -n --bind /src/path-ro {rootfs}/dst/path-ro >> {hook}"
            )),
            bash_echo(&format!(
                "echo mount -n --bind -o remount,ro /src/path-ro {rootfs}/dst/path-ro >> {hook}"
            )),
            bash_echo(&format!("echo >> {hook}")),
            bash_echo(&format!(
                "echo mount -n --bind /src/path-rw {rootfs}/dst/path-rw >> {hook}"
            )),
            bash_echo(&format!(
                "echo mount -n --bind -o remount,rw /src/path-rw {rootfs}/dst/path-rw >> {hook}"
            )),
            bash_echo(&format!(
                "echo mount -n --bind {rootfs}/src/path-rw {rootfs}/dst/path-rw >> {hook}"
            )),
            bash_echo(&format!(
                "echo mount -n --bind -o remount,rw {rootfs}/src/path-rw {rootfs}/dst/path-rw >> {hook}"
            )),
        ]));
    }

    #[test]
    fn creates_destinations_beneath_the_rootfs_with_container_root_ownership() {
        let f = fixture();
        f.pool
            .acquire(ContainerSpec {
                bind_mounts: vec![
                    BindMount {
                        src_path: "/src/path-ro".to_owned(),
                        dst_path: "/dst/path-ro".to_owned(),
                        mode: BindMountMode::ReadOnly,
                        origin: BindMountOrigin::Host,
                    },
                    BindMount {
                        src_path: "/src/path-rw".to_owned(),
                        dst_path: "/dst/path-rw".to_owned(),
                        mode: BindMountMode::ReadWrite,
                        origin: BindMountOrigin::Host,
                    },
                    BindMount {
                        src_path: "/src/path-rw".to_owned(),
                        dst_path: "/dst/path-rw".to_owned(),
                        mode: BindMountMode::ReadWrite,
                        origin: BindMountOrigin::Container,
                    },
                ],
                ..Default::default()
            })
            .unwrap();

        let calls = f.mkdir.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[0],
            (
                PathBuf::from("/provided/rootfs/path/dst/path-ro"),
                700000,
                700000,
                0o755
            )
        );
    }
}

mod releasing {
    use super::*;

    fn acquired(f: &Fixture) -> ContainerRecord {
        f.pool.acquire(ContainerSpec::default()).unwrap()
    }

    #[test]
    fn runs_the_destroy_script_and_tears_down_chains() {
        let f = fixture();
        let record = acquired(&f);
        let container_path = f.depot_path.join(record.id.as_str());

        f.pool.release(&record).unwrap();

        assert!(f.runner.executed_serially(&[CommandSpec::with_args(
            "/root/path/destroy.sh",
            [container_path.to_string_lossy().into_owned()],
        )]));
        assert_eq!(
            *f.chain_teardown.torn_down.lock().unwrap(),
            vec![record.id.to_string()]
        );
        assert_eq!(*f.filter_provider.filter.teardowns.lock().unwrap(), 1);
    }

    #[test]
    fn destroys_the_rootfs_and_releases_bridge_subnet_and_ports() {
        let f = fixture();
        let mut record = acquired(&f);
        record.resources.ports = vec![f.port_pool.acquire().unwrap()];

        f.pool.release(&record).unwrap();

        assert_eq!(
            *f.provider.destroyed.lock().unwrap(),
            vec![record.id.to_string()]
        );
        assert_eq!(
            *f.bridge_destroyer.destroyed.lock().unwrap(),
            vec!["w0b-0a020000".to_owned()]
        );
        // The released port can be claimed again.
        f.port_pool.remove(record.resources.ports[0]).unwrap();
        // The depot entry is gone.
        assert!(f.pool.depot().list().unwrap().is_empty());
    }

    #[test]
    fn a_destroy_script_failure_stops_the_sequence() {
        let f = fixture();
        let record = acquired(&f);
        f.runner
            .when_running(CommandSpec::path("/root/path/destroy.sh"), |_| {
                Err(fail("oh no!"))
            });

        let err = f.pool.release(&record).unwrap_err();
        assert_eq!(err.to_string(), "oh no!");
        assert!(f.provider.destroyed.lock().unwrap().is_empty());
        assert!(f.bridge_destroyer.destroyed.lock().unwrap().is_empty());
    }

    #[test]
    fn a_rootfs_destroy_failure_keeps_downstream_resources_held() {
        let f = fixture();
        let record = acquired(&f);
        *f.provider.destroy_error.lock().unwrap() = Some("oh no!".to_owned());

        let err = f.pool.release(&record).unwrap_err();
        assert_eq!(err.to_string(), "oh no!");
        assert!(f.bridge_destroyer.destroyed.lock().unwrap().is_empty());
    }

    #[test]
    fn a_bridge_release_failure_is_wrapped() {
        let f = fixture();
        let record = acquired(&f);
        *f.bridge_destroyer.fail.lock().unwrap() = Some("jam in the bridge".to_owned());

        let err = f.pool.release(&record).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("resource_pool: release bridge w0b-0a020000"));
        assert!(message.contains("jam in the bridge"));
    }

    #[test]
    fn chain_teardown_failures_are_not_fatal() {
        let f = fixture();
        let record = acquired(&f);
        *f.chain_teardown.fail.lock().unwrap() = Some("oh no!".to_owned());

        f.pool.release(&record).unwrap();
        assert!(f
            .runner
            .executed_serially(&[CommandSpec::path("/root/path/destroy.sh")]));
    }

    #[test]
    fn release_can_be_retried_after_success() {
        let f = fixture();
        let record = acquired(&f);
        f.pool.release(&record).unwrap();
        f.pool.release(&record).unwrap();
    }

    #[test]
    fn a_released_static_subnet_can_be_acquired_again() {
        let f = fixture();
        let record = f
            .pool
            .acquire(ContainerSpec {
                network: "1.2.3.0/30".to_owned(),
                ..Default::default()
            })
            .unwrap();

        f.pool.release(&record).unwrap();

        f.pool
            .acquire(ContainerSpec {
                network: "1.2.3.0/30".to_owned(),
                ..Default::default()
            })
            .expect("the subnet should have been returned to the pool");
    }
}

mod pruning {
    use super::*;

    fn seed_depot(f: &Fixture) {
        for id in ["container-1", "container-2", "container-3"] {
            std::fs::create_dir_all(f.depot_path.join(id)).unwrap();
        }
        std::fs::create_dir_all(f.depot_path.join("tmp")).unwrap();

        std::fs::write(
            f.depot_path.join("container-1/bridge-name"),
            "fake-bridge-1",
        )
        .unwrap();
        std::fs::write(
            f.depot_path.join("container-2/bridge-name"),
            "fake-bridge-2",
        )
        .unwrap();

        std::fs::write(
            f.depot_path.join("container-1/rootfs-provider"),
            "fake-provider",
        )
        .unwrap();
        std::fs::write(
            f.depot_path.join("container-2/rootfs-provider"),
            "fake-provider",
        )
        .unwrap();
        std::fs::write(f.depot_path.join("container-3/rootfs-provider"), "").unwrap();
    }

    #[test]
    fn destroys_every_container_not_in_the_keep_set() {
        let f = fixture();
        seed_depot(&f);

        let report = f.pool.prune(&HashSet::new()).unwrap();

        assert_eq!(
            *f.chain_teardown.torn_down.lock().unwrap(),
            vec!["container-1", "container-2", "container-3"]
        );
        assert!(f.runner.executed_serially(&[
            CommandSpec::with_args(
                "/root/path/destroy.sh",
                [f.depot_path.join("container-1").to_string_lossy().into_owned()],
            ),
            CommandSpec::with_args(
                "/root/path/destroy.sh",
                [f.depot_path.join("container-2").to_string_lossy().into_owned()],
            ),
            CommandSpec::with_args(
                "/root/path/destroy.sh",
                [f.depot_path.join("container-3").to_string_lossy().into_owned()],
            ),
        ]));
        assert_eq!(
            report.destroyed,
            vec!["container-1", "container-2", "container-3"]
        );
        assert!(report.failures.is_empty());
    }

    #[test]
    fn cleans_rootfs_only_for_containers_with_a_matching_tag() {
        let f = fixture();
        seed_depot(&f);

        f.pool.prune(&HashSet::new()).unwrap();

        // container-3 declared an empty provider tag: nothing to clean.
        assert_eq!(
            *f.provider.destroyed.lock().unwrap(),
            vec!["container-1", "container-2"]
        );
    }

    #[test]
    fn a_missing_tag_file_uses_the_default_provider() {
        let f = fixture();
        seed_depot(&f);
        std::fs::remove_file(f.depot_path.join("container-2/rootfs-provider")).unwrap();

        f.pool.prune(&HashSet::new()).unwrap();

        assert!(f
            .provider
            .destroyed
            .lock()
            .unwrap()
            .contains(&"container-2".to_owned()));
    }

    #[test]
    fn an_unknown_tag_means_nothing_to_clean() {
        let f = fixture();
        seed_depot(&f);
        std::fs::write(f.depot_path.join("container-2/rootfs-provider"), "unknown").unwrap();

        f.pool.prune(&HashSet::new()).unwrap();

        assert!(!f
            .provider
            .destroyed
            .lock()
            .unwrap()
            .contains(&"container-2".to_owned()));
    }

    #[test]
    fn releases_recorded_bridges() {
        let f = fixture();
        seed_depot(&f);

        f.pool.prune(&HashSet::new()).unwrap();

        let destroyed = f.bridge_destroyer.destroyed.lock().unwrap();
        assert!(destroyed.contains(&"fake-bridge-1".to_owned()));
        assert!(destroyed.contains(&"fake-bridge-2".to_owned()));
    }

    #[test]
    fn kept_containers_are_untouched() {
        let f = fixture();
        seed_depot(&f);

        let keep = HashSet::from(["container-2".to_owned()]);
        let report = f.pool.prune(&keep).unwrap();

        assert!(f.runner.never_ran(&CommandSpec::with_args(
            "/root/path/destroy.sh",
            [f.depot_path.join("container-2").to_string_lossy().into_owned()],
        )));
        assert_eq!(f.chain_teardown.torn_down.lock().unwrap().len(), 2);
        assert_eq!(report.kept, vec!["container-2"]);
        assert!(f
            .pool
            .depot()
            .list()
            .unwrap()
            .contains(&"container-2".to_owned()));
    }

    #[test]
    fn a_chain_teardown_failure_skips_the_container_but_not_the_sweep() {
        let f = fixture();
        seed_depot(&f);
        *f.chain_teardown.fail.lock().unwrap() = Some("oh no!".to_owned());

        let report = f.pool.prune(&HashSet::new()).unwrap();

        assert!(f.runner.never_ran(&CommandSpec::path("/root/path/destroy.sh")));
        assert_eq!(report.failures.len(), 3);
        assert!(report.destroyed.is_empty());
    }

    #[test]
    fn a_destroy_script_failure_skips_rootfs_cleanup() {
        let f = fixture();
        seed_depot(&f);
        f.runner
            .when_running(CommandSpec::path("/root/path/destroy.sh"), |_| {
                Err(fail("oh no!"))
            });

        let report = f.pool.prune(&HashSet::new()).unwrap();

        assert!(f.provider.destroyed.lock().unwrap().is_empty());
        assert_eq!(report.failures.len(), 3);
    }

    #[test]
    fn prunes_bridges_with_no_remaining_reservations() {
        let f = fixture();
        *f.bridge_lister.names.lock().unwrap() =
            vec!["w0b-stale".to_owned(), "eth0".to_owned()];

        f.pool.prune(&HashSet::new()).unwrap();

        assert!(f
            .bridge_destroyer
            .destroyed
            .lock()
            .unwrap()
            .contains(&"w0b-stale".to_owned()));
    }
}

mod restoring {
    use super::*;

    fn snapshot() -> ContainerSnapshot {
        ContainerSnapshot {
            id: "some-restored-id".to_owned(),
            handle: "some-restored-handle".to_owned(),
            grace_time_ns: 1_000_000_000,
            state: "some-restored-state".to_owned(),
            events: vec![
                "some-restored-event".to_owned(),
                "some-other-restored-event".to_owned(),
            ],
            resources: ResourcesSnapshot {
                root_uid: 10001,
                network: NetworkSnapshot {
                    ip: "10.3.4.5".parse().unwrap(),
                    subnet: "10.3.4.0/29".parse().unwrap(),
                },
                bridge: "some-bridge".to_owned(),
                ports: vec![61001, 61002, 61003],
            },
            properties: BTreeMap::from([("foo".to_owned(), "bar".to_owned())]),
        }
    }

    fn encode(snapshot: &ContainerSnapshot) -> Vec<u8> {
        let mut buf = Vec::new();
        snapshot.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn constructs_a_record_from_the_snapshot() {
        let f = fixture();
        let record = f.pool.restore(encode(&snapshot()).as_slice()).unwrap();

        assert_eq!(record.id, "some-restored-id");
        assert_eq!(record.handle, "some-restored-handle");
        assert_eq!(record.grace_time, Duration::from_secs(1));
        assert_eq!(record.state, State::Stopped);
        assert_eq!(
            record.events,
            vec!["some-restored-event", "some-other-restored-event"]
        );
        assert_eq!(record.properties.get("foo").unwrap(), "bar");
        assert_eq!(record.resources.bridge_name, "some-bridge");
        assert_eq!(record.resources.root_uid, 10001);
        assert_eq!(record.resources.ports, vec![61001, 61002, 61003]);
        assert_eq!(record.version, None);
    }

    #[test]
    fn reads_the_version_file_when_present() {
        let f = fixture();
        let dir = f.depot_path.join("some-restored-id");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("version"), "1.0.0").unwrap();

        let record = f.pool.restore(encode(&snapshot()).as_slice()).unwrap();
        assert_eq!(record.version, Some(semver::Version::new(1, 0, 0)));
    }

    #[test]
    fn claims_the_network_so_it_cannot_be_reallocated() {
        let f = fixture();
        f.pool.restore(encode(&snapshot()).as_slice()).unwrap();

        let network = Network {
            ip: "10.3.4.5".parse().unwrap(),
            subnet: "10.3.4.0/29".parse().unwrap(),
        };
        assert!(f.subnet_pool.remove(network).is_err());
    }

    #[test]
    fn claims_the_ports() {
        let f = fixture();
        f.pool.restore(encode(&snapshot()).as_slice()).unwrap();

        for port in [61001, 61002, 61003] {
            assert!(f.port_pool.remove(port).is_err(), "port {port}");
        }
    }

    #[test]
    fn rereserves_the_bridge() {
        let f = fixture();
        f.pool.restore(encode(&snapshot()).as_slice()).unwrap();

        // The reservation is live: releasing it destroys the bridge.
        f.bridges
            .release("some-bridge", "some-restored-id")
            .unwrap();
        assert_eq!(
            *f.bridge_destroyer.destroyed.lock().unwrap(),
            vec!["some-bridge".to_owned()]
        );
    }

    #[test]
    fn a_decode_failure_consumes_no_resources() {
        let f = fixture();
        assert!(f.pool.restore(std::io::empty()).is_err());
        f.port_pool.remove(61001).unwrap();
    }

    #[test]
    fn a_port_claim_failure_returns_the_network_and_claimed_ports() {
        let f = fixture();
        f.port_pool.remove(61002).unwrap(); // collide with the snapshot

        let err = f.pool.restore(encode(&snapshot()).as_slice()).unwrap_err();
        assert!(err.to_string().contains("61002"));

        // Both the subnet and the already claimed port are free again.
        let network = Network {
            ip: "10.3.4.5".parse().unwrap(),
            subnet: "10.3.4.0/29".parse().unwrap(),
        };
        f.subnet_pool.remove(network).unwrap();
        f.port_pool.remove(61001).unwrap();
    }

    #[test]
    fn a_rereserve_failure_returns_the_subnet() {
        let f = fixture();
        let mut bad = snapshot();
        bad.resources.bridge = String::new();

        let err = f.pool.restore(encode(&bad).as_slice()).unwrap_err();
        assert!(err.to_string().contains("bridge"));

        let network = Network {
            ip: "10.3.4.5".parse().unwrap(),
            subnet: "10.3.4.0/29".parse().unwrap(),
        };
        f.subnet_pool.remove(network).unwrap();
    }
}

#[test]
fn max_containers_reports_the_subnet_pool_capacity() {
    let f = fixture();
    assert_eq!(f.pool.max_containers(), 4);
}

#[test]
fn acquire_then_release_returns_all_counters_to_baseline() {
    let f = fixture();

    let records: Vec<ContainerRecord> = (0..f.pool.max_containers())
        .map(|_| f.pool.acquire(ContainerSpec::default()).unwrap())
        .collect();
    assert!(f.pool.acquire(ContainerSpec::default()).is_err());

    for record in &records {
        f.pool.release(record).unwrap();
    }

    assert!(f.pool.depot().list().unwrap().is_empty());
    for _ in 0..f.pool.max_containers() {
        f.pool.acquire(ContainerSpec::default()).unwrap();
    }
}
