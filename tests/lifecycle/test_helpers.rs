//! Shared fixtures for managed server lifecycle scenarios.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use hrobot::PrivateIpAllocator;
use hrobot::payload::Architecture;
use hrobot::pipeline::{PipelineConfig, PipelineStage};
use hrobot::resource::{ManagedServer, ManagedServerState, Secret, ServerLifecycle};
use hrobot::robot::ServerInventory;
use hrobot::session::SessionConfig;
use hrobot::test_support::{FakeRobot, MemoryStateStore, ScriptedRunner};
use rstest::fixture;

pub const CONFIGURATION_ID: &str = "configuration-1700000000";
pub const SERVER_NUMBER: u32 = 2_468_013;

pub struct LifecycleContext {
    pub listener: TcpListener,
    pub api: FakeRobot,
    pub runner: ScriptedRunner,
    pub allocator: PrivateIpAllocator,
    pub store: MemoryStateStore,
    pub inventory: ServerInventory,
    pub result: RefCell<Option<Result<ManagedServerState, String>>>,
}

impl LifecycleContext {
    pub fn lifecycle(
        &self,
    ) -> ServerLifecycle<'_, FakeRobot, ScriptedRunner, MemoryStateStore> {
        let port = self
            .listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener address: {err}"))
            .port();
        ServerLifecycle::new(
            &self.api,
            self.runner.clone(),
            &self.allocator,
            &self.store,
            &self.inventory,
        )
        .with_session_config(SessionConfig {
            port,
            ..SessionConfig::default()
        })
        .with_pipeline_config(PipelineConfig {
            wait_timeout_secs: 2,
            wait_extension_secs: 1,
            first_boot_wait_secs: 2,
            reboot_settle_secs: 0,
            poll_interval_secs: 1,
            attempt_timeout_secs: 1,
            ..PipelineConfig::default()
        })
    }

    /// Queues the host responses of one complete imaging run.
    pub fn script_imaging(&self) {
        self.runner.push_success();
        self.runner
            .push_output(Some(0), "nvme0n1 953.9G disk\nnvme1n1 953.9G disk\n", "");
        self.runner.push_successes(9);
    }
}

pub fn declaration(name: &str) -> ManagedServer {
    ManagedServer {
        name: name.to_owned(),
        server_number: SERVER_NUMBER,
        server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        description: String::from("database primary"),
        vswitch_id: None,
        version: 1,
        arch: Architecture::Amd64,
        encryption_passphrase: Secret::new("luks passphrase"),
        raid_level: 1,
        no_uefi: false,
        rescue_authorized_key_fingerprints: BTreeSet::from([String::from("de:ad:be:ef")]),
        node_labels: Vec::new(),
        taints: Vec::new(),
        cluster_url: None,
        cluster_token: None,
        extra_script: None,
    }
}

pub fn provisioned_state(name: &str, local_ip: Ipv4Addr) -> ManagedServerState {
    ManagedServerState {
        id: Some(String::from(CONFIGURATION_ID)),
        declared: declaration(name),
        local_ip: Some(local_ip),
        server_name: format!("{name}-a1b2c3"),
        robot_name: format!("{name}-a1b2c3"),
        last_completed_stage: Some(PipelineStage::FirstBootSession),
        provisioned: true,
    }
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        listener: TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap_or_else(|err| panic!("bind listener: {err}")),
        api: FakeRobot::new(),
        runner: ScriptedRunner::new(),
        allocator: PrivateIpAllocator::new(),
        store: MemoryStateStore::new(),
        inventory: ServerInventory::new(),
        result: RefCell::new(None),
    }
}
