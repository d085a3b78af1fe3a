//! Shared fixtures for provisioning pipeline scenarios.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use hrobot::pipeline::{
    PipelineConfig, PipelineStage, ProvisionError, ProvisionRequest, StageObserver,
};
use hrobot::session::SessionConfig;
use hrobot::test_support::{FakeRobot, ScriptedRunner};
use rstest::fixture;
use tokio_util::sync::CancellationToken;

pub const SERVER_NUMBER: u32 = 321;

/// Outcome of the most recent pipeline run.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed,
    Failed(ProvisionError),
}

/// Records completed stages.
#[derive(Debug, Default)]
pub struct StageLog {
    pub stages: RefCell<Vec<PipelineStage>>,
}

impl StageObserver for StageLog {
    fn stage_completed(&self, stage: PipelineStage) {
        self.stages.borrow_mut().push(stage);
    }
}

pub struct PipelineContext {
    pub listener: TcpListener,
    pub api: FakeRobot,
    pub runner: ScriptedRunner,
    pub cancel: CancellationToken,
    pub fingerprints: Vec<String>,
    pub stages: StageLog,
    pub outcome: RefCell<Option<RunOutcome>>,
}

impl PipelineContext {
    pub fn session_config(&self) -> SessionConfig {
        let port = self
            .listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener address: {err}"))
            .port();
        SessionConfig {
            port,
            ..SessionConfig::default()
        }
    }

    pub fn request(&self) -> ProvisionRequest<'_> {
        ProvisionRequest {
            server_number: SERVER_NUMBER,
            server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hostname: "db-9f8e7d",
            architecture: hrobot::payload::Architecture::Amd64,
            passphrase: "correct horse battery",
            raid_level: 1,
            no_uefi: false,
            authorized_key_fingerprints: &self.fingerprints,
            local_ip: Ipv4Addr::new(10, 1, 0, 9),
            extra_script: None,
            cluster: None,
        }
    }
}

pub fn fast_settings() -> PipelineConfig {
    PipelineConfig {
        wait_timeout_secs: 2,
        wait_extension_secs: 1,
        first_boot_wait_secs: 2,
        reboot_settle_secs: 0,
        poll_interval_secs: 1,
        attempt_timeout_secs: 1,
        ..PipelineConfig::default()
    }
}

/// Renders an `lsblk` listing with `count` whole disks.
pub fn disk_listing(count: usize) -> String {
    ["sda", "sdb", "sdc", "sdd"]
        .iter()
        .take(count)
        .map(|name| format!("{name} 1.8T disk\n"))
        .collect()
}

#[fixture]
pub fn pipeline_context() -> PipelineContext {
    PipelineContext {
        listener: TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap_or_else(|err| panic!("bind listener: {err}")),
        api: FakeRobot::new(),
        runner: ScriptedRunner::new(),
        cancel: CancellationToken::new(),
        fingerprints: vec![String::from("11:22:33:44")],
        stages: StageLog::default(),
        outcome: RefCell::new(None),
    }
}
