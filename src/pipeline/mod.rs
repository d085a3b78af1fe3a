//! The provisioning state machine.
//!
//! [`ProvisioningPipeline::run`] walks [`PipelineStage::ALL`] from a starting
//! stage, checking for cancellation at every boundary and logging entry and
//! exit of each stage. The first fatal failure stops the run and is returned
//! as a [`ProvisionError`]; completed stages are not rolled back. Each
//! completed stage is reported to a [`StageObserver`] so callers can persist
//! progress and later resume at [`PipelineStage::resume_point`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::disks::{DiskProbeError, DiskProber, DrivePair};
use crate::payload::{
    Architecture, ClusterJoin, FirstBootScript, GatewayWait, ImagingDirective, PayloadError,
    PostInstallScript, VlanSettings,
};
use crate::robot::{RescueRequest, ResetKind, RobotApi};
use crate::session::{CommandRunner, Credentials, RemoteSession, SessionConfig, SessionError};
use crate::waiter::{ReachabilityWaiter, WaitError};

mod config;
mod error;
mod stage;

pub use config::PipelineConfig;
pub use error::{ProvisionError, ProvisionErrorKind};
pub use stage::PipelineStage;

/// Remote path of the autosetup directive.
pub const AUTOSETUP_PATH: &str = "/root/setup.conf";
/// Remote path of the post-install script.
pub const POST_INSTALL_PATH: &str = "/root/post-install.sh";
/// Remote path of the first-boot script.
pub const INITIALIZE_PATH: &str = "/root/initialize.sh";
/// Imaging tool invocation on the rescue system.
pub const INSTALLIMAGE_COMMAND: &str =
    "/root/.oldroot/nfs/install/installimage -a -c /root/setup.conf -x /root/post-install.sh";
/// Reboot out of rescue; the connection usually drops before it returns.
pub const REBOOT_COMMAND: &str = "reboot || systemctl reboot || shutdown -r now || true";
/// Detached reboot issued after the first-boot script.
pub const DETACHED_REBOOT_COMMAND: &str = "nohup reboot > /dev/null 2>&1 &";

const CHMOD_POST_INSTALL: &str = "chmod +x /root/post-install.sh || true";
const RUN_INITIALIZE: &str = "chmod +x /root/initialize.sh && /root/initialize.sh";

/// Everything the pipeline needs to image one server.
#[derive(Clone)]
pub struct ProvisionRequest<'a> {
    /// Provider server number.
    pub server_number: u32,
    /// Public address of the server.
    pub server_ip: IpAddr,
    /// Hostname written into the image.
    pub hostname: &'a str,
    /// Image architecture.
    pub architecture: Architecture,
    /// LUKS passphrase.
    pub passphrase: &'a str,
    /// Software RAID level.
    pub raid_level: u8,
    /// Skip the EFI partition.
    pub no_uefi: bool,
    /// Key fingerprints armed in the rescue system.
    pub authorized_key_fingerprints: &'a [String],
    /// Allocated private address.
    pub local_ip: Ipv4Addr,
    /// Operator script appended to the first-boot script.
    pub extra_script: Option<&'a str>,
    /// Cluster join parameters, when the node should join a cluster.
    pub cluster: Option<ClusterJoin<'a>>,
}

/// Receives stage completion events.
pub trait StageObserver {
    /// Called after `stage` finished successfully.
    fn stage_completed(&self, stage: PipelineStage);
}

/// Observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn stage_completed(&self, _stage: PipelineStage) {}
}

/// Runs the provisioning stages against one server.
pub struct ProvisioningPipeline<'a, A: RobotApi + ?Sized, R: CommandRunner + Clone> {
    api: &'a A,
    runner: R,
    session_config: SessionConfig,
    credentials: Credentials,
    settings: PipelineConfig,
    vlan: VlanSettings,
    cancel: CancellationToken,
    observer: &'a dyn StageObserver,
}

/// Per-run state threaded between stages.
struct RunState<R: CommandRunner> {
    session: Option<RemoteSession<R>>,
    drives: Option<DrivePair>,
}

impl<'a, A, R> ProvisioningPipeline<'a, A, R>
where
    A: RobotApi + ?Sized,
    R: CommandRunner + Clone,
{
    /// Creates a pipeline using credentials derived from `session_config`.
    #[must_use]
    pub fn new(
        api: &'a A,
        runner: R,
        session_config: SessionConfig,
        settings: PipelineConfig,
    ) -> Self {
        let credentials = Credentials::from_config(&session_config);
        Self {
            api,
            runner,
            session_config,
            credentials,
            settings,
            vlan: VlanSettings::default(),
            cancel: CancellationToken::new(),
            observer: &NoopObserver,
        }
    }

    /// Stops the run at the next stage boundary or during a wait when
    /// `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reports stage completion to `observer`.
    #[must_use]
    pub const fn with_observer(mut self, observer: &'a dyn StageObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Overrides the credentials used for every session.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Overrides the private VLAN layout.
    #[must_use]
    pub const fn with_vlan(mut self, vlan: VlanSettings) -> Self {
        self.vlan = vlan;
        self
    }

    /// Runs every stage from `start` onwards.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`ProvisionError`]. Requests without key
    /// fingerprints or with invalid payload parameters are rejected before
    /// any remote call.
    pub async fn run(
        &self,
        request: &ProvisionRequest<'_>,
        start: PipelineStage,
    ) -> Result<(), ProvisionError> {
        self.preflight(request, start)?;
        let mut state = RunState {
            session: None,
            drives: None,
        };

        info!(
            server_number = request.server_number,
            server_ip = %request.server_ip,
            local_ip = %request.local_ip,
            start = %start,
            "provisioning started"
        );

        for stage in PipelineStage::ALL
            .into_iter()
            .filter(|stage| *stage >= start)
        {
            if self.cancel.is_cancelled() {
                warn!(server_number = request.server_number, stage = %stage, "provisioning cancelled");
                return Err(ProvisionError::cancelled(stage));
            }

            let started = Instant::now();
            info!(server_number = request.server_number, stage = %stage, "stage started");
            if let Err(err) = self.run_stage(stage, request, &mut state).await {
                warn!(
                    server_number = request.server_number,
                    stage = %stage,
                    kind = %err.kind,
                    summary = err.summary,
                    "stage failed"
                );
                return Err(err);
            }
            info!(
                server_number = request.server_number,
                stage = %stage,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "stage completed"
            );
            self.observer.stage_completed(stage);
        }

        info!(server_number = request.server_number, "provisioning finished");
        Ok(())
    }

    fn preflight(
        &self,
        request: &ProvisionRequest<'_>,
        start: PipelineStage,
    ) -> Result<(), ProvisionError> {
        if request
            .authorized_key_fingerprints
            .iter()
            .all(|fingerprint| fingerprint.trim().is_empty())
        {
            return Err(ProvisionError::new(
                start,
                ProvisionErrorKind::Configuration,
                "no ssh keys",
                "at least one rescue authorized key fingerprint is required for SSH access",
            ));
        }

        let payload_error = |err: PayloadError| {
            ProvisionError::new(
                start,
                ProvisionErrorKind::Configuration,
                "invalid payload",
                err.to_string(),
            )
        };
        ImagingDirective::validate_parameters(
            request.hostname,
            request.passphrase,
            request.raid_level,
        )
        .map_err(payload_error)?;
        self.first_boot_script(request)
            .render()
            .map_err(payload_error)?;
        if let Some(ref cluster) = request.cluster {
            cluster.validate().map_err(payload_error)?;
        }
        self.gateway_wait().map_err(|detail| {
            ProvisionError::new(start, ProvisionErrorKind::Configuration, "invalid payload", detail)
        })?;
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: PipelineStage,
        request: &ProvisionRequest<'_>,
        state: &mut RunState<R>,
    ) -> Result<(), ProvisionError> {
        match stage {
            PipelineStage::RescueActivate => {
                let rescue = RescueRequest::linux(request.authorized_key_fingerprints.to_vec());
                self.api
                    .activate_rescue(request.server_number, &rescue)
                    .await
                    .map_err(|err| provider(stage, "activate rescue failed", &err))?;
                Ok(())
            }
            PipelineStage::HardReset => {
                self.api
                    .reset(request.server_number, ResetKind::Hardware)
                    .await
                    .map_err(|err| provider(stage, "reset failed", &err))
            }
            PipelineStage::WaitRescueReachable => self
                .waiter()
                .wait_until_reachable(self.ssh_endpoint(request), self.settings.wait_timeout())
                .await
                .map_err(|err| reachability(stage, "rescue ssh timeout", &err)),
            PipelineStage::SessionOpen => {
                state.session = Some(self.connect(stage, request, "ssh connect")?);
                Ok(())
            }
            PipelineStage::ProbeDisks => {
                let session = open_session(stage, state)?;
                let drives = DiskProber.probe(session).map_err(|err| disk_error(stage, &err))?;
                state.drives = Some(drives);
                Ok(())
            }
            PipelineStage::BuildAndUploadPayloads => self.upload_payloads(stage, request, state),
            PipelineStage::RunImaging => {
                let session = open_session(stage, state)?;
                session
                    .run(INSTALLIMAGE_COMMAND)
                    .map_err(|err| remote_command(stage, "installimage failed", &err))?;
                Ok(())
            }
            PipelineStage::Reboot => {
                let held = state
                    .session
                    .take()
                    .or_else(|| self.rescue_session(stage, request));
                if let Some(session) = held {
                    if let Err(err) = session.run(REBOOT_COMMAND) {
                        warn!(
                            server_number = request.server_number,
                            error = %err,
                            "failed to issue reboot command"
                        );
                    }
                    session.close();
                }
                self.settle(stage).await
            }
            PipelineStage::WaitOsReachable => self
                .waiter()
                .wait_with_extension(
                    self.ssh_endpoint(request),
                    self.settings.wait_timeout(),
                    self.settings.wait_extension(),
                )
                .await
                .map_err(|err| reachability(stage, "os ssh timeout", &err)),
            PipelineStage::FirstBootSession => self.first_boot(stage, request).await,
        }
    }

    fn upload_payloads(
        &self,
        stage: PipelineStage,
        request: &ProvisionRequest<'_>,
        state: &RunState<R>,
    ) -> Result<(), ProvisionError> {
        let session = open_session(stage, state)?;
        let Some(ref drives) = state.drives else {
            return Err(ProvisionError::new(
                stage,
                ProvisionErrorKind::Configuration,
                "disk detection failed",
                "drives were not probed before payload upload",
            ));
        };

        let directive = ImagingDirective {
            hostname: request.hostname,
            architecture: request.architecture,
            passphrase: request.passphrase,
            raid_level: request.raid_level,
            drives,
            no_uefi: request.no_uefi,
        }
        .render()
        .map_err(|err| invalid_payload(stage, &err))?;
        session
            .upload(AUTOSETUP_PATH, directive.as_bytes(), 0o600)
            .map_err(|err| transport(stage, "upload autosetup", &err))?;

        let post_install = PostInstallScript {
            passphrase: request.passphrase,
        }
        .render()
        .map_err(|err| invalid_payload(stage, &err))?;
        session
            .upload(POST_INSTALL_PATH, post_install.as_bytes(), 0o700)
            .map_err(|err| transport(stage, "upload post-install", &err))?;

        if let Err(err) = session.run(CHMOD_POST_INSTALL) {
            warn!(
                server_number = request.server_number,
                error = %err,
                "failed to set post-install script permissions"
            );
        }
        Ok(())
    }

    async fn first_boot(
        &self,
        stage: PipelineStage,
        request: &ProvisionRequest<'_>,
    ) -> Result<(), ProvisionError> {
        let script = self
            .first_boot_script(request)
            .render()
            .map_err(|err| invalid_payload(stage, &err))?;

        let session = self.connect(stage, request, "os ssh connect")?;
        session
            .upload(INITIALIZE_PATH, script.as_bytes(), 0o700)
            .map_err(|err| transport(stage, "upload initialize", &err))?;
        if let Err(err) = session.run(RUN_INITIALIZE) {
            warn!(
                server_number = request.server_number,
                error = %err,
                "first-boot script reported a failure"
            );
        }

        info!(server_number = request.server_number, "rebooting after first-boot script");
        if let Err(err) = session.run(DETACHED_REBOOT_COMMAND) {
            warn!(server_number = request.server_number, error = %err, "reboot command failed");
        }
        session.close();
        self.settle(stage).await?;

        self.waiter()
            .wait_until_reachable(self.ssh_endpoint(request), self.settings.first_boot_wait())
            .await
            .map_err(|err| reachability(stage, "reboot ssh timeout", &err))?;

        let Some(ref cluster) = request.cluster else {
            info!(server_number = request.server_number, "no cluster configured, skipping join");
            return Ok(());
        };

        let node_session = self.connect(stage, request, "os ssh connect")?;
        let gateway = self
            .gateway_wait()
            .map_err(|detail| {
                ProvisionError::new(stage, ProvisionErrorKind::Configuration, "invalid payload", detail)
            })?;
        info!(
            server_number = request.server_number,
            gateway = %gateway.gateway,
            "waiting for private gateway"
        );
        let ping = gateway
            .render()
            .map_err(|err| invalid_payload(stage, &err))?;
        node_session
            .run(&ping)
            .map_err(|err| remote_command(stage, "ping check failed", &err))?;

        let join = cluster
            .command()
            .map_err(|err| invalid_payload(stage, &err))?;
        info!(server_number = request.server_number, "joining cluster");
        node_session
            .run(&join)
            .map_err(|err| remote_command(stage, "k3s installation failed", &err))?;
        node_session.close();
        Ok(())
    }

    fn first_boot_script<'r>(&self, request: &ProvisionRequest<'r>) -> FirstBootScript<'r> {
        FirstBootScript {
            local_ip: request.local_ip,
            vlan: self.vlan,
            extra_script: request.extra_script,
        }
    }

    fn gateway_wait(&self) -> Result<GatewayWait, String> {
        let gateway = self.settings.gateway().map_err(|err| err.to_string())?;
        Ok(GatewayWait {
            gateway,
            attempts: self.settings.gateway_attempts,
            ..GatewayWait::default()
        })
    }

    fn connect(
        &self,
        stage: PipelineStage,
        request: &ProvisionRequest<'_>,
        summary: &'static str,
    ) -> Result<RemoteSession<R>, ProvisionError> {
        RemoteSession::connect(
            self.session_config.clone(),
            self.runner.clone(),
            request.server_ip,
            self.credentials.clone(),
        )
        .map_err(|err| transport(stage, summary, &err))
    }

    /// Reconnects to a host left in rescue by an earlier run. A failure is
    /// only logged; the OS wait that follows decides whether the host
    /// came back.
    fn rescue_session(
        &self,
        stage: PipelineStage,
        request: &ProvisionRequest<'_>,
    ) -> Option<RemoteSession<R>> {
        match self.connect(stage, request, "ssh connect") {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(
                    server_number = request.server_number,
                    error = %err,
                    "no rescue session to issue the reboot from"
                );
                None
            }
        }
    }

    fn waiter(&self) -> ReachabilityWaiter {
        ReachabilityWaiter::new(
            self.settings.attempt_timeout(),
            self.settings.poll_interval(),
        )
        .with_cancellation(self.cancel.clone())
    }

    fn ssh_endpoint(&self, request: &ProvisionRequest<'_>) -> SocketAddr {
        SocketAddr::new(request.server_ip, self.session_config.port)
    }

    async fn settle(&self, stage: PipelineStage) -> Result<(), ProvisionError> {
        let delay: Duration = self.settings.reboot_settle();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = self.cancel.cancelled() => Err(ProvisionError::cancelled(stage)),
            () = sleep(delay) => Ok(()),
        }
    }
}

fn open_session<R: CommandRunner>(
    stage: PipelineStage,
    state: &RunState<R>,
) -> Result<&RemoteSession<R>, ProvisionError> {
    state.session.as_ref().ok_or_else(|| {
        ProvisionError::new(
            stage,
            ProvisionErrorKind::Transport,
            "ssh connect",
            "no rescue session is open; restart from rescue activation",
        )
    })
}

fn provider(
    stage: PipelineStage,
    summary: &'static str,
    err: &crate::robot::RobotError,
) -> ProvisionError {
    ProvisionError::new(stage, ProvisionErrorKind::Provider, summary, err.to_string())
}

fn reachability(stage: PipelineStage, summary: &'static str, err: &WaitError) -> ProvisionError {
    match err {
        WaitError::Cancelled { .. } => ProvisionError::cancelled(stage),
        WaitError::TimedOut { .. } => {
            ProvisionError::new(stage, ProvisionErrorKind::Reachability, summary, err.to_string())
        }
    }
}

fn transport(stage: PipelineStage, summary: &'static str, err: &SessionError) -> ProvisionError {
    ProvisionError::new(stage, ProvisionErrorKind::Transport, summary, err.to_string())
}

/// Remote command failures carry the command's own output verbatim.
fn remote_command(stage: PipelineStage, summary: &'static str, err: &SessionError) -> ProvisionError {
    let detail = match err {
        SessionError::Command {
            status_text,
            stdout,
            stderr,
            ..
        } => format!(
            "exit status {status_text}\nstdout:\n{}\nstderr:\n{}",
            stdout.trim_end(),
            stderr.trim_end()
        ),
        other => return transport(stage, summary, other),
    };
    ProvisionError::new(stage, ProvisionErrorKind::RemoteCommand, summary, detail)
}

fn disk_error(stage: PipelineStage, err: &DiskProbeError) -> ProvisionError {
    let kind = match err {
        DiskProbeError::Listing { .. } => ProvisionErrorKind::RemoteCommand,
        DiskProbeError::UnexpectedCount { .. } => ProvisionErrorKind::Configuration,
    };
    ProvisionError::new(stage, kind, err.summary(), err.to_string())
}

fn invalid_payload(stage: PipelineStage, err: &PayloadError) -> ProvisionError {
    ProvisionError::new(
        stage,
        ProvisionErrorKind::Configuration,
        "invalid payload",
        err.to_string(),
    )
}
