//! Lifecycle of a managed bare-metal server.
//!
//! [`ServerLifecycle`] turns a declared [`ManagedServer`] into persisted
//! [`ManagedServerState`]: it allocates the private address, names the
//! server, attaches it to its virtual switch and drives the provisioning
//! pipeline. Progress is checkpointed after every stage so an interrupted
//! run resumes on the next apply with the same address.

use std::cell::RefCell;
use std::net::Ipv4Addr;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::PrivateIpAllocator;
use crate::payload::{ClusterJoin, ImagingDirective};
use crate::pipeline::{
    PipelineConfig, PipelineStage, ProvisionRequest, ProvisioningPipeline, StageObserver,
};
use crate::robot::{RobotApi, ServerInventory};
use crate::session::{CommandRunner, SessionConfig};

mod error;
mod model;
mod names;
mod store;

pub use error::LifecycleError;
pub use model::{ManagedServer, ManagedServerState, Secret};
pub use names::{SUFFIX_LEN, ServerNames, random_suffix};
pub use store::{FileStateStore, StateStore, StateStoreError};

/// Longest base name that still yields a valid hostname once the suffix is
/// appended.
pub const MAX_BASE_NAME_LEN: usize = 63 - SUFFIX_LEN - 1;

/// Marks every address recorded in `store` as held.
///
/// # Errors
///
/// Returns [`StateStoreError`] when the store cannot be scanned.
pub fn seed_allocator<S: StateStore + ?Sized>(
    store: &S,
    allocator: &PrivateIpAllocator,
) -> Result<usize, StateStoreError> {
    let states = store.scan()?;
    let seeded = allocator.seed(states.iter().filter_map(|state| state.local_ip));
    info!(records = states.len(), seeded, "allocator seeded from state");
    Ok(seeded)
}

/// Shared collaborators of every lifecycle operation.
pub struct ServerLifecycle<'a, A, R, S>
where
    A: RobotApi + ?Sized,
    R: CommandRunner + Clone,
    S: StateStore + ?Sized,
{
    api: &'a A,
    runner: R,
    allocator: &'a PrivateIpAllocator,
    store: &'a S,
    inventory: &'a ServerInventory,
    session_config: SessionConfig,
    pipeline_config: PipelineConfig,
    cancel: CancellationToken,
}

impl<'a, A, R, S> ServerLifecycle<'a, A, R, S>
where
    A: RobotApi + ?Sized,
    R: CommandRunner + Clone,
    S: StateStore + ?Sized,
{
    /// Creates a lifecycle over the given collaborators.
    #[must_use]
    pub fn new(
        api: &'a A,
        runner: R,
        allocator: &'a PrivateIpAllocator,
        store: &'a S,
        inventory: &'a ServerInventory,
    ) -> Self {
        Self {
            api,
            runner,
            allocator,
            store,
            inventory,
            session_config: SessionConfig::default(),
            pipeline_config: PipelineConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the SSH settings.
    #[must_use]
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Overrides the pipeline settings.
    #[must_use]
    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }

    /// Stops running pipelines when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Creates the resource when no state exists, otherwise updates it.
    ///
    /// State is found by server number first, then by name, so a renamed
    /// declaration updates its record in place and a declaration that moved
    /// to another server is reported as a replacement.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying create or update.
    pub async fn apply(&self, declared: ManagedServer) -> Result<ManagedServerState, LifecycleError> {
        match self.managed(&declared)? {
            Some(prior) => self.update(&prior, declared).await,
            None => self.create(declared).await,
        }
    }

    /// Allocates an address, names the server and runs the full pipeline.
    ///
    /// Nothing is persisted until the rename and switch attach succeed, so a
    /// create that fails there is retried in full by the next apply. From
    /// then on state is saved after every stage and a failed pipeline
    /// resumes with the same address.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidDeclaration`] before any provider
    /// call, [`LifecycleError::AlreadyManaged`] when the server number or
    /// name already has state, [`LifecycleError::Allocation`] when the pool
    /// is exhausted, or the first Robot, pipeline or store failure.
    pub async fn create(&self, declared: ManagedServer) -> Result<ManagedServerState, LifecycleError> {
        let names = ServerNames::generate(&declared.name);
        validate_declaration(&declared, &names.server_name)?;
        if let Some(state) = self.managed(&declared)? {
            return Err(LifecycleError::AlreadyManaged {
                name: state.declared.name,
                server_number: state.declared.server_number,
            });
        }

        let local_ip = self.allocator.acquire()?;
        let state = ManagedServerState {
            id: None,
            declared,
            local_ip: Some(local_ip),
            server_name: names.server_name,
            robot_name: names.robot_name,
            last_completed_stage: None,
            provisioned: false,
        };
        info!(
            name = %state.declared.name,
            server_number = state.declared.server_number,
            local_ip = %local_ip,
            server_name = %state.server_name,
            "creating managed server"
        );

        let persisted = self
            .apply_side_effects(&state, None)
            .await
            .and_then(|()| self.store.save(&state).map_err(LifecycleError::from));
        if let Err(err) = persisted {
            self.allocator.release(local_ip);
            return Err(err);
        }
        self.provision(state, PipelineStage::RescueActivate).await
    }

    /// Reconciles `prior` with `declared`.
    ///
    /// Renames and switch membership are applied directly. The pipeline
    /// runs again only when `version` changed, or to finish a previous run
    /// that did not complete. The private address is always carried over.
    /// The stored record is left untouched until the direct changes
    /// succeed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RequiresReplacement`] when the server
    /// number or public address changed, [`LifecycleError::AlreadyManaged`]
    /// when the new name belongs to another server, or the first Robot,
    /// pipeline or store failure.
    pub async fn update(
        &self,
        prior: &ManagedServerState,
        declared: ManagedServer,
    ) -> Result<ManagedServerState, LifecycleError> {
        if declared.server_number != prior.declared.server_number {
            return Err(LifecycleError::RequiresReplacement {
                name: declared.name,
                field: "server_number",
            });
        }
        if declared.server_ip != prior.declared.server_ip {
            return Err(LifecycleError::RequiresReplacement {
                name: declared.name,
                field: "server_ip",
            });
        }

        let version_changed = declared.version != prior.declared.version;
        let renamed = declared.name != prior.declared.name;
        let names = if renamed || version_changed {
            ServerNames::generate(&declared.name)
        } else {
            ServerNames {
                server_name: prior.server_name.clone(),
                robot_name: prior.robot_name.clone(),
            }
        };
        validate_declaration(&declared, &names.server_name)?;
        if renamed {
            let taken = self
                .store
                .find_by_name(&declared.name)?
                .filter(|other| other.declared.server_number != declared.server_number);
            if let Some(other) = taken {
                return Err(LifecycleError::AlreadyManaged {
                    name: other.declared.name,
                    server_number: other.declared.server_number,
                });
            }
        }

        let mut state = ManagedServerState {
            id: prior.id.clone(),
            declared,
            local_ip: prior.local_ip,
            server_name: names.server_name,
            robot_name: names.robot_name,
            last_completed_stage: prior.last_completed_stage,
            provisioned: prior.provisioned,
        };
        self.apply_side_effects(&state, Some(prior)).await?;
        state.local_ip = Some(self.retain_address(prior.local_ip)?);

        let start = if version_changed {
            info!(
                name = %state.declared.name,
                from = prior.declared.version,
                to = state.declared.version,
                "version changed, re-provisioning"
            );
            Some(PipelineStage::RescueActivate)
        } else if prior.provisioned {
            None
        } else {
            Some(PipelineStage::resume_point(prior.last_completed_stage))
        };

        let Some(stage) = start else {
            self.store.save(&state)?;
            return Ok(state);
        };
        if stage == PipelineStage::RescueActivate {
            state.last_completed_stage = None;
        }
        state.provisioned = false;
        self.store.save(&state)?;
        self.provision(state, stage).await
    }

    /// Releases the address, asks the provider to cancel the server and
    /// removes the state. A failed cancellation is logged and ignored.
    /// Returns `false` when no server is managed under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] only when the state cannot be read
    /// or removed.
    pub async fn delete(&self, name: &str) -> Result<bool, LifecycleError> {
        let Some(state) = self.store.find_by_name(name)? else {
            return Ok(false);
        };
        let server_number = state.declared.server_number;

        if let Some(local_ip) = state.local_ip {
            self.allocator.release(local_ip);
        }
        if let Err(err) = self.api.cancel_server(server_number, None).await {
            warn!(
                name,
                server_number,
                error = %err,
                "server cancellation failed; removing state anyway"
            );
        }
        self.store.remove(server_number)?;
        info!(name, server_number, "managed server removed");
        Ok(true)
    }

    /// Refreshes the state from the provider's server listing. A server the
    /// provider no longer knows is dropped from state and its address
    /// released.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] for listing failures other than
    /// not-found, or [`LifecycleError::Store`].
    pub async fn read(&self, name: &str) -> Result<Option<ManagedServerState>, LifecycleError> {
        let Some(state) = self.store.find_by_name(name)? else {
            return Ok(None);
        };
        let server_number = state.declared.server_number;

        match self.inventory.server(self.api, server_number).await {
            Ok(server) => {
                if server.server_name != state.robot_name {
                    warn!(
                        name,
                        expected = %state.robot_name,
                        observed = %server.server_name,
                        "robot name drifted; next apply will not rename unless name or version changes"
                    );
                }
                Ok(Some(state))
            }
            Err(err) if err.is_not_found() => {
                warn!(name, server_number, "server gone, dropping state");
                if let Some(local_ip) = state.local_ip {
                    self.allocator.release(local_ip);
                }
                self.store.remove(server_number)?;
                Ok(None)
            }
            Err(err) => Err(LifecycleError::provider("server lookup", err)),
        }
    }

    fn managed(&self, declared: &ManagedServer) -> Result<Option<ManagedServerState>, LifecycleError> {
        let mut found = self.store.load(declared.server_number)?;
        if found.is_none() {
            found = self.store.find_by_name(&declared.name)?;
        }
        Ok(found)
    }

    async fn apply_side_effects(
        &self,
        state: &ManagedServerState,
        prior: Option<&ManagedServerState>,
    ) -> Result<(), LifecycleError> {
        let server_number = state.declared.server_number;
        if prior.is_none_or(|previous| previous.robot_name != state.robot_name) {
            self.api
                .set_server_name(server_number, &state.robot_name)
                .await
                .map_err(|err| LifecycleError::provider("set server name", err))?;
        }

        let switch_changed =
            prior.is_none_or(|previous| previous.declared.vswitch_id != state.declared.vswitch_id);
        if let Some(vswitch_id) = state.declared.vswitch_id.filter(|_| switch_changed) {
            self.api
                .add_server_to_vswitch(vswitch_id, state.declared.server_ip)
                .await
                .map_err(|err| LifecycleError::provider("vswitch attach", err))?;
            info!(server_number, vswitch_id, "server attached to vswitch");
        }
        Ok(())
    }

    fn retain_address(&self, prior: Option<Ipv4Addr>) -> Result<Ipv4Addr, LifecycleError> {
        let Some(local_ip) = prior else {
            return Ok(self.allocator.acquire()?);
        };
        self.allocator.reserve(local_ip);
        Ok(local_ip)
    }

    async fn provision(
        &self,
        initial: ManagedServerState,
        start: PipelineStage,
    ) -> Result<ManagedServerState, LifecycleError> {
        let snapshot = initial.clone();
        let fingerprints: Vec<String> = snapshot
            .declared
            .rescue_authorized_key_fingerprints
            .iter()
            .cloned()
            .collect();
        let request = provision_request(&snapshot, &fingerprints)?;
        let checkpoint = Checkpoint {
            store: self.store,
            state: RefCell::new(initial),
        };
        let outcome = ProvisioningPipeline::new(
            self.api,
            self.runner.clone(),
            self.session_config.clone(),
            self.pipeline_config.clone(),
        )
        .with_cancellation(self.cancel.clone())
        .with_observer(&checkpoint)
        .run(&request, start)
        .await;

        let mut state = checkpoint.state.into_inner();
        outcome?;

        state.provisioned = true;
        if state.id.is_none() {
            state.id = Some(format!("configuration-{}", Utc::now().timestamp()));
        }
        self.store.save(&state)?;
        info!(
            name = %state.declared.name,
            id = state.id.as_deref().unwrap_or_default(),
            "managed server provisioned"
        );
        Ok(state)
    }
}

/// Persists pipeline progress after each stage.
struct Checkpoint<'s, S: StateStore + ?Sized> {
    store: &'s S,
    state: RefCell<ManagedServerState>,
}

impl<S: StateStore + ?Sized> StageObserver for Checkpoint<'_, S> {
    fn stage_completed(&self, stage: PipelineStage) {
        let mut state = self.state.borrow_mut();
        state.last_completed_stage = Some(stage);
        if let Err(err) = self.store.save(&state) {
            warn!(name = %state.declared.name, stage = %stage, error = %err, "failed to checkpoint stage");
        }
    }
}

fn provision_request<'s>(
    state: &'s ManagedServerState,
    fingerprints: &'s [String],
) -> Result<ProvisionRequest<'s>, LifecycleError> {
    let declared = &state.declared;
    let Some(local_ip) = state.local_ip else {
        return Err(LifecycleError::InvalidDeclaration {
            field: "local_ip",
            message: String::from("no private address allocated"),
        });
    };
    let cluster = cluster_join(declared)?;
    Ok(ProvisionRequest {
        server_number: declared.server_number,
        server_ip: declared.server_ip,
        hostname: &state.server_name,
        architecture: declared.arch,
        passphrase: declared.encryption_passphrase.expose(),
        raid_level: declared.raid_level,
        no_uefi: declared.no_uefi,
        authorized_key_fingerprints: fingerprints,
        local_ip,
        extra_script: declared.extra_script.as_deref(),
        cluster,
    })
}

/// Rejects a declaration the pipeline would refuse, before anything is
/// allocated or any provider call is made.
fn validate_declaration(declared: &ManagedServer, hostname: &str) -> Result<(), LifecycleError> {
    let name = declared.name.as_str();
    let valid_chars = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
    if name.is_empty()
        || name.len() > MAX_BASE_NAME_LEN
        || !valid_chars
        || name.starts_with('-')
    {
        return Err(LifecycleError::InvalidDeclaration {
            field: "name",
            message: format!(
                "{name:?} must be 1 to {MAX_BASE_NAME_LEN} letters, digits or hyphens"
            ),
        });
    }

    if declared
        .rescue_authorized_key_fingerprints
        .iter()
        .all(|fingerprint| fingerprint.trim().is_empty())
    {
        return Err(LifecycleError::InvalidDeclaration {
            field: "rescue_authorized_key_fingerprints",
            message: String::from("no ssh keys; at least one fingerprint is required"),
        });
    }

    ImagingDirective::validate_parameters(
        hostname,
        declared.encryption_passphrase.expose(),
        declared.raid_level,
    )?;
    if let Some(cluster) = cluster_join(declared)? {
        cluster.validate()?;
    }
    Ok(())
}

fn cluster_join(declared: &ManagedServer) -> Result<Option<ClusterJoin<'_>>, LifecycleError> {
    match (declared.cluster_url.as_deref(), declared.cluster_token.as_ref()) {
        (Some(url), Some(token)) => Ok(Some(ClusterJoin {
            url,
            token: token.expose(),
            labels: &declared.node_labels,
            taints: &declared.taints,
        })),
        (None, None) => Ok(None),
        _ => Err(LifecycleError::InvalidDeclaration {
            field: "cluster_url",
            message: String::from("cluster_url and cluster_token must be set together"),
        }),
    }
}

#[cfg(test)]
mod tests;
