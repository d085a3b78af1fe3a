//! Virtual switch resource.

use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::{info, warn};

use crate::robot::{RobotApi, RobotError, VSwitch};

/// VLAN tags the provider accepts for virtual switches.
pub const VLAN_RANGE: RangeInclusive<u16> = 4000..=4091;

/// Errors raised by [`VSwitchLifecycle`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VSwitchError {
    /// The VLAN tag is outside [`VLAN_RANGE`].
    #[error("vlan {vlan} is outside 4000-4091")]
    InvalidVlan {
        /// Rejected tag.
        vlan: u16,
    },
    /// The name is empty.
    #[error("vswitch name must not be empty")]
    EmptyName,
    /// The provider call failed.
    #[error(transparent)]
    Robot(#[from] RobotError),
}

/// Desired switch configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VSwitchSpec {
    /// VLAN tag.
    pub vlan: u16,
    /// Display name.
    pub name: String,
}

impl VSwitchSpec {
    fn validate(&self) -> Result<(), VSwitchError> {
        if !VLAN_RANGE.contains(&self.vlan) {
            return Err(VSwitchError::InvalidVlan { vlan: self.vlan });
        }
        if self.name.trim().is_empty() {
            return Err(VSwitchError::EmptyName);
        }
        Ok(())
    }
}

/// Create/read/update/delete for virtual switches.
pub struct VSwitchLifecycle<'a, A: RobotApi + ?Sized> {
    api: &'a A,
}

impl<'a, A: RobotApi + ?Sized> VSwitchLifecycle<'a, A> {
    /// Wraps `api`.
    #[must_use]
    pub const fn new(api: &'a A) -> Self {
        Self { api }
    }

    /// Creates a switch.
    ///
    /// # Errors
    ///
    /// Returns [`VSwitchError::InvalidVlan`] or [`VSwitchError::EmptyName`]
    /// before calling the provider, or [`VSwitchError::Robot`].
    pub async fn create(&self, spec: &VSwitchSpec) -> Result<VSwitch, VSwitchError> {
        spec.validate()?;
        let created = self.api.create_vswitch(spec.vlan, &spec.name).await?;
        info!(vswitch_id = created.id, vlan = created.vlan, name = %created.name, "vswitch created");
        Ok(created)
    }

    /// Reads a switch; `None` when the provider no longer knows it.
    ///
    /// # Errors
    ///
    /// Returns [`VSwitchError::Robot`] for failures other than not-found.
    pub async fn read(&self, id: u32) -> Result<Option<VSwitch>, VSwitchError> {
        match self.api.get_vswitch(id).await {
            Ok(vswitch) => Ok(Some(vswitch)),
            Err(err) if err.is_not_found() => {
                warn!(vswitch_id = id, "vswitch gone");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Changes the VLAN tag and name.
    ///
    /// # Errors
    ///
    /// Returns a validation error or [`VSwitchError::Robot`].
    pub async fn update(&self, id: u32, spec: &VSwitchSpec) -> Result<VSwitch, VSwitchError> {
        spec.validate()?;
        let updated = self.api.update_vswitch(id, spec.vlan, &spec.name).await?;
        info!(vswitch_id = id, vlan = updated.vlan, name = %updated.name, "vswitch updated");
        Ok(updated)
    }

    /// Cancels the switch immediately. A switch that is already gone counts
    /// as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`VSwitchError::Robot`] for failures other than not-found.
    pub async fn delete(&self, id: u32) -> Result<(), VSwitchError> {
        match self.api.delete_vswitch(id).await {
            Ok(()) => {
                info!(vswitch_id = id, "vswitch deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every switch on the account.
    ///
    /// # Errors
    ///
    /// Returns [`VSwitchError::Robot`] when the listing fails.
    pub async fn list(&self) -> Result<Vec<VSwitch>, VSwitchError> {
        Ok(self.api.list_vswitches().await?)
    }
}
