//! Command dispatcher.
//!
//! Runs one decoded command against the hypervisor and keeps the state store
//! in step. Handlers are idempotent: creating an existing instance records it
//! instead of launching, and acting on a missing one reports `not_found`.

use chrono::{SecondsFormat, Utc};
use connector_protocol::{
    Command, CommandEnvelope, CreateSpec, ObservedState, PayloadError, ResizeSpec, Target,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::cloud_init::{CloudInitError, CloudInitPackager};
use crate::hypervisor::{HypervisorError, InstanceInfo, LaunchRequest, Multipass};
use crate::state::{InstanceState, StateStore, StateStoreError};

/// Prefix of instance names derived from a host id.
pub const INSTANCE_PREFIX: &str = "cocalc-";

/// In-guest helper that grows the data filesystem to the given GiB.
const GROW_COMMAND: &str = "/usr/local/sbin/cocalc-grow-btrfs";

/// Errors that fail a command. Reported back as the acknowledgment's error.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown action {0}")]
    UnsupportedAction(String),

    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    CloudInit(#[from] CloudInitError),
}

/// Derived instance name for a host.
pub fn instance_name(host_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{host_id}")
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn observed(name: &str, info: &InstanceInfo) -> ObservedState {
    ObservedState::new(name, info.state.clone(), info.ipv4.clone())
}

/// Routes commands to their handlers.
pub struct Dispatcher {
    multipass: Multipass,
    store: StateStore,
    packager: CloudInitPackager,
}

impl Dispatcher {
    pub fn new(multipass: Multipass, store: StateStore, packager: CloudInitPackager) -> Self {
        Self {
            multipass,
            store,
            packager,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Decode and run an envelope.
    pub async fn execute(
        &mut self,
        envelope: &CommandEnvelope,
    ) -> Result<ObservedState, CommandError> {
        let command = Command::decode(envelope)?;
        self.dispatch(command).await
    }

    pub async fn dispatch(&mut self, command: Command) -> Result<ObservedState, CommandError> {
        match command {
            Command::Create(spec) => self.create(spec).await,
            Command::Start(target) => self.start(target).await,
            Command::Stop(target) => self.stop(target).await,
            Command::Delete(target) => self.delete(target).await,
            Command::Status(target) => self.status(target).await,
            Command::Resize(spec) => self.resize(spec).await,
            Command::Unsupported { action } => Err(CommandError::UnsupportedAction(action)),
        }
    }

    /// Explicit name, then the recorded name, then the derived one.
    fn resolve_name(&self, target: &Target) -> String {
        if let Some(name) = &target.name {
            return name.clone();
        }
        let host_id = target.host_id.as_deref().unwrap_or_default();
        self.store
            .get(host_id)
            .map(|entry| entry.name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| instance_name(host_id))
    }

    fn refresh(
        &mut self,
        target: &Target,
        name: &str,
        info: &InstanceInfo,
    ) -> Result<(), CommandError> {
        if let Some(host_id) = &target.host_id {
            self.store.refresh(host_id, name, &info.state, &info.ipv4)?;
        }
        Ok(())
    }

    async fn create(&mut self, spec: CreateSpec) -> Result<ObservedState, CommandError> {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| instance_name(&spec.host_id));

        let current = self.multipass.info(&name).await?;
        if current.exists {
            info!(
                host_id = %spec.host_id,
                instance = %name,
                "Instance already exists, skipping launch"
            );
            let existing = self.store.get(&spec.host_id).cloned().unwrap_or_default();
            let image = if existing.image.is_empty() {
                spec.image.clone()
            } else {
                existing.image
            };
            self.store.set(
                &spec.host_id,
                InstanceState {
                    name: name.clone(),
                    image,
                    created_at: existing.created_at,
                    last_state: current.state.clone(),
                    last_ipv4: current.ipv4.clone(),
                },
            )?;
            return Ok(observed(&name, &current));
        }

        let cloud_init = match &spec.cloud_init {
            Some(content) => Some(self.packager.write(&spec.host_id, content)?),
            None => None,
        };

        let request = LaunchRequest {
            name: name.clone(),
            image: spec.image.clone(),
            cpus: spec.resources.cpus,
            memory: spec.resources.memory,
            disk: spec.resources.disk,
            cloud_init: cloud_init.as_ref().map(|file| file.path().to_path_buf()),
        };

        if let Err(e) = self.multipass.launch(&request).await {
            if let Some(file) = &cloud_init {
                warn!(path = %file.path().display(), "Launch failed, keeping cloud-init file");
            }
            return Err(e.into());
        }
        if let Some(file) = cloud_init {
            self.packager.cleanup(file);
        }

        let launched = self.multipass.info(&name).await?;
        self.store.set(
            &spec.host_id,
            InstanceState {
                name: name.clone(),
                image: spec.image,
                created_at: now_rfc3339(),
                last_state: launched.state.clone(),
                last_ipv4: launched.ipv4.clone(),
            },
        )?;
        info!(
            host_id = %spec.host_id,
            instance = %name,
            state = %launched.state,
            "Instance launched"
        );

        Ok(observed(&name, &launched))
    }

    async fn start(&mut self, target: Target) -> Result<ObservedState, CommandError> {
        let name = self.resolve_name(&target);
        if !self.multipass.info(&name).await?.exists {
            return Ok(ObservedState::not_found(name));
        }

        self.multipass.start(&name).await?;
        let after = self.multipass.info(&name).await?;
        self.refresh(&target, &name, &after)?;
        Ok(observed(&name, &after))
    }

    async fn stop(&mut self, target: Target) -> Result<ObservedState, CommandError> {
        let name = self.resolve_name(&target);
        if !self.multipass.info(&name).await?.exists {
            return Ok(ObservedState::not_found(name));
        }

        self.multipass.stop(&name).await?;
        let after = self.multipass.info(&name).await?;
        self.refresh(&target, &name, &after)?;
        Ok(observed(&name, &after))
    }

    async fn delete(&mut self, target: Target) -> Result<ObservedState, CommandError> {
        let name = self.resolve_name(&target);

        if let Err(e) = self.multipass.delete(&name).await {
            warn!(instance = %name, error = %e, "Delete failed, continuing");
        }
        if let Err(e) = self.multipass.purge().await {
            warn!(error = %e, "Purge failed, continuing");
        }
        if let Some(host_id) = &target.host_id {
            self.store.remove(host_id)?;
        }

        Ok(ObservedState::deleted(name))
    }

    async fn status(&mut self, target: Target) -> Result<ObservedState, CommandError> {
        let name = self.resolve_name(&target);
        let current = self.multipass.info(&name).await?;
        if !current.exists {
            return Ok(ObservedState::not_found(name));
        }

        self.refresh(&target, &name, &current)?;
        Ok(observed(&name, &current))
    }

    /// Apply new resources. The instance must be stopped for `set`, so a
    /// running instance is stopped first and started again afterwards.
    /// A disk change also needs the guest up to grow its filesystem.
    async fn resize(&mut self, spec: ResizeSpec) -> Result<ObservedState, CommandError> {
        let ResizeSpec { target, resources } = spec;
        let name = self.resolve_name(&target);

        let current = self.multipass.info(&name).await?;
        if !current.exists {
            return Ok(ObservedState::not_found(name));
        }
        if resources.is_empty() {
            return Ok(observed(&name, &current));
        }

        let was_running = current.is_running();
        if was_running {
            self.multipass.stop(&name).await?;
        }

        if let Some(cpus) = resources.cpus {
            self.multipass.set(&name, "cpus", &cpus.to_string()).await?;
        }
        if let Some(memory) = resources.memory {
            self.multipass.set(&name, "memory", &memory.to_string()).await?;
        }
        if let Some(disk) = resources.disk {
            self.multipass.set(&name, "disk", &disk.to_string()).await?;
        }

        let started = was_running || resources.disk.is_some();
        if started {
            self.multipass.start(&name).await?;
        }
        if let Some(disk) = resources.disk {
            let gib = disk.whole_gib().max(1).to_string();
            self.multipass
                .exec_in_guest(&name, &["sudo", GROW_COMMAND, gib.as_str()])
                .await?;
        }
        if started && !was_running {
            self.multipass.stop(&name).await?;
        }

        let after = self.multipass.info(&name).await?;
        self.refresh(&target, &name, &after)?;
        info!(
            instance = %name,
            cpus = ?resources.cpus,
            memory = ?resources.memory.map(|m| m.to_string()),
            disk = ?resources.disk.map(|d| d.to_string()),
            state = %after.state,
            "Instance resized"
        );
        Ok(observed(&name, &after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("h1"), "cocalc-h1");
    }

    #[test]
    fn test_timestamp_is_seconds_utc() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-05T10:00:00Z".len());
    }
}
