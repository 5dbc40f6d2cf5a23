// ABOUTME: Group dispatcher: global container ceiling, one run at a time per group, follow-up routing.
// ABOUTME: Follow-ups for a group with a live container go into its mailbox instead of a new run.

use crate::config::{validate_group_folder, Config};
use crate::container::{ContainerSpec, Launcher, RuntimeLauncher};
use crate::host::{HostLimits, HostRun, RunOutcome, SessionHost};
use crate::metrics;
use crate::session::SessionStore;
use anyhow::{Context, Result};
use corral_agent::{ContainerInput, ContainerOutput, Mailbox};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Default)]
struct GroupSlot {
    /// Held for the whole container run
    run_lock: tokio::sync::Mutex<()>,
    /// ipc directory of the live container, if any
    active_ipc: Mutex<Option<PathBuf>>,
}

impl GroupSlot {
    fn active_ipc(&self) -> Option<PathBuf> {
        self.active_ipc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_active_ipc(&self, dir: Option<PathBuf>) {
        *self.active_ipc.lock().unwrap_or_else(|e| e.into_inner()) = dir;
    }
}

/// Clears a group's live marker when its run ends or is dropped
struct ActiveRun<'a> {
    slot: &'a GroupSlot,
    running: &'a AtomicU64,
}

impl<'a> ActiveRun<'a> {
    fn start(slot: &'a GroupSlot, running: &'a AtomicU64, ipc_dir: PathBuf) -> Self {
        slot.set_active_ipc(Some(ipc_dir));
        metrics::set_active_containers(running.fetch_add(1, Ordering::SeqCst) + 1);
        Self { slot, running }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.slot.set_active_ipc(None);
        metrics::set_active_containers(self.running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
    }
}

pub struct Dispatcher {
    config: Arc<Config>,
    host: SessionHost,
    launcher: Arc<dyn Launcher>,
    store: Option<SessionStore>,
    permits: Arc<Semaphore>,
    groups: Mutex<HashMap<String, Arc<GroupSlot>>>,
    running: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>) -> Self {
        let host = SessionHost::new(HostLimits::from_config(&config.container));
        let permits = Arc::new(Semaphore::new(config.container.max_concurrent.max(1)));
        Self {
            config,
            host,
            launcher: Arc::new(RuntimeLauncher),
            store: None,
            permits,
            groups: Mutex::new(HashMap::new()),
            running: AtomicU64::new(0),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Persist session ids so later runs resume them
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn slot(&self, group: &str) -> Arc<GroupSlot> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.entry(group.to_string()).or_default().clone()
    }

    fn live_ipc(&self, group: &str) -> Option<PathBuf> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(group).and_then(|slot| slot.active_ipc())
    }

    /// Groups with a container running right now
    pub fn active_groups(&self) -> Vec<String> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<String> = groups
            .iter()
            .filter(|(_, slot)| slot.active_ipc().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        active.sort();
        active
    }

    pub fn is_active(&self, group: &str) -> bool {
        self.live_ipc(group).is_some()
    }

    /// Run one container for a group and wait for it to finish.
    ///
    /// Runs for the same group queue behind each other; runs for different
    /// groups proceed in parallel up to `max_concurrent`. When the input names
    /// no session, the group's stored session is resumed if it belongs to the
    /// backend now in effect.
    pub async fn run<F>(&self, group: &str, mut input: ContainerInput, mut on_output: F) -> Result<RunOutcome>
    where
        F: FnMut(&ContainerOutput) + Send,
    {
        validate_group_folder(group)?;
        let slot = self.slot(group);
        let _turn = slot.run_lock.lock().await;
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Dispatcher is shut down")?;

        let spec = ContainerSpec::for_group(&self.config, group)?;
        let mailbox = Mailbox::for_ipc_root(&spec.ipc_dir);
        tokio::fs::create_dir_all(&spec.group_dir)
            .await
            .with_context(|| format!("Failed to create {}", spec.group_dir.display()))?;
        tokio::fs::create_dir_all(mailbox.input_dir())
            .await
            .with_context(|| format!("Failed to create {}", mailbox.input_dir().display()))?;
        if mailbox.clear_close().await? {
            tracing::debug!(group = %group, "Removed stale close sentinel");
        }

        input.group_folder = group.to_string();
        input.is_main = input.is_main || self.config.is_main_group(group);
        if input.session_id.is_none() {
            if let Some(store) = &self.store {
                match store.get(group)? {
                    Some(saved) if saved.backend == spec.backend => {
                        tracing::info!(group = %group, session_id = %saved.session_id, "Resuming stored session");
                        input.session_id = Some(saved.session_id);
                    }
                    Some(saved) => {
                        tracing::info!(
                            group = %group,
                            stored = %saved.backend,
                            current = %spec.backend,
                            "Backend changed; starting a fresh session"
                        );
                    }
                    None => {}
                }
            }
        }

        let _active = ActiveRun::start(&slot, &self.running, spec.ipc_dir.clone());
        let run = HostRun {
            group: group.to_string(),
            launch: self.launcher.launch(&spec),
            ipc_dir: spec.ipc_dir.clone(),
            log_dir: Some(spec.log_dir()),
        };

        let store = self.store.as_ref();
        let backend = spec.backend;
        let outcome = self
            .host
            .run(run, &input, |output| {
                if let (Some(store), Some(id)) = (store, &output.new_session_id) {
                    if let Err(e) = store.save(group, id, backend) {
                        tracing::warn!(group = %group, error = %e, "Failed to save session id");
                    }
                }
                on_output(output);
            })
            .await;

        Ok(outcome)
    }

    /// Route a follow-up into the group's live container.
    /// Returns false when none is running, so the caller starts a new run.
    pub async fn send_message(&self, group: &str, text: &str) -> Result<bool> {
        let Some(ipc_dir) = self.live_ipc(group) else {
            return Ok(false);
        };
        Mailbox::for_ipc_root(&ipc_dir).enqueue(text).await?;
        tracing::debug!(group = %group, "Queued follow-up for live container");
        Ok(true)
    }

    /// Ask the group's live container to finish after its current turn
    pub async fn close_session(&self, group: &str) -> Result<bool> {
        let Some(ipc_dir) = self.live_ipc(group) else {
            return Ok(false);
        };
        Mailbox::for_ipc_root(&ipc_dir).request_close().await?;
        tracing::info!(group = %group, "Requested session close");
        Ok(true)
    }
}
