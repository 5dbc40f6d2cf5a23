// ABOUTME: Container launch parameters for a group's agent session.
// ABOUTME: Builds runtime `run`/`stop` argument lists and the plain process command the host spawns.

use crate::config::{validate_group_folder, Config};
use anyhow::Result;
use corral_agent::{BackendKind, BACKEND_ENV_VAR};
use std::path::PathBuf;

pub const CONTAINER_GROUP_DIR: &str = "/workspace/group";
pub const CONTAINER_IPC_DIR: &str = "/workspace/ipc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl Mount {
    fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.readonly {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one container for one group
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub group: String,
    pub name: String,
    pub runtime: String,
    pub image: String,
    pub backend: BackendKind,
    /// Host side of /workspace/group
    pub group_dir: PathBuf,
    /// Host side of /workspace/ipc
    pub ipc_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn for_group(config: &Config, group: &str) -> Result<Self> {
        validate_group_folder(group)?;

        let group_dir = config.groups_dir().join(group);
        let ipc_dir = config.ipc_dir(group);
        let backend = config.backend_for(group);

        let mut mounts = vec![
            Mount {
                host_path: group_dir.clone(),
                container_path: CONTAINER_GROUP_DIR.to_string(),
                readonly: false,
            },
            Mount {
                host_path: ipc_dir.clone(),
                container_path: CONTAINER_IPC_DIR.to_string(),
                readonly: false,
            },
        ];
        if let Some(group_config) = config.group(group) {
            mounts.extend(group_config.mounts.iter().map(|m| Mount {
                host_path: PathBuf::from(&m.host_path),
                container_path: m.container_path.clone(),
                readonly: m.readonly,
            }));
        }

        Ok(Self {
            group: group.to_string(),
            name: container_name(group),
            runtime: config.container.runtime.clone(),
            image: config.container.image.clone(),
            backend,
            group_dir,
            ipc_dir,
            mounts,
            env: vec![(BACKEND_ENV_VAR.to_string(), backend.as_str().to_string())],
        })
    }

    pub fn run_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["run", "-i", "--rm", "--name", self.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        args.push(self.image.clone());
        args
    }

    /// The command the host spawns to run this container
    pub fn launch(&self) -> Launch {
        Launch {
            program: self.runtime.clone(),
            args: self.run_args(),
            env: Vec::new(),
            stop: Some(StopCommand {
                program: self.runtime.clone(),
                args: vec!["stop".to_string(), self.name.clone()],
            }),
        }
    }

    /// Where per-run container logs go
    pub fn log_dir(&self) -> PathBuf {
        self.group_dir.join("logs")
    }
}

/// Unique, runtime-safe container name for a group
fn container_name(group: &str) -> String {
    let safe: String = group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("corral-{}-{}", safe, &suffix[..8])
}

/// A process to spawn, plus how to ask its container to stop
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stop: Option<StopCommand>,
}

impl Launch {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stop: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct StopCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Turns a container spec into the process the host runs
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &ContainerSpec) -> Launch;
}

/// Runs containers through the configured runtime binary
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeLauncher;

impl Launcher for RuntimeLauncher {
    fn launch(&self, spec: &ContainerSpec) -> Launch {
        spec.launch()
    }
}
