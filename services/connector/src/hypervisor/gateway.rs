//! Typed wrapper over the `multipass` command line.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use connector_protocol::Size;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::runner::{CommandRunner, ToolOutput};
use super::HypervisorError;

/// Default executable name, resolved through `PATH`.
pub const MULTIPASS: &str = "multipass";

/// Normalized result of `multipass info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    pub exists: bool,
    /// Hypervisor state string, e.g. `Running` or `Stopped`. May be empty.
    pub state: String,
    pub ipv4: Vec<String>,
}

impl InstanceInfo {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Arguments for `multipass launch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub image: String,
    pub cpus: Option<u32>,
    pub memory: Option<Size>,
    pub disk: Option<Size>,
    pub cloud_init: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["launch".to_string(), "--name".to_string(), self.name.clone()];
        if let Some(cpus) = self.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = self.memory {
            args.push("--memory".to_string());
            args.push(memory.to_string());
        }
        if let Some(disk) = self.disk {
            args.push("--disk".to_string());
            args.push(disk.to_string());
        }
        if let Some(path) = &self.cloud_init {
            args.push("--cloud-init".to_string());
            args.push(path.display().to_string());
        }
        args.push(self.image.clone());
        args
    }
}

/// Gateway to the hypervisor executable.
#[derive(Clone)]
pub struct Multipass {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl Multipass {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_program(runner, MULTIPASS)
    }

    pub fn with_program(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Check that the executable is installed and answers.
    pub async fn version(&self) -> Result<String, HypervisorError> {
        let output = self.run(&["version"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<(), HypervisorError> {
        self.run_owned(request.args()).await.map(drop)
    }

    pub async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["start", name]).await.map(drop)
    }

    pub async fn stop(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["stop", name]).await.map(drop)
    }

    pub async fn delete(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["delete", name]).await.map(drop)
    }

    pub async fn purge(&self) -> Result<(), HypervisorError> {
        self.run(&["purge"]).await.map(drop)
    }

    /// Set `local.<name>.<key>=<value>`.
    pub async fn set(&self, name: &str, key: &str, value: &str) -> Result<(), HypervisorError> {
        let setting = format!("local.{name}.{key}={value}");
        self.run(&["set", &setting]).await.map(drop)
    }

    /// Run a command inside the guest.
    pub async fn exec_in_guest(&self, name: &str, command: &[&str]) -> Result<(), HypervisorError> {
        let mut args = vec!["exec", name, "--"];
        args.extend_from_slice(command);
        self.run(&args).await.map(drop)
    }

    /// Query an instance.
    ///
    /// A non-zero exit or an unreadable document means the instance does not
    /// exist. Only a failure to spawn the executable is an error.
    pub async fn info(&self, name: &str) -> Result<InstanceInfo, HypervisorError> {
        let output = self
            .invoke(vec![
                "info".to_string(),
                name.to_string(),
                "--format".to_string(),
                "json".to_string(),
            ])
            .await?;

        if !output.success() {
            debug!(instance = %name, code = output.code, "Instance not found");
            return Ok(InstanceInfo::missing());
        }

        Ok(parse_info(name, &output.stdout))
    }

    async fn run(&self, args: &[&str]) -> Result<ToolOutput, HypervisorError> {
        self.run_owned(args.iter().map(|arg| arg.to_string()).collect())
            .await
    }

    async fn run_owned(&self, args: Vec<String>) -> Result<ToolOutput, HypervisorError> {
        let output = self.invoke(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(HypervisorError::exit(&self.program, &output))
        }
    }

    async fn invoke(&self, args: Vec<String>) -> Result<ToolOutput, HypervisorError> {
        info!(command = %render_command(&self.program, &args), "Running hypervisor command");

        self.runner
            .run(&self.program, &args)
            .await
            .map_err(|source| HypervisorError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

#[derive(Debug, Deserialize)]
struct InfoDocument {
    #[serde(default)]
    info: Option<serde_json::Map<String, Value>>,
}

fn parse_info(name: &str, stdout: &str) -> InstanceInfo {
    let document: InfoDocument = match serde_json::from_str(stdout) {
        Ok(document) => document,
        Err(e) => {
            debug!(instance = %name, error = %e, "Unreadable info output");
            return InstanceInfo::missing();
        }
    };

    let entry = document.info.and_then(|entries| {
        entries
            .get(name)
            .cloned()
            .or_else(|| entries.into_iter().next().map(|(_, value)| value))
    });

    // Fields are read independently so one odd value does not hide the rest.
    let state = entry
        .as_ref()
        .and_then(|entry| entry.get("state"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ipv4: Vec<String> = entry
        .as_ref()
        .and_then(|entry| entry.get("ipv4"))
        .and_then(Value::as_array)
        .map(|addresses| {
            addresses
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    InstanceInfo {
        exists: true,
        state,
        ipv4,
    }
}

/// Shell-safe rendering of a command line, for logs.
pub fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|part| shell_escape::escape(Cow::Borrowed(part)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MockRunner;

    #[test]
    fn test_launch_args_order() {
        let request = LaunchRequest {
            name: "cocalc-h1".to_string(),
            image: "24.04".to_string(),
            cpus: Some(2),
            memory: Size::from_gib(4),
            disk: Size::from_mib(1536),
            cloud_init: Some(PathBuf::from("/tmp/ci/cloud-init.yml")),
        };
        assert_eq!(
            request.args(),
            vec![
                "launch",
                "--name",
                "cocalc-h1",
                "--cpus",
                "2",
                "--memory",
                "4G",
                "--disk",
                "1536M",
                "--cloud-init",
                "/tmp/ci/cloud-init.yml",
                "24.04"
            ]
        );
    }

    #[test]
    fn test_parse_info_picks_named_entry() {
        let stdout = r#"{"errors": [], "info": {
            "other": {"state": "Stopped", "ipv4": []},
            "vm": {"state": "Running", "ipv4": ["10.1.2.3"]}
        }}"#;
        let info = parse_info("vm", stdout);
        assert!(info.exists);
        assert!(info.is_running());
        assert_eq!(info.ipv4, vec!["10.1.2.3"]);
    }

    #[test]
    fn test_parse_info_falls_back_to_first_entry() {
        let info = parse_info("vm", r#"{"info": {"renamed": {"state": "Stopped"}}}"#);
        assert!(info.exists);
        assert_eq!(info.state, "Stopped");
        assert!(info.ipv4.is_empty());
    }

    #[test]
    fn test_parse_info_without_entries_exists_with_empty_state() {
        let info = parse_info("vm", r#"{"errors": []}"#);
        assert!(info.exists);
        assert!(info.state.is_empty());

        let info = parse_info("vm", r#"{"info": {}}"#);
        assert!(info.exists);
        assert!(info.state.is_empty());
    }

    #[test]
    fn test_parse_info_skips_odd_values() {
        let info = parse_info(
            "vm",
            r#"{"info": {"vm": {"state": "Running", "ipv4": ["10.1.2.3", null, 7]}}}"#,
        );
        assert!(info.is_running());
        assert_eq!(info.ipv4, vec!["10.1.2.3"]);

        let info = parse_info("vm", r#"{"info": {"vm": {"state": 3, "ipv4": "10.1.2.3"}}}"#);
        assert!(info.exists);
        assert!(info.state.is_empty());
        assert!(info.ipv4.is_empty());
    }

    #[test]
    fn test_parse_info_garbage_is_missing() {
        assert_eq!(parse_info("vm", "not json"), InstanceInfo::missing());
    }

    #[test]
    fn test_render_command_quotes_unsafe_args() {
        let args = vec![
            "exec".to_string(),
            "vm one".to_string(),
            "--".to_string(),
            "it's".to_string(),
        ];
        assert_eq!(
            render_command("multipass", &args),
            r#"multipass exec 'vm one' -- 'it'\''s'"#
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_trimmed_stderr() {
        let runner = Arc::new(MockRunner::new());
        runner.fail_on("start", "  start failed: instance \"vm\" does not exist \n");
        let multipass = Multipass::new(runner);

        let err = multipass.start("vm").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "start failed: instance \"vm\" does not exist"
        );
    }

    #[tokio::test]
    async fn test_set_renders_local_key() {
        let runner = Arc::new(MockRunner::new());
        runner.add_instance("vm", "Stopped", &[]);
        let multipass = Multipass::new(runner.clone());

        multipass.set("vm", "cpus", "4").await.unwrap();
        assert_eq!(runner.calls().last().unwrap(), &["set", "local.vm.cpus=4"]);
    }
}
