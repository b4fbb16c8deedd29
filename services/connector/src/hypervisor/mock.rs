//! In-memory stand-in for the `multipass` executable.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;

use super::runner::{CommandRunner, ToolOutput};

/// A simulated instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockInstance {
    pub state: String,
    pub ipv4: Vec<String>,
    pub image: String,
    /// Values applied through `launch` flags or `set local.<name>.<key>`.
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MockState {
    instances: BTreeMap<String, MockInstance>,
    calls: Vec<Vec<String>>,
    failures: HashMap<String, String>,
    unavailable: bool,
    next_address: u32,
}

/// Mock hypervisor for tests and development.
///
/// Keeps a table of instances and answers the subset of subcommands the
/// connector uses, recording every invocation.
#[derive(Debug, Default)]
pub struct MockRunner {
    state: Mutex<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every invocation fail to spawn, as if the tool were not installed.
    pub fn unavailable() -> Self {
        let runner = Self::new();
        runner.lock().unavailable = true;
        runner
    }

    /// Seed an existing instance.
    pub fn add_instance(&self, name: &str, state: &str, ipv4: &[&str]) {
        self.lock().instances.insert(
            name.to_string(),
            MockInstance {
                state: state.to_string(),
                ipv4: ipv4.iter().map(|ip| ip.to_string()).collect(),
                ..Default::default()
            },
        );
    }

    /// Make a subcommand exit non-zero with the given stderr.
    pub fn fail_on(&self, subcommand: &str, stderr: &str) {
        self.lock()
            .failures
            .insert(subcommand.to_string(), stderr.to_string());
    }

    pub fn instance(&self, name: &str) -> Option<MockInstance> {
        self.lock().instances.get(name).cloned()
    }

    /// Every invocation so far, without the program name.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    /// Invocations that change something, i.e. everything except `info`
    /// and `version`.
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|call| !matches!(call.first().map(String::as_str), Some("info" | "version")))
            .map(|call| call.join(" "))
            .collect()
    }

    /// Number of invocations of a subcommand.
    pub fn count(&self, subcommand: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<ToolOutput> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program}: command not found"),
            ));
        }
        state.calls.push(args.to_vec());

        let Some(subcommand) = args.first().map(String::as_str) else {
            return Ok(exit(1, "no subcommand given"));
        };
        if let Some(stderr) = state.failures.get(subcommand) {
            return Ok(exit(1, stderr));
        }

        Ok(match (subcommand, &args[1..]) {
            ("version", _) => ok("multipass   1.14.1\nmultipassd  1.14.1\n"),
            ("launch", rest) => state.launch(rest),
            ("start", [name]) => state.transition(name, "Running"),
            ("stop", [name]) => state.transition(name, "Stopped"),
            ("delete", [name]) => match state.instances.remove(name) {
                Some(_) => ok(""),
                None => missing(name),
            },
            ("purge", []) => ok(""),
            ("info", [name, ..]) => state.info(name),
            ("set", [setting]) => state.set(setting),
            ("exec", [name, ..]) => match state.instances.get(name) {
                Some(instance) if instance.state == "Running" => ok(""),
                Some(_) => exit(2, &format!("exec failed: instance \"{name}\" is not running")),
                None => missing(name),
            },
            _ => exit(1, &format!("unsupported invocation: {}", args.join(" "))),
        })
    }
}

impl MockState {
    fn launch(&mut self, args: &[String]) -> ToolOutput {
        let mut instance = MockInstance {
            state: "Running".to_string(),
            ..Default::default()
        };
        let mut name = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.strip_prefix("--") {
                Some(flag) => {
                    let value = iter.next().cloned().unwrap_or_default();
                    if flag == "name" {
                        name = Some(value);
                    } else {
                        instance.settings.insert(flag.to_string(), value);
                    }
                }
                None => instance.image = arg.clone(),
            }
        }

        let Some(name) = name else {
            return exit(1, "launch requires --name in this mock");
        };
        if self.instances.contains_key(&name) {
            return exit(2, &format!("launch failed: instance \"{name}\" already exists"));
        }

        instance.ipv4 = vec![next_ipv4(&mut self.next_address)];
        self.instances.insert(name, instance);
        ok("Launched\n")
    }

    fn transition(&mut self, name: &str, target: &str) -> ToolOutput {
        let Some(instance) = self.instances.get_mut(name) else {
            return missing(name);
        };
        instance.state = target.to_string();
        if target == "Running" && instance.ipv4.is_empty() {
            instance.ipv4 = vec![next_ipv4(&mut self.next_address)];
        } else if target == "Stopped" {
            instance.ipv4.clear();
        }
        ok("")
    }

    fn info(&self, name: &str) -> ToolOutput {
        match self.instances.get(name) {
            Some(instance) => ok(&json!({
                "errors": [],
                "info": {
                    name: {"state": instance.state, "ipv4": instance.ipv4}
                }
            })
            .to_string()),
            None => exit(
                2,
                &format!(
                    "info failed: The following errors occurred:\ninstance \"{name}\" does not exist"
                ),
            ),
        }
    }

    fn set(&mut self, setting: &str) -> ToolOutput {
        let parsed = setting
            .strip_prefix("local.")
            .and_then(|rest| rest.split_once('='))
            .and_then(|(path, value)| {
                path.rsplit_once('.')
                    .map(|(name, key)| (name.to_string(), key.to_string(), value.to_string()))
            });
        let Some((name, key, value)) = parsed else {
            return exit(1, &format!("unknown setting: {setting}"));
        };

        match self.instances.get_mut(&name) {
            Some(instance) if instance.state == "Running" => exit(
                1,
                &format!("Cannot set '{key}': instance \"{name}\" must be stopped"),
            ),
            Some(instance) => {
                instance.settings.insert(key, value);
                ok("")
            }
            None => missing(&name),
        }
    }
}

/// Next address in 10.0.0.0/8, counting from 10.0.0.1.
fn next_ipv4(counter: &mut u32) -> String {
    *counter = counter.wrapping_add(1);
    let [_, a, b, c] = counter.to_be_bytes();
    format!("10.{a}.{b}.{c}")
}

fn ok(stdout: &str) -> ToolOutput {
    ToolOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        code: 0,
    }
}

fn exit(code: i32, stderr: &str) -> ToolOutput {
    ToolOutput {
        stdout: String::new(),
        stderr: format!("{stderr}\n"),
        code,
    }
}

fn missing(name: &str) -> ToolOutput {
    exit(2, &format!("instance \"{name}\" does not exist"))
}
