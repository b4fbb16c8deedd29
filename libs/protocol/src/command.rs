//! Typed commands decoded from a [`CommandEnvelope`].

use serde_json::{Map, Value};

use crate::envelope::CommandEnvelope;
use crate::error::PayloadError;
use crate::size::Size;

/// Image launched when a create command does not name one.
pub const DEFAULT_IMAGE: &str = "24.04";

/// Actions understood by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Start,
    Stop,
    Delete,
    Status,
    Resize,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Create,
        Action::Start,
        Action::Stop,
        Action::Delete,
        Action::Status,
        Action::Resize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Delete => "delete",
            Action::Status => "status",
            Action::Resize => "resize",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == name)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which instance a command refers to.
///
/// `name` wins when both are present; otherwise the name is resolved from
/// `host_id` by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub host_id: Option<String>,
    pub name: Option<String>,
}

/// Requested resource settings. Every field is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpus: Option<u32>,
    pub memory: Option<Size>,
    pub disk: Option<Size>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory.is_none() && self.disk.is_none()
    }
}

/// Fields of a `create` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub host_id: String,
    pub name: Option<String>,
    pub image: String,
    pub resources: Resources,
    /// Inline provisioning content for first boot.
    pub cloud_init: Option<String>,
}

/// Fields of a `resize` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeSpec {
    pub target: Target,
    pub resources: Resources,
}

/// A validated command, one variant per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create(CreateSpec),
    Start(Target),
    Stop(Target),
    Delete(Target),
    Status(Target),
    Resize(ResizeSpec),
    /// An action this connector does not implement.
    Unsupported { action: String },
}

impl Command {
    /// Decode and validate an envelope's payload.
    pub fn decode(envelope: &CommandEnvelope) -> Result<Self, PayloadError> {
        let payload = &envelope.payload;
        let Some(action) = Action::from_name(&envelope.action) else {
            return Ok(Command::Unsupported {
                action: envelope.action.clone(),
            });
        };

        let command = match action {
            Action::Create => {
                let host_id = identifier_field(payload, "host_id")?
                    .ok_or(PayloadError::MissingHostId { action: "create" })?;
                Command::Create(CreateSpec {
                    host_id,
                    name: identifier_field(payload, "name")?,
                    image: string_field(payload, "image")?
                        .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
                    resources: resources(payload)?,
                    cloud_init: first_string(payload, &["cloud_init", "cloud_init_yaml"])?,
                })
            }
            Action::Start => Command::Start(target(payload, action)?),
            Action::Stop => Command::Stop(target(payload, action)?),
            Action::Delete => Command::Delete(target(payload, action)?),
            Action::Status => Command::Status(target(payload, action)?),
            Action::Resize => Command::Resize(ResizeSpec {
                target: target(payload, action)?,
                resources: resources(payload)?,
            }),
        };

        Ok(command)
    }

    /// The action name, as sent by the control plane.
    pub fn action(&self) -> &str {
        match self {
            Command::Create(_) => Action::Create.as_str(),
            Command::Start(_) => Action::Start.as_str(),
            Command::Stop(_) => Action::Stop.as_str(),
            Command::Delete(_) => Action::Delete.as_str(),
            Command::Status(_) => Action::Status.as_str(),
            Command::Resize(_) => Action::Resize.as_str(),
            Command::Unsupported { action } => action,
        }
    }
}

fn target(payload: &Map<String, Value>, action: Action) -> Result<Target, PayloadError> {
    let target = Target {
        host_id: identifier_field(payload, "host_id")?,
        name: identifier_field(payload, "name")?,
    };
    if target.host_id.is_none() && target.name.is_none() {
        return Err(PayloadError::MissingTarget {
            action: action.as_str(),
        });
    }
    Ok(target)
}

fn resources(payload: &Map<String, Value>) -> Result<Resources, PayloadError> {
    Ok(Resources {
        cpus: first_present(payload, &["cpus", "vcpus"])
            .map(|(field, value)| cpu_count(field, value))
            .transpose()?,
        memory: size_field(payload, &["mem_gb", "memory_gb", "memory"])?,
        disk: size_field(payload, &["disk_gb", "disk"])?,
    })
}

/// First key with a meaningful value. `null` and empty strings count as absent.
fn first_present<'a>(
    payload: &'a Map<String, Value>,
    keys: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    keys.iter().find_map(|key| match payload.get(*key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some((*key, value)),
    })
}

fn first_string(
    payload: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<String>, PayloadError> {
    match first_present(payload, keys) {
        None => Ok(None),
        Some((_, Value::String(s))) => Ok(Some(s.clone())),
        Some((field, other)) => Err(PayloadError::InvalidField {
            field,
            reason: format!("expected a string, got {}", json_kind(other)),
        }),
    }
}

fn string_field(
    payload: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, PayloadError> {
    Ok(first_string(payload, &[key])?.map(|s| s.trim().to_string()))
}

/// A host id or instance name. Both end up in file and instance names, so
/// separators, `..` and control characters are rejected.
fn identifier_field(
    payload: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, PayloadError> {
    let value = string_field(payload, key)?;
    if let Some(id) = &value {
        let unsafe_char = id.chars().any(|c| c == '/' || c == '\\' || c.is_control());
        if unsafe_char || id.contains("..") {
            return Err(PayloadError::InvalidField {
                field: key,
                reason: format!(
                    "'{}' contains a path separator, '..' or a control character",
                    id.escape_debug()
                ),
            });
        }
    }
    Ok(value)
}

fn size_field(
    payload: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<Size>, PayloadError> {
    first_present(payload, keys)
        .map(|(field, value)| {
            Size::from_json(value).map_err(|source| PayloadError::InvalidSize { field, source })
        })
        .transpose()
}

fn cpu_count(field: &'static str, value: &Value) -> Result<u32, PayloadError> {
    let invalid = |reason: String| PayloadError::InvalidField { field, reason };

    let count = match value {
        Value::Number(number) => match number.as_u64() {
            Some(n) => n,
            None => match number.as_f64() {
                Some(f) if f > 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 => f as u64,
                _ => return Err(invalid(format!("expected a positive integer, got {number}"))),
            },
        },
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("expected a positive integer, got '{text}'")))?,
        other => {
            return Err(invalid(format!(
                "expected a number or a string, got {}",
                json_kind(other)
            )))
        }
    };

    match u32::try_from(count) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(format!("expected a positive integer, got {count}"))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SizeError;
    use rstest::rstest;
    use serde_json::json;

    fn envelope(action: &str, payload: Value) -> CommandEnvelope {
        CommandEnvelope {
            id: "cmd_test".to_string(),
            action: action.to_string(),
            payload: payload.as_object().cloned().unwrap_or_default(),
            issued_at: None,
        }
    }

    #[test]
    fn test_decode_create_with_defaults() {
        let command = Command::decode(&envelope("create", json!({"host_id": "h1"}))).unwrap();
        assert_eq!(
            command,
            Command::Create(CreateSpec {
                host_id: "h1".to_string(),
                name: None,
                image: DEFAULT_IMAGE.to_string(),
                resources: Resources::default(),
                cloud_init: None,
            })
        );
    }

    #[test]
    fn test_decode_create_with_aliases() {
        let command = Command::decode(&envelope(
            "create",
            json!({
                "host_id": "h1",
                "name": "vm-one",
                "image": "22.04",
                "vcpus": "4",
                "memory_gb": 8,
                "disk": "100G",
                "cloud_init_yaml": "#cloud-config\n"
            }),
        ))
        .unwrap();

        let Command::Create(spec) = command else {
            panic!("expected create");
        };
        assert_eq!(spec.name.as_deref(), Some("vm-one"));
        assert_eq!(spec.image, "22.04");
        assert_eq!(spec.resources.cpus, Some(4));
        assert_eq!(spec.resources.memory, Size::from_gib(8));
        assert_eq!(spec.resources.disk, Size::from_gib(100));
        assert_eq!(spec.cloud_init.as_deref(), Some("#cloud-config\n"));
    }

    #[test]
    fn test_primary_field_wins_over_alias() {
        let command = Command::decode(&envelope(
            "resize",
            json!({"name": "vm", "cpus": 2, "vcpus": 8, "mem_gb": 4, "memory": "64G"}),
        ))
        .unwrap();
        let Command::Resize(spec) = command else {
            panic!("expected resize");
        };
        assert_eq!(spec.resources.cpus, Some(2));
        assert_eq!(spec.resources.memory, Size::from_gib(4));
    }

    #[test]
    fn test_create_requires_host_id() {
        let err = Command::decode(&envelope("create", json!({"name": "vm"}))).unwrap_err();
        assert_eq!(err, PayloadError::MissingHostId { action: "create" });
        assert_eq!(err.to_string(), "create requires host_id");
    }

    #[rstest]
    #[case("start")]
    #[case("stop")]
    #[case("delete")]
    #[case("status")]
    #[case("resize")]
    fn test_target_required(#[case] action: &str) {
        let err = Command::decode(&envelope(action, json!({"host_id": ""}))).unwrap_err();
        assert_eq!(err.to_string(), format!("{action} requires host_id or name"));
    }

    #[rstest]
    #[case(json!({"host_id": "h", "cpus": 0}), "cpus")]
    #[case(json!({"host_id": "h", "cpus": 1.5}), "cpus")]
    #[case(json!({"host_id": "h", "vcpus": "many"}), "vcpus")]
    #[case(json!({"host_id": "h", "mem_gb": -2}), "mem_gb")]
    #[case(json!({"host_id": "h", "disk": "lots"}), "disk")]
    #[case(json!({"host_id": "h", "image": 24}), "image")]
    fn test_invalid_fields_are_rejected(#[case] payload: Value, #[case] field: &str) {
        let err = Command::decode(&envelope("create", payload)).unwrap_err();
        assert_eq!(err.field(), Some(field));
    }

    #[rstest]
    #[case("create", json!({"host_id": "../escaped"}), "host_id")]
    #[case("create", json!({"host_id": "h1", "name": "a/b"}), "name")]
    #[case("start", json!({"host_id": "h\\1"}), "host_id")]
    #[case("status", json!({"name": "v\tm"}), "name")]
    #[case("delete", json!({"name": ".."}), "name")]
    fn test_path_like_identifiers_are_rejected(
        #[case] action: &str,
        #[case] payload: Value,
        #[case] field: &str,
    ) {
        let err = Command::decode(&envelope(action, payload)).unwrap_err();
        assert_eq!(err.field(), Some(field));
    }

    #[test]
    fn test_dotted_identifiers_are_accepted() {
        let payload = json!({"name": "vm.v2", "host_id": "h-1_a"});
        let command = Command::decode(&envelope("status", payload)).unwrap();
        assert_eq!(
            command,
            Command::Status(Target {
                host_id: Some("h-1_a".to_string()),
                name: Some("vm.v2".to_string()),
            })
        );
    }

    #[test]
    fn test_invalid_size_message() {
        let err = Command::decode(&envelope("create", json!({"host_id": "h", "disk_gb": 0})))
            .unwrap_err();
        assert_eq!(
            err,
            PayloadError::InvalidSize {
                field: "disk_gb",
                source: SizeError::NotPositive("0".into()),
            }
        );
        assert_eq!(err.to_string(), "invalid disk_gb: size must be positive, got '0'");
    }

    #[test]
    fn test_unknown_action_is_unsupported() {
        let command = Command::decode(&envelope("snapshot", json!({}))).unwrap();
        assert_eq!(
            command,
            Command::Unsupported {
                action: "snapshot".to_string()
            }
        );
        assert_eq!(command.action(), "snapshot");
    }

    #[test]
    fn test_action_names_roundtrip() {
        for action in Action::ALL {
            assert_eq!(Action::from_name(action.as_str()), Some(action));
        }
        assert_eq!(Action::from_name("Create"), None);
    }
}
