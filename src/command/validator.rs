//! Command validator - parses raw input into a `CommandTemplate`
//!
//! Checks run in a fixed order and field violations accumulate, so a caller
//! sees every problem with its input in one pass:
//! 1. structure (input must be a JSON object that deserializes)
//! 2. fields: device_id, command_type, parameters.value, parameters.status
//! 3. region, only once all field checks passed

use std::fmt;
use std::sync::{Arc, OnceLock};

use fleet_shared::{defaults, CommandParameters, SwitchStatus};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::CommandTemplate;
use crate::routing::RegionTable;

/// A single field rule that input broke
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldViolation {
    #[error("device_id must not be blank")]
    DeviceIdBlank,

    #[error("device_id must be 8-32 characters of [a-zA-Z0-9_-], got {0:?}")]
    DeviceIdFormat(String),

    #[error("command_type must not be blank")]
    CommandTypeBlank,

    #[error("parameters.value must be within [0, 100], got {0}")]
    ValueOutOfRange(f64),

    #[error("parameters.status must be one of on/off/auto, got {0:?}")]
    InvalidStatus(String),
}

impl FieldViolation {
    /// Input field the violation refers to
    pub fn field(&self) -> &'static str {
        match self {
            FieldViolation::DeviceIdBlank | FieldViolation::DeviceIdFormat(_) => "device_id",
            FieldViolation::CommandTypeBlank => "command_type",
            FieldViolation::ValueOutOfRange(_) => "parameters.value",
            FieldViolation::InvalidStatus(_) => "parameters.status",
        }
    }
}

/// Why raw input was not turned into a `CommandTemplate`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("field validation failed: {}", ViolationList(.0))]
    FieldValidationFailed(Vec<FieldViolation>),

    #[error("unsupported region: {0:?}")]
    UnsupportedRegion(String),
}

struct ViolationList<'a>(&'a [FieldViolation]);

impl fmt::Display for ViolationList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

/// Input shape as producers send it
#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    command_type: Option<String>,
    #[serde(default)]
    parameters: Option<RawParameters>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParameters {
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    status: Option<String>,
}

fn device_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            "^[a-zA-Z0-9_-]{{{},{}}}$",
            defaults::DEVICE_ID_MIN_LEN,
            defaults::DEVICE_ID_MAX_LEN
        ))
        .expect("device id pattern is valid")
    })
}

/// Validates raw command input against field and region rules
#[derive(Debug, Clone)]
pub struct CommandValidator {
    regions: Arc<RegionTable>,
}

impl CommandValidator {
    pub fn new(regions: Arc<RegionTable>) -> Self {
        Self { regions }
    }

    /// Validate a JSON document
    pub fn validate(&self, raw: &str) -> Result<CommandTemplate, ValidationError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ValidationError::MalformedInput(e.to_string()))?;
        self.validate_value(&value)
    }

    /// Validate an already-parsed JSON value
    ///
    /// Only objects are accepted; serde would otherwise read a sequence
    /// positionally into the named fields.
    pub fn validate_value(&self, raw: &serde_json::Value) -> Result<CommandTemplate, ValidationError> {
        if !raw.is_object() {
            return Err(ValidationError::MalformedInput(format!(
                "expected a JSON object, got {}",
                json_kind(raw)
            )));
        }
        let parsed = RawCommand::deserialize(raw)
            .map_err(|e| ValidationError::MalformedInput(e.to_string()))?;
        self.check(parsed)
    }

    fn check(&self, raw: RawCommand) -> Result<CommandTemplate, ValidationError> {
        let mut violations = Vec::new();

        match raw.device_id.as_deref() {
            None => violations.push(FieldViolation::DeviceIdBlank),
            Some(id) if id.trim().is_empty() => violations.push(FieldViolation::DeviceIdBlank),
            Some(id) if !device_id_pattern().is_match(id) => {
                violations.push(FieldViolation::DeviceIdFormat(id.to_string()))
            }
            Some(_) => {}
        }

        if raw
            .command_type
            .as_deref()
            .map_or(true, |t| t.trim().is_empty())
        {
            violations.push(FieldViolation::CommandTypeBlank);
        }

        let mut parameters = None;
        if let Some(params) = raw.parameters {
            if let Some(value) = params.value {
                if !(defaults::PARAMETER_VALUE_MIN..=defaults::PARAMETER_VALUE_MAX).contains(&value)
                {
                    violations.push(FieldViolation::ValueOutOfRange(value));
                }
            }

            let status = match params.status.as_deref() {
                None => None,
                Some(s) => match SwitchStatus::parse(s) {
                    Some(status) => Some(status),
                    None => {
                        violations.push(FieldViolation::InvalidStatus(s.to_string()));
                        None
                    }
                },
            };

            parameters = Some(CommandParameters {
                value: params.value,
                status,
            });
        }

        if !violations.is_empty() {
            return Err(ValidationError::FieldValidationFailed(violations));
        }

        let region_raw = raw.region.unwrap_or_default();
        let region = self
            .regions
            .normalize(&region_raw)
            .ok_or_else(|| ValidationError::UnsupportedRegion(region_raw.clone()))?;

        Ok(CommandTemplate::new(
            raw.device_id.unwrap_or_default(),
            raw.command_type.unwrap_or_default(),
            parameters,
            region.name().to_string(),
        ))
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_regions;
    use serde_json::json;

    fn validator() -> CommandValidator {
        CommandValidator::new(Arc::new(RegionTable::new(&default_regions()).unwrap()))
    }

    #[test]
    fn test_valid_command() {
        let template = validator()
            .validate(
                r#"{"device_id":"watermeter_0001","command_type":"SetStatus",
                    "parameters":{"status":"on"},"region":"华东"}"#,
            )
            .unwrap();

        assert_eq!(template.device_id(), "watermeter_0001");
        assert_eq!(template.command_type(), "SetStatus");
        assert_eq!(template.region(), "华东");
        assert_eq!(
            template.parameters(),
            Some(&CommandParameters {
                value: None,
                status: Some(SwitchStatus::On),
            })
        );
    }

    #[test]
    fn test_region_alias_is_normalized() {
        let template = validator()
            .validate_value(&json!({
                "device_id": "watermeter_0001",
                "command_type": "SetValue",
                "parameters": {"value": 100.0},
                "region": "north_china"
            }))
            .unwrap();
        assert_eq!(template.region(), "华北");
        assert_eq!(template.parameters().unwrap().value, Some(100.0));
    }

    #[test]
    fn test_parameters_optional() {
        let template = validator()
            .validate_value(&json!({
                "device_id": "watermeter_0001",
                "command_type": "Reboot",
                "region": "EAST_CHINA"
            }))
            .unwrap();
        assert!(template.parameters().is_none());
    }

    #[test]
    fn test_all_violations_reported_in_order() {
        let err = validator()
            .validate_value(&json!({
                "device_id": "bad id!",
                "command_type": "  ",
                "parameters": {"value": 150.5, "status": "dim"},
                "region": "华东"
            }))
            .unwrap_err();

        assert_eq!(
            err,
            ValidationError::FieldValidationFailed(vec![
                FieldViolation::DeviceIdFormat("bad id!".into()),
                FieldViolation::CommandTypeBlank,
                FieldViolation::ValueOutOfRange(150.5),
                FieldViolation::InvalidStatus("dim".into()),
            ])
        );
    }

    #[test]
    fn test_field_errors_take_precedence_over_region() {
        let err = validator()
            .validate_value(&json!({
                "device_id": "watermeter_0001",
                "parameters": {"value": -1},
                "region": "mars"
            }))
            .unwrap_err();

        match err {
            ValidationError::FieldValidationFailed(violations) => {
                let fields: Vec<_> = violations.iter().map(|v| v.field()).collect();
                assert_eq!(fields, vec!["command_type", "parameters.value"]);
            }
            other => panic!("expected field errors, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_region() {
        let err = validator()
            .validate_value(&json!({
                "device_id": "watermeter_0001",
                "command_type": "SetStatus",
                "region": "华南"
            }))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedRegion("华南".into()));

        let err = validator()
            .validate_value(&json!({
                "device_id": "watermeter_0001",
                "command_type": "SetStatus"
            }))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedRegion(String::new()));
    }

    #[test]
    fn test_device_id_length_bounds() {
        let v = validator();
        let check = |id: &str| {
            v.validate_value(&json!({
                "device_id": id,
                "command_type": "Ping",
                "region": "华北"
            }))
        };

        assert!(check("abcd_123").is_ok());
        assert!(check(&"a".repeat(32)).is_ok());
        assert!(check("abc_123").is_err());
        assert!(check(&"a".repeat(33)).is_err());
        assert_eq!(
            check("").unwrap_err(),
            ValidationError::FieldValidationFailed(vec![FieldViolation::DeviceIdBlank])
        );
    }

    #[test]
    fn test_malformed_input() {
        let v = validator();
        assert!(matches!(
            v.validate("{not json"),
            Err(ValidationError::MalformedInput(_))
        ));
        assert!(matches!(
            v.validate(r#"{"device_id": 42}"#),
            Err(ValidationError::MalformedInput(_))
        ));
        assert!(matches!(
            v.validate("[1, 2]"),
            Err(ValidationError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_positional_array_is_malformed() {
        let v = validator();
        let err = v
            .validate(r#"["watermeter_0001","SetStatus",null,"华东"]"#)
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedInput(ref m) if m.contains("array")));

        assert!(matches!(v.validate("[]"), Err(ValidationError::MalformedInput(_))));
        assert!(matches!(
            v.validate_value(&json!(["watermeter_0001", "SetStatus", null, "华东"])),
            Err(ValidationError::MalformedInput(_))
        ));
        assert!(matches!(v.validate("\"text\""), Err(ValidationError::MalformedInput(_))));
    }

    #[test]
    fn test_error_message_lists_violations() {
        let err = ValidationError::FieldValidationFailed(vec![
            FieldViolation::DeviceIdBlank,
            FieldViolation::CommandTypeBlank,
        ]);
        assert_eq!(
            err.to_string(),
            "field validation failed: device_id must not be blank; command_type must not be blank"
        );
    }
}
