//! Validated command template

use fleet_shared::{CommandParameters, CommandRequest};
use serde::Serialize;

/// A command that passed validation
///
/// Only the validator can build one, so holding a `CommandTemplate` means
/// every field rule held and the region is canonical.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandTemplate {
    device_id: String,
    command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<CommandParameters>,
    region: String,
}

impl CommandTemplate {
    pub(super) fn new(
        device_id: String,
        command_type: String,
        parameters: Option<CommandParameters>,
        region: String,
    ) -> Self {
        Self {
            device_id,
            command_type,
            parameters,
            region,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn parameters(&self) -> Option<&CommandParameters> {
        self.parameters.as_ref()
    }

    /// Canonical region name
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Wire form delivered to an endpoint
    pub fn to_request(&self) -> CommandRequest {
        CommandRequest {
            device_id: self.device_id.clone(),
            command_type: self.command_type.clone(),
            parameters: self.parameters.clone(),
            region: self.region.clone(),
        }
    }
}
