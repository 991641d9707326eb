//! Helpers shared by unit tests

use std::sync::Arc;

use crate::command::{CommandTemplate, CommandValidator};
use crate::config::default_regions;
use crate::routing::{RegionShardAssigner, RegionTable};

pub fn region_table() -> Arc<RegionTable> {
    Arc::new(RegionTable::new(&default_regions()).expect("default regions are valid"))
}

pub fn validator() -> CommandValidator {
    CommandValidator::new(region_table())
}

pub fn assigner() -> RegionShardAssigner {
    RegionShardAssigner::new(region_table())
}

/// A valid SetStatus command for `device_id` in 华东
pub fn template(device_id: &str) -> CommandTemplate {
    validator()
        .validate_value(&serde_json::json!({
            "device_id": device_id,
            "command_type": "SetStatus",
            "parameters": {"status": "on"},
            "region": "华东"
        }))
        .expect("test command is valid")
}
