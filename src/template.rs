//! Mixer session templates, carried as opaque configuration.
//!
//! Templates describe the DSP chain (EQ, compressor, ducking, aux sends)
//! applied by the mixing engine before the mixed signal reaches the output
//! manager. This crate never interprets the numeric fields; it stores and
//! hands the blobs to the mixer unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// DSP settings for one mixer channel.
///
/// All processing fields are opaque JSON consumed by the mixing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTemplate {
    /// Channel label, e.g. `host` or `guest-2`.
    pub name: String,
    /// Equalizer settings.
    #[serde(default)]
    pub eq: Value,
    /// Compressor settings.
    #[serde(default)]
    pub compressor: Value,
    /// Ducking settings.
    #[serde(default)]
    pub ducking: Value,
    /// Aux send levels.
    #[serde(default)]
    pub aux_sends: Value,
}

/// DSP settings for the master bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterTemplate {
    /// Equalizer settings.
    #[serde(default)]
    pub eq: Value,
    /// Compressor settings.
    #[serde(default)]
    pub compressor: Value,
}

/// Complete DSP chain configuration for a room session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTemplate {
    /// Unique identifier.
    pub id: Uuid,
    /// Template name.
    pub name: String,
    /// Per-channel settings.
    pub channels: Vec<ChannelTemplate>,
    /// Master bus settings.
    pub master: MasterTemplate,
}

impl SessionTemplate {
    /// Creates an empty template with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            channels: Vec::new(),
            master: MasterTemplate::default(),
        }
    }
}
