/*!
Configuration management for the stream replay application.
*/

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vme_stream::{BufferFormat, EngineConfig, EventConfig, ModuleConfig, ReadoutCommand, ReadoutInfo, WriterLimits};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub replay: ReplayConfig,
    pub daq: DaqConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            replay: ReplayConfig::default(),
            daq: DaqConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Build and validate the readout layout. Fails before any data is read.
    pub fn readout_info(&self) -> Result<ReadoutInfo> {
        ReadoutInfo::build(&self.daq.events).with_context(|| "Invalid [daq] event configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            format: self.replay.format,
            limits: WriterLimits::new(self.replay.max_module_words, self.replay.max_event_words),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Controller family of the recorded buffers
    pub format: BufferFormat,

    /// Directory for listfile output
    pub output_directory: String,

    /// Write reassembled events to a listfile
    pub enable_storage: bool,

    /// Number of output buffers circulating between engine and writer
    pub queue_depth: usize,

    /// Capacity of each output buffer in bytes
    pub output_buffer_size: usize,

    /// How long the engine waits for a free output buffer
    pub free_buffer_timeout_ms: u64,

    /// Module section size ceiling in 32-bit words
    pub max_module_words: u32,

    /// Event section size ceiling in 32-bit words
    pub max_event_words: u32,

    /// Statistics reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl ReplayConfig {
    pub fn free_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.free_buffer_timeout_ms)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            format: BufferFormat::FramedUsb,
            output_directory: "./listfiles".to_string(),
            enable_storage: true,
            queue_depth: 16,
            output_buffer_size: 1024 * 1024,
            free_buffer_timeout_ms: 100,
            max_module_words: 0x3ff,
            max_event_words: 0xffff,
            stats_interval_seconds: 10,
        }
    }
}

/// VME events and their modules' readout programs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaqConfig {
    pub events: Vec<EventConfig>,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            events: vec![EventConfig {
                name: "trigger0".to_string(),
                stack_id: Some(0),
                modules: vec![
                    ModuleConfig {
                        name: "mdpp16".to_string(),
                        type_id: 1,
                        readout: vec![
                            ReadoutCommand::Marker { value: 0xaffe_0001 },
                            ReadoutCommand::BlockRead {
                                address: 0x0000_0000,
                                max_transfers: 0xffff,
                            },
                            ReadoutCommand::Read { address: 0x0000_6092 },
                        ],
                    },
                    ModuleConfig {
                        name: "v785".to_string(),
                        type_id: 2,
                        readout: vec![
                            ReadoutCommand::BlockRead {
                                address: 0x0100_0000,
                                max_transfers: 34,
                            },
                            ReadoutCommand::Write {
                                address: 0x0100_1032,
                                value: 0x4,
                            },
                        ],
                    },
                ],
            }],
        }
    }
}
