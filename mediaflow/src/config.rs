//! Configuration types and defaults

use crate::{MediaError, MediaResult, OutPacketBufferConfig, ProfilerConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

/// Global mediaflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Event loop settings
    pub scheduler: SchedulerConfig,
    /// Packet sizing for packetizing sinks
    pub packet: OutPacketBufferConfig,
    /// Enable debug logging
    pub debug_logging: bool,
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub log_filter: Option<String>,
    /// Sample event loop counters periodically
    pub profiler: Option<ProfilerConfig>,
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> MediaResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| MediaError::InvalidConfiguration {
            message: format!("malformed runtime configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> MediaResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MediaError::InvalidConfiguration {
            message: format!("cannot serialize runtime configuration: {}", e),
        })
    }

    /// Check every section
    pub fn validate(&self) -> MediaResult<()> {
        self.scheduler.validate()?;
        self.packet.validate()?;
        if let Some(profiler) = &self.profiler {
            if profiler.interval_us == 0 {
                return Err(MediaError::InvalidConfiguration {
                    message: "profiler interval_us must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.debug_logging);
        assert!(config.profiler.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RuntimeConfig::from_json(r#"{"packet": {"max_packet_size": 1200}}"#).unwrap();
        assert_eq!(config.packet.max_packet_size, 1200);
        assert_eq!(config.packet.preferred_packet_size, 1000);
        assert_eq!(config.scheduler.max_events_per_wait, 64);
    }

    #[test]
    fn test_json_round_trip() {
        let config = RuntimeConfig {
            debug_logging: true,
            log_filter: Some("mediaflow_media=trace".to_string()),
            ..Default::default()
        };
        let parsed = RuntimeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert!(parsed.debug_logging);
        assert_eq!(parsed.log_filter.as_deref(), Some("mediaflow_media=trace"));
    }

    #[test]
    fn test_invalid_sections_are_rejected() {
        let err = RuntimeConfig::from_json(r#"{"scheduler": {"max_events_per_wait": 0}}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");

        let err = RuntimeConfig::from_json(r#"{"packet": {"preferred_packet_size": 5000}}"#).unwrap_err();
        assert!(matches!(err, MediaError::InvalidConfiguration { .. }));

        assert!(RuntimeConfig::from_json("not json").is_err());
    }
}
