use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use engine::ResultChannelConfig;
use frame_scheduler::FinalizeSchedulerConfig;
use render_protocol::{CollisionMode, InteractionPolicy};
use renderer::PrepareOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use visibility::ReconcilerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read tileset config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse tileset config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize tileset config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid tileset config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilesetConfig {
    pub use_lod_transitions: bool,
    /// Seconds. Only read by the selection engine.
    pub lod_transition_length: f32,
    pub log_selection_stats: bool,
    pub create_physics_meshes: bool,
    pub always_include_tangents: bool,
    pub generate_missing_normals: bool,
    pub failure_channel_capacity: usize,
    pub occlusion: OcclusionConfig,
    pub finalize: FinalizeConfig,
    pub interaction: InteractionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionConfig {
    pub enabled: bool,
    pub proxy_pool_size: usize,
    pub frame_capacity: usize,
    pub recycle_capacity: usize,
    pub visible_pixel_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub min_per_tick: u32,
    pub max_per_tick: u32,
    /// Owner-thread microseconds per tick for finalization. `0` disables
    /// adaptation and always finalizes up to `max_per_tick`.
    pub target_micros_per_tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    pub collision_channel: u8,
    pub enable_double_sided_collisions: bool,
}

impl Default for TilesetConfig {
    fn default() -> Self {
        Self {
            use_lod_transitions: false,
            lod_transition_length: 0.5,
            log_selection_stats: false,
            create_physics_meshes: true,
            always_include_tangents: false,
            generate_missing_normals: true,
            failure_channel_capacity: 64,
            occlusion: OcclusionConfig::default(),
            finalize: FinalizeConfig::default(),
            interaction: InteractionConfig::default(),
        }
    }
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_pool_size: 500,
            frame_capacity: 2,
            recycle_capacity: 8,
            visible_pixel_threshold: occlusion::DEFAULT_VISIBLE_PIXEL_THRESHOLD,
        }
    }
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            min_per_tick: 1,
            max_per_tick: 64,
            target_micros_per_tick: 4_000,
        }
    }
}

impl TilesetConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: TilesetConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Like [`TilesetConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "tileset config not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_channel_capacity == 0 {
            return Err(invalid("failure_channel_capacity", "must be greater than zero"));
        }
        let length = self.lod_transition_length;
        if self.use_lod_transitions && (length.is_nan() || length <= 0.0) {
            return Err(invalid(
                "lod_transition_length",
                format!(
                    "must be greater than zero when transitions are enabled, got {length}"
                ),
            ));
        }

        let occlusion = &self.occlusion;
        if occlusion.proxy_pool_size == 0 {
            return Err(invalid("occlusion.proxy_pool_size", "must be greater than zero"));
        }
        if occlusion.frame_capacity == 0 {
            return Err(invalid("occlusion.frame_capacity", "must be greater than zero"));
        }
        if occlusion.recycle_capacity == 0 {
            return Err(invalid("occlusion.recycle_capacity", "must be greater than zero"));
        }
        if occlusion.visible_pixel_threshold.is_nan() || occlusion.visible_pixel_threshold < 0.0 {
            return Err(invalid(
                "occlusion.visible_pixel_threshold",
                format!(
                    "must be a non-negative number, got {}",
                    occlusion.visible_pixel_threshold
                ),
            ));
        }

        if self.finalize.max_per_tick == 0 {
            return Err(invalid("finalize.max_per_tick", "must be greater than zero"));
        }
        if self.finalize.min_per_tick > self.finalize.max_per_tick {
            return Err(invalid(
                "finalize.min_per_tick",
                format!(
                    "{} exceeds finalize.max_per_tick {}",
                    self.finalize.min_per_tick, self.finalize.max_per_tick
                ),
            ));
        }
        Ok(())
    }

    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            generate_missing_normals: self.generate_missing_normals,
            always_include_tangents: self.always_include_tangents,
            create_physics_meshes: self.create_physics_meshes,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            use_lod_transitions: self.use_lod_transitions,
            interaction: InteractionPolicy {
                collision_channel: self.interaction.collision_channel,
                double_sided_collisions: self.interaction.enable_double_sided_collisions,
            },
            shown_collision: if self.create_physics_meshes {
                CollisionMode::QueryAndPhysics
            } else {
                CollisionMode::QueryOnly
            },
        }
    }

    pub fn result_channel_config(&self) -> ResultChannelConfig {
        ResultChannelConfig {
            frame_capacity: self.occlusion.frame_capacity,
            recycle_capacity: self.occlusion.recycle_capacity,
        }
    }

    pub fn finalize_scheduler_config(&self) -> FinalizeSchedulerConfig {
        FinalizeSchedulerConfig {
            max_finalizations_per_tick: self.finalize.max_per_tick,
            min_finalizations_per_tick: self.finalize.min_per_tick,
            target_finalize_micros: self.finalize.target_micros_per_tick,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TilesetConfig::from_toml_str("").unwrap();
        assert_eq!(config, TilesetConfig::default());
        assert_eq!(config.occlusion.proxy_pool_size, 500);
        assert_eq!(config.finalize.max_per_tick, 64);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = TilesetConfig::from_toml_str(
            r#"
            use_lod_transitions = true
            lod_transition_length = 1.25

            [occlusion]
            proxy_pool_size = 32

            [interaction]
            collision_channel = 3
            "#,
        )
        .unwrap();

        assert!(config.use_lod_transitions);
        assert_eq!(config.occlusion.proxy_pool_size, 32);
        assert_eq!(config.occlusion.frame_capacity, 2);
        assert_eq!(config.reconciler_config().interaction.collision_channel, 3);
        assert!(config.reconciler_config().use_lod_transitions);
    }

    #[test]
    fn inverted_finalize_window_is_rejected() {
        let err = TilesetConfig::from_toml_str(
            r#"
            [finalize]
            min_per_tick = 10
            max_per_tick = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "finalize.min_per_tick",
                ..
            }
        ));
    }

    #[test]
    fn zero_capacities_and_bad_thresholds_are_rejected() {
        let mut config = TilesetConfig::default();
        config.occlusion.recycle_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = TilesetConfig::default();
        config.occlusion.visible_pixel_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = TilesetConfig::default();
        config.occlusion.visible_pixel_threshold = -0.5;
        assert!(config.validate().is_err());

        let mut config = TilesetConfig::default();
        config.failure_channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn transition_length_only_matters_when_enabled() {
        let mut config = TilesetConfig::default();
        config.lod_transition_length = 0.0;
        assert!(config.validate().is_ok());

        config.use_lod_transitions = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "lod_transition_length",
                ..
            })
        ));
    }

    #[test]
    fn finalize_table_reaches_the_scheduler() {
        let config = TilesetConfig::from_toml_str(
            r#"
            [finalize]
            min_per_tick = 3
            target_micros_per_tick = 0
            "#,
        )
        .unwrap();

        let scheduler = config.finalize_scheduler_config();
        assert_eq!(scheduler.min_finalizations_per_tick, 3);
        assert_eq!(scheduler.max_finalizations_per_tick, 64);
        assert_eq!(scheduler.target_finalize_micros, 0);
    }

    #[test]
    fn malformed_document_reports_parse_error() {
        let err = TilesetConfig::from_toml_str("use_lod_transitions = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn serialized_config_loads_back() {
        let mut config = TilesetConfig::default();
        config.log_selection_stats = true;
        config.finalize.max_per_tick = 8;

        let text = config.to_toml_string().unwrap();
        assert_eq!(TilesetConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("tileset-config-that-does-not-exist.toml");
        let config = TilesetConfig::load_or_default(&path).unwrap();
        assert_eq!(config, TilesetConfig::default());
        assert!(matches!(
            TilesetConfig::load(&path),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn disabled_physics_meshes_limit_collision_to_queries() {
        let mut config = TilesetConfig::default();
        config.create_physics_meshes = false;
        assert!(!config.prepare_options().create_physics_meshes);
        assert_eq!(
            config.reconciler_config().shown_collision,
            CollisionMode::QueryOnly
        );
    }
}
