//! TOML configuration file (spec.md §6) and its typed representation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::CdcError;

const MIN_CHANNEL_SIZE: usize = 100;
const MIN_FLUSH_DELAY_SECOND: u64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StarrocksConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Free-form per-filter configuration table (the shape differs per `type`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct FilterArgs(toml::value::Table);

impl FilterArgs {
    pub fn get_str(&self, key: &str) -> Result<String, CdcError> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| CdcError::Config(format!("filter config missing string key {key}")))
    }

    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>, CdcError> {
        let arr = self
            .0
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| CdcError::Config(format!("filter config missing array key {key}")))?;
        arr.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CdcError::Config(format!("filter config key {key} must be an array of strings")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(default)]
    pub config: FilterArgs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "source-schema")]
    pub source_schema: String,
    #[serde(rename = "source-table")]
    pub source_table: String,
    #[serde(rename = "target-schema")]
    pub target_schema: String,
    #[serde(rename = "target-table")]
    pub target_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncParamConfig {
    #[serde(rename = "channel-size")]
    pub channel_size: usize,
    #[serde(rename = "flush-delay-second")]
    pub flush_delay_second: u64,
}

impl SyncParamConfig {
    /// Clamps both parameters to their configured minimums, warning on the
    /// command line's behalf (the caller logs the warning; this just
    /// performs and reports the clamp).
    fn normalize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.channel_size < MIN_CHANNEL_SIZE {
            warnings.push(format!(
                "\"channel-size\" should not be less than {MIN_CHANNEL_SIZE}, reset from {} to {MIN_CHANNEL_SIZE}",
                self.channel_size
            ));
            self.channel_size = MIN_CHANNEL_SIZE;
        }
        if self.flush_delay_second < MIN_FLUSH_DELAY_SECOND {
            warnings.push(format!(
                "\"flush-delay-second\" should not be less than {MIN_FLUSH_DELAY_SECOND}, reset from {} to {MIN_FLUSH_DELAY_SECOND}",
                self.flush_delay_second
            ));
            self.flush_delay_second = MIN_FLUSH_DELAY_SECOND;
        }
        warnings
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub mysql: Option<MysqlConfig>,
    pub mongo: Option<MongoConfig>,
    pub starrocks: StarrocksConfig,
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
    #[serde(rename = "sync-param")]
    pub sync_param: SyncParamConfig,

    /// Absolute path to the config file itself, used to derive the position
    /// file path. Not part of the TOML document; filled in by `load`.
    #[serde(skip)]
    pub config_file: PathBuf,
}

impl PipelineConfig {
    /// Parses and validates a configuration file, clamping `sync-param`
    /// values and returning the warnings produced by that clamp so the
    /// caller can log them (config loading itself does not log).
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), CdcError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CdcError::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: PipelineConfig = toml::from_str(&contents)
            .map_err(|e| CdcError::Config(format!("parsing {}: {e}", path.display())))?;

        if config.name.trim().is_empty() {
            return Err(CdcError::Config(
                "the configuration file \"name\" variable cannot be empty".to_string(),
            ));
        }
        if config.mysql.is_none() && config.mongo.is_none() {
            return Err(CdcError::Config(
                "the configuration file must declare either [mysql] or [mongo]".to_string(),
            ));
        }

        let warnings = config.sync_param.normalize();
        config.config_file = path
            .canonicalize()
            .map_err(|e| CdcError::Config(format!("resolving {}: {e}", path.display())))?;
        Ok((config, warnings))
    }

    /// Derives the position file path by splitting the config path on `/`
    /// and replacing the last segment with `_<name>-pos.info`, matching
    /// `original_source/pkg/position/position_interface.go`.
    pub fn position_file_path(&self) -> PathBuf {
        position_file_path_for(&self.config_file, &self.name)
    }
}

pub fn position_file_path_for(config_path: &Path, name: &str) -> PathBuf {
    let path_str = config_path.to_string_lossy();
    let mut segments: Vec<&str> = path_str.split('/').collect();
    let file_name = format!("_{name}-pos.info");
    if let Some(last) = segments.last_mut() {
        *last = &file_name;
    } else {
        segments.push(&file_name);
    }
    PathBuf::from(segments.join("/"))
}
