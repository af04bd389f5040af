use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::rate_limit::RateLimitTier;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Local OpenAI-compatible Whisper server used for standard-quality jobs.
    #[serde(default = "default_standard_base_url")]
    pub standard_engine_base_url: String,
    #[serde(default = "default_standard_api_key")]
    pub standard_engine_api_key: String,
    #[serde(default = "default_standard_model")]
    pub standard_engine_model: String,

    /// Hosted premium engine, subject to audio-second quotas.
    #[serde(default = "default_premium_base_url")]
    pub premium_engine_base_url: String,
    #[serde(default)]
    pub premium_engine_api_key: String,
    #[serde(default = "default_premium_model")]
    pub premium_engine_model: String,
    #[serde(default)]
    pub premium_rate_limit_tier: RateLimitTier,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_transcription_timeout_secs")]
    pub transcription_timeout_secs: u64,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// Terminal-job retention. Completed jobs are pruned sooner than failed
    /// ones.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_standard_base_url() -> String {
    "http://127.0.0.1:9000/v1".to_string()
}

fn default_standard_api_key() -> String {
    // Local whisper servers accept any key.
    "local".to_string()
}

fn default_standard_model() -> String {
    "whisper-1".to_string()
}

fn default_premium_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_premium_model() -> String {
    "whisper-large-v3".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_download_timeout_secs() -> u64 {
    10 * 60
}

fn default_transcription_timeout_secs() -> u64 {
    10 * 60
}

fn default_callback_timeout_secs() -> u64 {
    10
}

fn default_completed_retention_secs() -> u64 {
    60 * 60
}

fn default_failed_retention_secs() -> u64 {
    24 * 60 * 60
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
