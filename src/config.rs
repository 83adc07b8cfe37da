use serde::Deserialize;
use std::fs;
use std::path::Path;

// API endpoints
pub const AUTH_URL: &str = "https://hlwicpfwc.miit.gov.cn/icpproject_query/api/auth";
pub const CAPTCHA_IMAGE_URL: &str =
    "https://hlwicpfwc.miit.gov.cn/icpproject_query/api/image/getCheckImagePoint";
pub const CAPTCHA_CHECK_URL: &str =
    "https://hlwicpfwc.miit.gov.cn/icpproject_query/api/image/checkImage";
pub const QUERY_URL: &str =
    "https://hlwicpfwc.miit.gov.cn/icpproject_query/api/icpAbbreviateInfo/queryByCondition";
pub const DETAIL_QUERY_URL: &str =
    "https://hlwicpfwc.miit.gov.cn/icpproject_query/api/icpAbbreviateInfo/queryDetailByAppAndMiniId";

pub const REFERER: &str = "https://beian.miit.gov.cn/";
pub const ORIGIN: &str = "https://beian.miit.gov.cn";
pub const HOST: &str = "hlwicpfwc.miit.gov.cn";

/// Shared secret hashed with the timestamp to form the auth key.
pub const AUTH_SECRET: &str = "testtest";

// Retry bounds
pub const MAX_AUTH_RETRIES: usize = 10;
pub const MAX_TOKEN_RETRIES: usize = 10;
pub const MAX_CAPTCHA_RETRIES: usize = 5;
pub const MAX_DIRECT_RETRIES: usize = 3;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Path to the YOLO glyph-detection model.
    #[serde(default = "default_detect_model")]
    pub detect_model_path: String,

    /// Path to the siamese similarity model.
    #[serde(default = "default_match_model")]
    pub match_model_path: String,

    /// Newline-delimited proxy list; missing file means direct traffic.
    #[serde(default = "default_proxy_file")]
    pub proxy_file: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Pacing after a successful proxied request, milliseconds.
    #[serde(default = "default_proxied_pace_min")]
    pub proxied_pace_min_ms: u64,
    #[serde(default = "default_proxied_pace_max")]
    pub proxied_pace_max_ms: u64,

    /// Pacing after a successful direct request; direct traffic is
    /// throttled harder since it lacks IP diversity.
    #[serde(default = "default_direct_pace_min")]
    pub direct_pace_min_ms: u64,
    #[serde(default = "default_direct_pace_max")]
    pub direct_pace_max_ms: u64,
}

fn default_detect_model() -> String { "onnx/yolov8.onnx".to_string() }
fn default_match_model() -> String { "onnx/siamese.onnx".to_string() }
fn default_proxy_file() -> String { "proxy.txt".to_string() }
fn default_timeout() -> u64 { 15 }
fn default_proxied_pace_min() -> u64 { 500 }
fn default_proxied_pace_max() -> u64 { 1500 }
fn default_direct_pace_min() -> u64 { 3000 }
fn default_direct_pace_max() -> u64 { 4000 }

impl Default for Config {
    fn default() -> Self {
        Self {
            detect_model_path: default_detect_model(),
            match_model_path: default_match_model(),
            proxy_file: default_proxy_file(),
            timeout_secs: default_timeout(),
            proxied_pace_min_ms: default_proxied_pace_min(),
            proxied_pace_max_ms: default_proxied_pace_max(),
            direct_pace_min_ms: default_direct_pace_min(),
            direct_pace_max_ms: default_direct_pace_max(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let path = Path::new("config.toml");
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(cfg) = toml::from_str::<Config>(&content) {
                    return cfg;
                }
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.timeout_secs, 15);
        assert!(cfg.direct_pace_min_ms > cfg.proxied_pace_max_ms);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str("timeout_secs = 30").unwrap();
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.proxy_file, "proxy.txt");
    }
}
