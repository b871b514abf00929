// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_APDEX_T, DEFAULT_COLLECTOR_HOST, DEFAULT_COLLECTOR_PORT, DEFAULT_COLLECTOR_TIMEOUT,
    DEFAULT_HARVEST_INTERVAL, DEFAULT_TOP_N_TRACES, MAX_TRACED_ERRORS,
};
use crate::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Config {
    pub license_key: String,
    pub app_names: Vec<String>,
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// Overrides the URL derived from host, port and scheme. Mostly for tests.
    pub collector_url: Option<String>,
    /// apdexT in seconds until the collector assigns one.
    pub apdex_t: f64,
    pub harvest_interval: Duration,
    /// Timeout for each collector request.
    pub timeout: Duration,
    pub error_collector_enabled: bool,
    pub max_traced_errors: usize,
    pub transaction_tracer_enabled: bool,
    /// Minimum duration of a kept trace; four times apdexT when unset.
    pub trace_threshold: Option<Duration>,
    pub top_n_traces: usize,
    pub proxy_url: Option<String>,
    pub hostname: String,
    pub log_level: String,
}

impl Config {
    /// A configuration with every optional setting at its default.
    pub fn new(license_key: impl Into<String>, app_names: Vec<String>) -> Self {
        Self {
            license_key: license_key.into(),
            app_names,
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: DEFAULT_COLLECTOR_PORT,
            use_ssl: true,
            collector_url: None,
            apdex_t: DEFAULT_APDEX_T,
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            timeout: DEFAULT_COLLECTOR_TIMEOUT,
            error_collector_enabled: true,
            max_traced_errors: MAX_TRACED_ERRORS,
            transaction_tracer_enabled: true,
            trace_threshold: None,
            top_n_traces: DEFAULT_TOP_N_TRACES,
            proxy_url: None,
            hostname: "localhost".to_string(),
            log_level: "info".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let license_key = env::var("APM_LICENSE_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("APM_LICENSE_KEY"))?;

        let app_names: Vec<String> = env::var("APM_APP_NAME")
            .map_err(|_| ConfigError::Missing("APM_APP_NAME"))?
            .split(';')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if app_names.is_empty() {
            return Err(ConfigError::Invalid {
                key: "APM_APP_NAME",
                value: String::new(),
            });
        }

        let mut config = Config::new(license_key, app_names);
        if let Ok(host) = env::var("APM_HOST") {
            config.host = host;
        }
        config.port = parse_or("APM_PORT", config.port);
        config.use_ssl = bool_or("APM_USE_SSL", config.use_ssl);
        config.collector_url = env::var("APM_COLLECTOR_URL").ok();

        let apdex_t: f64 = parse_or("APM_APDEX_T", config.apdex_t);
        if apdex_t.is_finite() && apdex_t > 0.0 {
            config.apdex_t = apdex_t;
        } else {
            warn!("Ignoring non-positive APM_APDEX_T {apdex_t}");
        }
        config.harvest_interval = Duration::from_secs(
            parse_or("APM_HARVEST_INTERVAL_SECS", config.harvest_interval.as_secs()).max(1),
        );
        config.timeout =
            Duration::from_secs(parse_or("APM_TIMEOUT_SECS", config.timeout.as_secs()));

        config.error_collector_enabled =
            bool_or("APM_ERROR_COLLECTOR_ENABLED", config.error_collector_enabled);
        config.max_traced_errors = parse_or("APM_MAX_TRACED_ERRORS", config.max_traced_errors);
        config.transaction_tracer_enabled = bool_or(
            "APM_TRANSACTION_TRACER_ENABLED",
            config.transaction_tracer_enabled,
        );
        config.trace_threshold = env::var("APM_TRACE_THRESHOLD_SECS")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        config.top_n_traces = parse_or("APM_TOP_N_TRACES", config.top_n_traces);

        config.proxy_url = env::var("APM_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        if let Ok(hostname) = env::var("APM_HOSTNAME").or_else(|_| env::var("HOSTNAME")) {
            config.hostname = hostname;
        }
        if let Ok(level) = env::var("APM_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }
        Ok(config)
    }

    /// Base URL of the collector, without a trailing slash.
    pub fn collector_url(&self) -> String {
        if let Some(url) = &self.collector_url {
            return url.trim_end_matches('/').to_string();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value {value:?} for {key}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn bool_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => parse_bool(&value).unwrap_or_else(|| {
            warn!("Invalid boolean {value:?} for {key}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use duplicate::duplicate_item;
    use serial_test::serial;
    use std::env;
    use std::time::Duration;

    use crate::config;
    use crate::errors::ConfigError;

    const VARS: &[&str] = &[
        "APM_LICENSE_KEY",
        "APM_APP_NAME",
        "APM_HOST",
        "APM_PORT",
        "APM_USE_SSL",
        "APM_COLLECTOR_URL",
        "APM_APDEX_T",
        "APM_HARVEST_INTERVAL_SECS",
        "APM_TRACE_THRESHOLD_SECS",
        "APM_ERROR_COLLECTOR_ENABLED",
        "APM_PROXY_HTTPS",
        "HTTPS_PROXY",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_error_if_no_license_key() {
        clear_env();
        env::set_var("APM_APP_NAME", "shop");
        let config = config::Config::from_env();
        assert!(matches!(config, Err(ConfigError::Missing("APM_LICENSE_KEY"))));
        assert_eq!(
            config.unwrap_err().to_string(),
            "APM_LICENSE_KEY environment variable is not set"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_error_if_no_app_name() {
        clear_env();
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        let config = config::Config::from_env();
        assert!(matches!(config, Err(ConfigError::Missing("APM_APP_NAME"))));

        env::set_var("APM_APP_NAME", " ; ");
        let config = config::Config::from_env();
        assert!(matches!(config, Err(ConfigError::Invalid { .. })));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_APP_NAME", "shop;shop-eu");
        let config = config::Config::from_env().unwrap();
        assert_eq!(config.app_names, vec!["shop", "shop-eu"]);
        assert_eq!(config.collector_url(), "https://collector.example.com:443");
        assert_eq!(config.apdex_t, 0.1);
        assert_eq!(config.harvest_interval, Duration::from_secs(60));
        assert_eq!(config.trace_threshold, None);
        assert!(config.error_collector_enabled);
        assert!(config.proxy_url.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_APP_NAME", "shop");
        env::set_var("APM_HOST", "collector.internal");
        env::set_var("APM_PORT", "8080");
        env::set_var("APM_USE_SSL", "no");
        env::set_var("APM_APDEX_T", "0.5");
        env::set_var("APM_HARVEST_INTERVAL_SECS", "5");
        env::set_var("APM_TRACE_THRESHOLD_SECS", "1.5");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");
        let config = config::Config::from_env().unwrap();
        assert_eq!(config.collector_url(), "http://collector.internal:8080");
        assert_eq!(config.apdex_t, 0.5);
        assert_eq!(config.harvest_interval, Duration::from_secs(5));
        assert_eq!(config.trace_threshold, Some(Duration::from_millis(1500)));
        assert_eq!(config.proxy_url.as_deref(), Some("http://proxy:3128"));

        env::set_var("APM_COLLECTOR_URL", "http://127.0.0.1:1234/");
        let config = config::Config::from_env().unwrap();
        assert_eq!(config.collector_url(), "http://127.0.0.1:1234");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_fall_back_to_defaults() {
        clear_env();
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_APP_NAME", "shop");
        env::set_var("APM_PORT", "not-a-port");
        env::set_var("APM_APDEX_T", "-1");
        let config = config::Config::from_env().unwrap();
        assert_eq!(config.port, 443);
        assert_eq!(config.apdex_t, 0.1);
        clear_env();
    }

    #[duplicate_item(
        test_name                   value       expected;
        [test_bool_true]            ["true"]    [true];
        [test_bool_one]             ["1"]       [true];
        [test_bool_yes_uppercase]   ["YES"]     [true];
        [test_bool_false]           ["false"]   [false];
        [test_bool_zero]            ["0"]       [false];
        [test_bool_no]              ["no"]      [false];
        [test_bool_garbage]         ["maybe"]   [true];
    )]
    #[test]
    #[serial]
    fn test_name() {
        clear_env();
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_APP_NAME", "shop");
        env::set_var("APM_ERROR_COLLECTOR_ENABLED", value);
        let config = config::Config::from_env().unwrap();
        assert_eq!(config.error_collector_enabled, expected);
        clear_env();
    }
}
