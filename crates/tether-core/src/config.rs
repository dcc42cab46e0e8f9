// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::cache::ChannelCacheSettings;

/// Tether configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Limits for the shared channel factory cache
    pub factory_cache: ChannelCacheSettings,
    /// Limits for each factory's per-address channel pools
    pub channel_cache: ChannelCacheSettings,
    /// Share caches even for endpoints resolved by configuration name
    pub allow_unsafe_caching: bool,
    /// Graceful close timeout used when disposing channels and factories
    pub close_timeout: Duration,
    /// Delay before the single buffered receive retry
    pub buffered_receive_delay: Duration,
    /// Period of the background cache sweeper
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            factory_cache: ChannelCacheSettings::default(),
            channel_cache: ChannelCacheSettings::default(),
            allow_unsafe_caching: false,
            close_timeout: Duration::from_millis(5000),
            buffered_receive_delay: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional (with defaults):
    /// - `TETHER_FACTORY_CACHE_MAX_ITEMS`: factory cache capacity (default: 16)
    /// - `TETHER_FACTORY_IDLE_TIMEOUT_SECS`: factory idle timeout (default: 120)
    /// - `TETHER_FACTORY_LEASE_TIMEOUT_SECS`: factory lease timeout (default: 600)
    /// - `TETHER_CHANNEL_CACHE_MAX_ITEMS`: channels kept per address (default: 16)
    /// - `TETHER_CHANNEL_IDLE_TIMEOUT_SECS`: channel pool idle timeout (default: 120)
    /// - `TETHER_CHANNEL_LEASE_TIMEOUT_SECS`: channel pool lease timeout (default: 600)
    /// - `TETHER_ALLOW_UNSAFE_CACHING`: `true` or `false` (default: false)
    /// - `TETHER_CLOSE_TIMEOUT_MS`: graceful close timeout (default: 5000)
    /// - `TETHER_BUFFERED_RECEIVE_DELAY_MS`: buffered receive retry delay (default: 500)
    /// - `TETHER_SWEEP_INTERVAL_SECS`: cache sweeper period (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let factory_cache = ChannelCacheSettings {
            max_items: parse_var(
                "TETHER_FACTORY_CACHE_MAX_ITEMS",
                "16",
                "must be a non-negative integer",
            )?,
            idle_timeout: Duration::from_secs(parse_var(
                "TETHER_FACTORY_IDLE_TIMEOUT_SECS",
                "120",
                "must be a number of seconds",
            )?),
            lease_timeout: Duration::from_secs(parse_var(
                "TETHER_FACTORY_LEASE_TIMEOUT_SECS",
                "600",
                "must be a number of seconds",
            )?),
        };

        let channel_cache = ChannelCacheSettings {
            max_items: parse_var(
                "TETHER_CHANNEL_CACHE_MAX_ITEMS",
                "16",
                "must be a non-negative integer",
            )?,
            idle_timeout: Duration::from_secs(parse_var(
                "TETHER_CHANNEL_IDLE_TIMEOUT_SECS",
                "120",
                "must be a number of seconds",
            )?),
            lease_timeout: Duration::from_secs(parse_var(
                "TETHER_CHANNEL_LEASE_TIMEOUT_SECS",
                "600",
                "must be a number of seconds",
            )?),
        };

        let allow_unsafe_caching: bool = parse_var(
            "TETHER_ALLOW_UNSAFE_CACHING",
            "false",
            "must be 'true' or 'false'",
        )?;

        let close_timeout = Duration::from_millis(parse_var(
            "TETHER_CLOSE_TIMEOUT_MS",
            "5000",
            "must be a number of milliseconds",
        )?);

        let buffered_receive_delay = Duration::from_millis(parse_var(
            "TETHER_BUFFERED_RECEIVE_DELAY_MS",
            "500",
            "must be a number of milliseconds",
        )?);

        let sweep_interval_secs: u64 = parse_var(
            "TETHER_SWEEP_INTERVAL_SECS",
            "30",
            "must be a positive number of seconds",
        )?;
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_SWEEP_INTERVAL_SECS",
                "must be a positive number of seconds",
            ));
        }

        Ok(Self {
            factory_cache,
            channel_cache,
            allow_unsafe_caching,
            close_timeout,
            buffered_receive_delay,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(name, hint))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "TETHER_FACTORY_CACHE_MAX_ITEMS",
        "TETHER_FACTORY_IDLE_TIMEOUT_SECS",
        "TETHER_FACTORY_LEASE_TIMEOUT_SECS",
        "TETHER_CHANNEL_CACHE_MAX_ITEMS",
        "TETHER_CHANNEL_IDLE_TIMEOUT_SECS",
        "TETHER_CHANNEL_LEASE_TIMEOUT_SECS",
        "TETHER_ALLOW_UNSAFE_CACHING",
        "TETHER_CLOSE_TIMEOUT_MS",
        "TETHER_BUFFERED_RECEIVE_DELAY_MS",
        "TETHER_SWEEP_INTERVAL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.channel_cache.max_items, 16);
        assert_eq!(config.factory_cache.idle_timeout, Duration::from_secs(120));
        assert!(!config.allow_unsafe_caching);
        assert_eq!(config.buffered_receive_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("TETHER_FACTORY_CACHE_MAX_ITEMS", "4");
        guard.set("TETHER_CHANNEL_CACHE_MAX_ITEMS", "0");
        guard.set("TETHER_CHANNEL_IDLE_TIMEOUT_SECS", "5");
        guard.set("TETHER_ALLOW_UNSAFE_CACHING", "true");
        guard.set("TETHER_CLOSE_TIMEOUT_MS", "250");
        guard.set("TETHER_BUFFERED_RECEIVE_DELAY_MS", "10");
        guard.set("TETHER_SWEEP_INTERVAL_SECS", "2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.factory_cache.max_items, 4);
        assert_eq!(config.channel_cache.max_items, 0);
        assert_eq!(config.channel_cache.idle_timeout, Duration::from_secs(5));
        assert!(config.allow_unsafe_caching);
        assert_eq!(config.close_timeout, Duration::from_millis(250));
        assert_eq!(config.buffered_receive_delay, Duration::from_millis(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_config_invalid_boolean() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("TETHER_ALLOW_UNSAFE_CACHING", "sometimes");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TETHER_ALLOW_UNSAFE_CACHING", _)
        ));
        assert!(err.to_string().contains("TETHER_ALLOW_UNSAFE_CACHING"));
    }

    #[test]
    fn test_config_invalid_max_items() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("TETHER_CHANNEL_CACHE_MAX_ITEMS", "-3");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TETHER_CHANNEL_CACHE_MAX_ITEMS", _)
        ));
    }

    #[test]
    fn test_config_zero_sweep_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("TETHER_SWEEP_INTERVAL_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TETHER_SWEEP_INTERVAL_SECS", _)
        ));
    }
}
