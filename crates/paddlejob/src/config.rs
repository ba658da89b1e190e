//! Controller configuration
//!
//! Loaded from a YAML file mounted from a `ConfigMap`. Every field has a
//! default so a partial (or missing) file still yields a usable config.

use crate::lifecycle::LifecycleSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Job registry and dispatch loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Period of the registry re-scan tick
    #[serde(default = "default_tick_interval", rename = "tickIntervalSeconds")]
    pub tick_interval_seconds: u64,

    /// Capacity of the watch-to-dispatcher channel
    #[serde(default = "default_dispatcher_capacity", rename = "eventCapacity")]
    pub event_capacity: usize,
}

/// Per-job lifecycle manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Readiness polls per creation, and pod-drain polls per release
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: u32,

    #[serde(default = "default_poll_interval", rename = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,

    /// Period of trainer status evaluation while running
    #[serde(default = "default_status_interval", rename = "statusIntervalSeconds")]
    pub status_interval_seconds: u64,

    #[serde(default = "default_manager_capacity", rename = "eventCapacity")]
    pub event_capacity: usize,

    /// Longest wait for room in a manager's event channel
    #[serde(default = "default_send_timeout", rename = "eventSendTimeoutSeconds")]
    pub event_send_timeout_seconds: u64,
}

fn default_tick_interval() -> u64 {
    5
}

fn default_dispatcher_capacity() -> usize {
    256
}

fn default_max_retries() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_status_interval() -> u64 {
    10
}

fn default_manager_capacity() -> usize {
    1000
}

fn default_send_timeout() -> u64 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval(),
            event_capacity: default_dispatcher_capacity(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            poll_interval_seconds: default_poll_interval(),
            status_interval_seconds: default_status_interval(),
            event_capacity: default_manager_capacity(),
            event_send_timeout_seconds: default_send_timeout(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_retries: self.max_retries,
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            status_interval: Duration::from_secs(self.status_interval_seconds),
            event_capacity: self.event_capacity,
            event_send_timeout: Duration::from_secs(self.event_send_timeout_seconds),
        }
    }
}

impl ControllerConfig {
    /// Reject values that would stall or spin the control loops
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.dispatcher.tick_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "dispatcher.tickIntervalSeconds must be greater than zero"
            ));
        }
        if self.dispatcher.event_capacity == 0 || self.lifecycle.event_capacity == 0 {
            return Err(anyhow::anyhow!("eventCapacity must be greater than zero"));
        }
        if self.lifecycle.max_retries == 0 {
            return Err(anyhow::anyhow!("lifecycle.maxRetries must be at least 1"));
        }
        if self.lifecycle.status_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "lifecycle.statusIntervalSeconds must be greater than zero"
            ));
        }
        if let Some(namespace) = &self.namespace {
            if namespace.trim().is_empty() {
                return Err(anyhow::anyhow!("namespace must not be blank when set"));
            }
        }
        Ok(())
    }

    /// Load configuration from a mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
