// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! Connection, retry and consumer options for the delivery subsystem.
//! Values are read from optional configuration files and from environment
//! variables (`RABBITMQ_HOST`, `RABBITMQ_MAX_RETRY_ATTEMPTS`, ...), falling
//! back to the defaults of [`RabbitMQConfigs::default`].

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tracing::error;

/// Default prefix of the environment variables read by [`ConfigLoader`]
pub const DEFAULT_ENV_PREFIX: &str = "RABBITMQ";

/// Options recognized by the delivery subsystem.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for the connection, also used as the
    /// consumer tag prefix.
    pub connection_name: String,
    /// Number of retries after the first failed attempt.
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub connection_timeout_ms: u64,
    pub network_recovery_interval_ms: u64,
    pub publish_timeout_ms: u64,
    /// Bound on declare, bind, consume and cancel calls.
    pub operation_timeout_ms: u64,
    pub prefetch_count: u16,
    pub enable_dead_letter_queue: bool,
    pub publisher_confirms: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "amqp-delivery".to_owned(),
            max_retry_attempts: 3,
            retry_delay_ms: 5_000,
            connection_timeout_ms: 30_000,
            network_recovery_interval_ms: 5_000,
            publish_timeout_ms: 10_000,
            operation_timeout_ms: 10_000,
            prefetch_count: 1,
            enable_dead_letter_queue: true,
            publisher_confirms: true,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configuration from the `RABBITMQ_*` environment variables.
    pub fn load() -> Result<Self, AmqpError> {
        ConfigLoader::new().load()
    }

    /// Broker address for `lapin::Connection::connect_uri`. Credentials and
    /// the virtual host are carried verbatim, never parsed back from text.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn network_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.network_recovery_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Rejects values the subsystem cannot operate with.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.trim().is_empty() {
            return Err(AmqpError::InvalidConfig("host must not be empty".to_owned()));
        }

        if self.port == 0 {
            return Err(AmqpError::InvalidConfig("port must not be zero".to_owned()));
        }

        if self.prefetch_count == 0 {
            return Err(AmqpError::InvalidConfig(
                "prefetch_count must be at least 1".to_owned(),
            ));
        }

        if self.connection_timeout_ms == 0
            || self.publish_timeout_ms == 0
            || self.operation_timeout_ms == 0
        {
            return Err(AmqpError::InvalidConfig(
                "timeouts must not be zero".to_owned(),
            ));
        }

        if self.network_recovery_interval_ms == 0 {
            return Err(AmqpError::InvalidConfig(
                "network_recovery_interval_ms must not be zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Configuration loader combining files and environment variables.
pub struct ConfigLoader {
    env_prefix: String,
    files: Vec<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: DEFAULT_ENV_PREFIX.to_owned(),
            files: Vec::new(),
        }
    }

    /// Adds a configuration file. Later files override earlier ones.
    pub fn with_file(mut self, path: &str) -> Self {
        self.files.push(path.to_owned());
        self
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_owned();
        self
    }

    /// Reads every source, deserializes and validates the result.
    pub fn load(self) -> Result<RabbitMQConfigs, AmqpError> {
        let mut builder = Config::builder();

        for file_path in &self.files {
            if !Path::new(file_path).exists() {
                error!(file = file_path, "configuration file not found");
                return Err(AmqpError::InvalidConfig(format!(
                    "configuration file not found: {}",
                    file_path
                )));
            }
            builder = builder.add_source(File::with_name(file_path));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let cfg: RabbitMQConfigs = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read configuration");
                AmqpError::InvalidConfig(err.to_string())
            })?;

        cfg.validate()?;

        Ok(cfg)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
