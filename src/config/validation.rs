use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_rate_limiter(config)?;
    validate_health_check(config)?;
    validate_billing(config)?;
    validate_file_cleanup(config)?;
    validate_seed(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(thread_stack_size_kb) = server.runtime_thread_stack_size_kb {
        if thread_stack_size_kb == 0 {
            return Err(validation_err(
                "server.runtime_thread_stack_size_kb must be greater than 0 when set",
            ));
        }
    }
    if let Some(listener_count) = server.tcp_reuse_port_listener_count {
        if listener_count == 0 {
            return Err(validation_err(
                "server.tcp_reuse_port_listener_count must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_rate_limiter(config: &AppConfig) -> Result<(), ConfigError> {
    let limiter = &config.rate_limiter;
    if limiter.rpm_window_secs == 0 {
        return Err(validation_err("rate_limiter.rpm_window_secs must be greater than 0"));
    }
    if limiter.tpm_window_secs == 0 {
        return Err(validation_err("rate_limiter.tpm_window_secs must be greater than 0"));
    }
    Ok(())
}

fn validate_health_check(config: &AppConfig) -> Result<(), ConfigError> {
    let health = &config.health_check;
    if health.interval_secs == 0 {
        return Err(validation_err("health_check.interval_secs must be greater than 0"));
    }
    if health.threshold == 0 {
        return Err(validation_err("health_check.threshold must be greater than 0"));
    }
    Ok(())
}

fn validate_billing(config: &AppConfig) -> Result<(), ConfigError> {
    let billing = &config.billing;
    if billing.sweep_interval_secs == 0 {
        return Err(validation_err("billing.sweep_interval_secs must be greater than 0"));
    }
    if billing.usage_queue_max_len == 0 {
        return Err(validation_err("billing.usage_queue_max_len must be greater than 0"));
    }
    if billing.error_queue_max_len == 0 {
        return Err(validation_err("billing.error_queue_max_len must be greater than 0"));
    }
    Ok(())
}

fn validate_file_cleanup(config: &AppConfig) -> Result<(), ConfigError> {
    let cleanup = &config.file_cleanup;
    if cleanup.interval_secs == 0 {
        return Err(validation_err("file_cleanup.interval_secs must be greater than 0"));
    }
    Ok(())
}

fn validate_seed(config: &AppConfig) -> Result<(), ConfigError> {
    let mut model_ids = HashSet::new();
    for model in &config.seed.models {
        if model.name.trim().is_empty() {
            return Err(validation_err("seed.models entry has an empty name"));
        }
        if !model_ids.insert(model.id) {
            return Err(validation_err(format!("seed.models duplicate model id {}", model.id)));
        }
    }

    let mut channel_ids = HashSet::new();
    for channel in &config.seed.channels {
        if !channel.upstream_url.starts_with("http://") && !channel.upstream_url.starts_with("https://")
        {
            return Err(validation_err(format!(
                "seed.channels '{}': upstream_url must start with http:// or https://",
                channel.name
            )));
        }
        if !channel_ids.insert(channel.id) {
            return Err(validation_err(format!(
                "seed.channels duplicate channel id {}",
                channel.id
            )));
        }
        for model_id in &channel.model_ids {
            if !model_ids.contains(model_id) {
                return Err(validation_err(format!(
                    "seed.channels '{}' references unknown model id {model_id}",
                    channel.name
                )));
            }
        }
    }

    let mut key_ids = HashSet::new();
    for key in &config.seed.api_keys {
        if key.id.trim().is_empty() {
            return Err(validation_err("seed.api_keys entry has an empty id"));
        }
        if !key_ids.insert(key.id.clone()) {
            return Err(validation_err(format!("seed.api_keys duplicate id '{}'", key.id)));
        }
    }

    Ok(())
}
