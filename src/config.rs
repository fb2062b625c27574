use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default = "default_docker_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    pub label_selector: Option<String>,
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_docker_endpoint() -> String {
    "http://127.0.0.1:2375".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_docker_endpoint(),
            ca_certificate_paths: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.channel_capacity == 0 {
        anyhow::bail!("channelCapacity must be greater than zero");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("FRESHPOD_TEST_VAR", "value123");
        }
        let input = "This is a test: ${FRESHPOD_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("FRESHPOD_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${FRESHPOD_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: FRESHPOD_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        unsafe {
            env::set_var("FRESHPOD_VAR1", "foo");
            env::set_var("FRESHPOD_VAR2", "bar");
        }
        let input = "${FRESHPOD_VAR1} and ${FRESHPOD_VAR2}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("FRESHPOD_VAR1");
            env::remove_var("FRESHPOD_VAR2");
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("FRESHPOD_DOCKER_HOST", "docker-proxy.kube-freshpod.svc");
        }
        let yaml_content = r#"
        webserver:
          port: 9090
        docker:
          endpoint: http://${FRESHPOD_DOCKER_HOST}:2375
          caCertificatePaths:
            - /etc/ssl/docker/ca.pem
        watch:
          labelSelector: kube-freshpod/enabled=true
          excludeNamespaces:
            - kube-*
        logging:
          level: debug
          json: true
        channelCapacity: 64
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.webserver.port, 9090);
        assert_eq!(
            config.docker.endpoint,
            "http://docker-proxy.kube-freshpod.svc:2375"
        );
        assert_eq!(
            config.docker.ca_certificate_paths,
            vec![PathBuf::from("/etc/ssl/docker/ca.pem")]
        );
        assert_eq!(
            config.watch.label_selector.as_deref(),
            Some("kube-freshpod/enabled=true")
        );
        assert_eq!(config.watch.exclude_namespaces, vec!["kube-*".to_string()]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.channel_capacity, 64);
        unsafe {
            env::remove_var("FRESHPOD_DOCKER_HOST");
        }
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "{}").expect("Failed to write to temp file");

        let config = load_config(tmp_file.path()).expect("Should load config");

        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.docker.endpoint, "http://127.0.0.1:2375");
        assert!(config.docker.ca_certificate_paths.is_empty());
        assert!(config.watch.label_selector.is_none());
        assert!(config.watch.exclude_namespaces.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_load_config_rejects_zero_capacity() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "channelCapacity: 0").expect("Failed to write to temp file");

        assert!(load_config(tmp_file.path()).is_err());
    }
}
