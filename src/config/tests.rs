//! Config module tests

use std::io::Write;

use tempfile::NamedTempFile;

use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("PUBGATE_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${PUBGATE_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("PUBGATE_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("PUBGATE_TEST_VAR_UNSET");
    let result = substitute_env_vars("url = \"${PUBGATE_TEST_VAR_UNSET:-mqtt://fallback}\"");
    assert_eq!(result, "url = \"mqtt://fallback\"");

    // Set var should use env value
    std::env::set_var("PUBGATE_TEST_VAR_SET", "mqtt://env");
    let result = substitute_env_vars("url = \"${PUBGATE_TEST_VAR_SET:-mqtt://fallback}\"");
    assert_eq!(result, "url = \"mqtt://env\"");
    std::env::remove_var("PUBGATE_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("PUBGATE_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${PUBGATE_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.server.bind, "0.0.0.0:8080".parse().unwrap());
    assert_eq!(config.server.request_timeout, Duration::from_secs(60));
    assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(config.broker.url, "mqtt://localhost:1883");
    assert_eq!(config.broker.client_name, "publisher");
    assert_eq!(config.broker.protocol, ProtocolVersion::V5);
    assert_eq!(config.broker.qos, 0);
    assert_eq!(config.broker.max_inflight, 32);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse(
        r#"
[broker]
url = "mqtt://broker.internal:1884"
"#,
    )
    .unwrap();
    assert_eq!(config.broker.url, "mqtt://broker.internal:1884");
    assert_eq!(config.broker.client_name, "publisher");
    assert_eq!(config.server.bind, "0.0.0.0:8080".parse().unwrap());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:9000"
request_timeout = "5s"
shutdown_timeout = "500ms"

[broker]
url = "tcp://10.0.0.5:1883"
client_name = "edge-publisher"
protocol = "v311"
keep_alive = 30
connect_timeout = "2s"
qos = 1
max_inflight = 8
reconnect_attempts = 5
reconnect_interval = "200ms"
max_reconnect_interval = "5s"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind, "127.0.0.1:9000".parse().unwrap());
    assert_eq!(config.server.request_timeout, Duration::from_secs(5));
    assert_eq!(config.server.shutdown_timeout, Duration::from_millis(500));
    assert_eq!(config.broker.protocol, ProtocolVersion::V311);

    let client = config.broker.client_config();
    assert_eq!(client.keep_alive, 30);
    assert_eq!(client.connect_timeout, Duration::from_secs(2));
    assert_eq!(client.qos, QoS::AtLeastOnce);
    assert_eq!(client.max_inflight, 8);
    assert_eq!(client.reconnect_attempts, 5);
    assert_eq!(client.reconnect_interval, Duration::from_millis(200));
    assert_eq!(client.max_reconnect_interval, Duration::from_secs(5));

    let pool = config.broker.pool_config();
    assert_eq!(pool.url, "tcp://10.0.0.5:1883");
    assert_eq!(pool.client_name, "edge-publisher");
}

#[test]
fn test_invalid_qos() {
    let result = Config::parse("[broker]\nqos = 2\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_max_inflight() {
    let result = Config::parse("[broker]\nmax_inflight = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_empty_client_name() {
    let result = Config::parse("[broker]\nclient_name = \"  \"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_unsupported_broker_scheme() {
    let err = Config::parse("[broker]\nurl = \"mqtts://broker:8883\"\n").unwrap_err();
    assert!(err.to_string().contains("unsupported scheme"), "{}", err);
}

#[test]
fn test_zero_request_timeout() {
    let result = Config::parse("[server]\nrequest_timeout = \"0s\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_reconnect_interval_bounds() {
    let result = Config::parse(
        "[broker]\nreconnect_interval = \"10s\"\nmax_reconnect_interval = \"1s\"\n",
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_unknown_protocol_is_a_parse_error() {
    let result = Config::parse("[broker]\nprotocol = \"v4\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let config = Config::load_with("/nonexistent/pubgate.toml", no_env).unwrap();
    assert_eq!(config.broker.client_name, "publisher");
    assert_eq!(config.server.request_timeout, Duration::from_secs(60));
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("PUBGATE_TEST_BROKER_HOST", "broker.test");

    let file = write_config(
        r#"
[server]
bind = "127.0.0.1:${PUBGATE_TEST_HTTP_PORT:-8181}"
request_timeout = "15s"

[broker]
url = "mqtt://${PUBGATE_TEST_BROKER_HOST}:1883"
"#,
    );
    let config = Config::load_with(file.path(), no_env).unwrap();

    assert_eq!(config.server.bind, "127.0.0.1:8181".parse().unwrap());
    assert_eq!(config.server.request_timeout, Duration::from_secs(15));
    assert_eq!(config.broker.url, "mqtt://broker.test:1883");

    std::env::remove_var("PUBGATE_TEST_BROKER_HOST");
}

#[test]
fn test_load_env_override() {
    std::env::set_var("PUBGATE__BROKER__RECONNECT_ATTEMPTS", "9");

    let file = write_config("[broker]\nreconnect_attempts = 2\n");
    let config = Config::load_with(file.path(), no_env).unwrap();
    assert_eq!(config.broker.reconnect_attempts, 9);

    std::env::remove_var("PUBGATE__BROKER__RECONNECT_ATTEMPTS");
}

#[test]
fn test_flat_env_vars_win() {
    let file = write_config(
        r#"
[log]
level = "warn"

[server]
bind = "127.0.0.1:8080"

[broker]
url = "mqtt://from-file:1883"
client_name = "from-file"
"#,
    );

    let config = Config::load_with(file.path(), |name| match name {
        "PORT" => Some("9999".to_string()),
        "BROKER_URL" => Some("mqtt://from-env:1883".to_string()),
        "NAME" => Some("from-env".to_string()),
        "DEBUG" => Some("true".to_string()),
        _ => None,
    })
    .unwrap();

    assert_eq!(config.server.bind, "0.0.0.0:9999".parse().unwrap());
    assert_eq!(config.broker.url, "mqtt://from-env:1883");
    assert_eq!(config.broker.client_name, "from-env");
    assert_eq!(config.log.level, "debug");
}

#[test]
fn test_debug_false_keeps_level() {
    let file = write_config("[log]\nlevel = \"warn\"\n");
    let config = Config::load_with(file.path(), |name| {
        (name == "DEBUG").then(|| "false".to_string())
    })
    .unwrap();
    assert_eq!(config.log.level, "warn");
}

#[test]
fn test_invalid_port_env() {
    let result = Config::load_with("", |name| {
        (name == "PORT").then(|| "http".to_string())
    });
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}
