//! Configuration loading from YAML files and environment variables.
//!
//! Tests mutate process environment, so they run serially.

use std::io::Write;

use serial_test::serial;

use eventline::config::{
    AppConfig, Config, DriverError, DriverRegistry, DriverSettings, CONFIG_ENV_VAR,
    DEFAULT_SOURCE,
};

const SAMPLE: &str = r#"
app:
  name: billing
  env: staging
  debug: true
server:
  port: 9100
messaging:
  source: urn:billing
  http:
    timeout_secs: 3
    headers:
      x-api-key: secret
  kafka:
    bootstrap_servers: kafka-1:9092,kafka-2:9092
errors:
  capacity: 8
queue:
  retry_limit: 5
drivers:
  default: primary
  connections:
    primary:
      driver: postgres
      dsn: postgres://localhost/billing
    cache:
      driver: redis
      dsn: redis://localhost
      options:
        pool_size: "4"
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn clear_env() {
    std::env::remove_var(CONFIG_ENV_VAR);
    std::env::remove_var("EVENTLINE__MESSAGING__SOURCE");
    std::env::remove_var("EVENTLINE__SERVER__PORT");
}

#[test]
#[serial]
fn test_defaults_without_sources() {
    clear_env();
    let config = Config::load(None).unwrap();

    assert_eq!(config.app.name, "eventline");
    assert_eq!(config.messaging.source, DEFAULT_SOURCE);
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.errors.capacity, 64);
}

#[test]
#[serial]
fn test_load_from_explicit_path() {
    clear_env();
    let file = write_config(SAMPLE);
    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.app.name, "billing");
    assert_eq!(config.app.env, "staging");
    assert!(config.app.debug);
    assert_eq!(config.server.port, 9100);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.messaging.source, "urn:billing");
    assert_eq!(config.messaging.http.timeout_secs, 3);
    assert_eq!(
        config.messaging.http.headers.get("x-api-key").map(String::as_str),
        Some("secret")
    );
    assert_eq!(
        config.messaging.kafka.bootstrap_servers,
        "kafka-1:9092,kafka-2:9092"
    );
    assert_eq!(config.errors.capacity, 8);
    assert_eq!(config.queue.retry_limit, 5);
    assert_eq!(config.queue.sleep_secs, 1);

    assert_eq!(config.drivers.default.as_deref(), Some("primary"));
    let cache = &config.drivers.connections["cache"];
    assert_eq!(cache.driver, "redis");
    assert_eq!(cache.options.get("pool_size").map(String::as_str), Some("4"));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = write_config(SAMPLE);
    std::env::set_var(CONFIG_ENV_VAR, file.path());
    std::env::set_var("EVENTLINE__MESSAGING__SOURCE", "urn:from-env");
    std::env::set_var("EVENTLINE__SERVER__PORT", "9999");

    let config = Config::load(None);
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.app.name, "billing");
    assert_eq!(config.messaging.source, "urn:from-env");
    assert_eq!(config.server.port, 9999);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_error() {
    clear_env();
    assert!(Config::load(Some("/nonexistent/eventline.yaml")).is_err());
}

#[tokio::test]
#[serial]
async fn test_drivers_from_file_connect() {
    clear_env();
    let file = write_config(SAMPLE);
    let config = Config::load(file.path().to_str()).unwrap();

    let mut registry: DriverRegistry<String> = DriverRegistry::new();
    for driver in ["postgres", "redis"] {
        registry.register(
            driver,
            |name: String, settings: DriverSettings, app: AppConfig| async move {
                Ok::<_, DriverError>(format!("{}@{}:{}", name, app.name, settings.dsn))
            },
        );
    }

    let store = registry
        .connect_all(&config.drivers, &config.app, false)
        .await
        .unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(
        store.default_connection().map(String::as_str),
        Some("primary@billing:postgres://localhost/billing")
    );
}
