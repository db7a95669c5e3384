//! Tests for configuration parsing and validation.

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn create_temp_config() -> NamedTempFile {
    let config_content = r#"
[server]
host = "127.0.0.1"
port = 3307
command_timeout = 15000

[postgres]
host = "localhost"
port = 5432
database = "appdb"
user = "aproxy"
password = "secret"
max_pool_size = 4
connection_mode = "transaction"

[schema_cache]
ttl = 5000

[sql_rewrite]
debug_sql = true

[observability]
log_level = "debug"
log_format = "json"
metrics_port = 9200
"#;
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[tokio::test]
#[serial_test::serial]
async fn test_load_config() {
    let file = create_temp_config();
    let config = load_config(file.path().to_str().unwrap()).await.unwrap();

    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3307);
    assert_eq!(config.server.command_timeout, 15_000);
    assert_eq!(config.postgres.database, "appdb");
    assert_eq!(config.postgres.max_pool_size, 4);
    assert_eq!(config.postgres.connection_mode, ConnectionMode::Transaction);
    assert_eq!(config.schema_cache.ttl, 5_000);
    assert!(config.sql_rewrite.debug_sql);
    assert_eq!(config.observability.log_format, "json");
    assert_eq!(config.observability.metrics_port, 9200);

    // The loaded config became the global one.
    assert_eq!(get_config().postgres.database, "appdb");
}

#[test]
fn test_defaults() {
    let config = parse_config(
        r#"
[postgres]
database = "appdb"
user = "aproxy"
"#,
    )
    .unwrap();

    assert_eq!(config.server.port, 3306);
    assert!(config.server.version.starts_with("8.0."));
    assert_eq!(config.postgres.connection_mode, ConnectionMode::Session);
    assert_eq!(config.postgres.max_pool_size, 20);
    assert!(config.schema_cache.enabled);
    assert!(config.sql_rewrite.enabled);
    assert!(config.observability.redact_parameters);
}

#[test]
fn test_missing_database_rejected() {
    let err = parse_config("[postgres]\nuser = \"u\"\n").unwrap_err();
    assert!(err.to_string().contains("postgres.database"));
}

#[test]
fn test_bad_connection_mode_rejected() {
    let err = parse_config(
        r#"
[postgres]
database = "d"
user = "u"
connection_mode = "sticky"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("TOML parse error"));
}

#[test]
fn test_bad_sslmode_rejected() {
    let err = parse_config(
        r#"
[postgres]
database = "d"
user = "u"
sslmode = "allow"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("sslmode"));
}
