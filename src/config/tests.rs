use serial_test::serial;

use super::*;
use crate::config::users::{decrypt_password, encrypt_password};

const MINIMAL: &str = r#"
[general]
host = "127.0.0.1"
port = 6432
max_connections = 8
pipeline = "transaction"

[[servers]]
name = "primary"
host = "10.0.0.1"
port = 5432
primary = true

[[servers]]
name = "standby"
host = "10.0.0.2"
"#;

#[test]
fn minimal_config_parses() {
    let config: Config = toml::from_str(MINIMAL).unwrap();

    assert_eq!(config.general.host, "127.0.0.1");
    assert_eq!(config.general.port, 6432);
    assert_eq!(config.general.max_connections, 8);
    assert_eq!(config.general.pipeline, Pipeline::Transaction);

    assert_eq!(config.servers.len(), 2);
    assert!(config.servers[0].primary);
    assert!(!config.servers[1].primary);
    assert_eq!(config.servers[1].port, 5432);

    config.validate().unwrap();
}

#[test]
fn defaults_are_sane() {
    let general = General::default();
    assert_eq!(general.pipeline, Pipeline::Session);
    assert_eq!(general.validation, Validation::Off);
    assert_eq!(general.blocking_timeout, 0);
    assert_eq!(general.max_retries, 5);
    assert!(!general.failover);
}

#[test]
fn two_primaries_are_rejected() {
    let mut config: Config = toml::from_str(MINIMAL).unwrap();
    config.servers[1].primary = true;
    assert!(config.validate().is_err());
}

#[test]
fn no_servers_is_rejected() {
    let mut config: Config = toml::from_str(MINIMAL).unwrap();
    config.servers.clear();
    assert!(config.validate().is_err());
}

#[test]
fn duplicate_server_names_are_rejected() {
    let mut config: Config = toml::from_str(MINIMAL).unwrap();
    config.servers[1].name = "primary".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn failover_requires_a_script() {
    let mut config: Config = toml::from_str(MINIMAL).unwrap();
    config.general.failover = true;
    assert!(config.validate().is_err());

    config.general.failover_script = Some("/usr/bin/true".to_string());
    config.validate().unwrap();
}

#[test]
fn tls_material_must_come_in_pairs() {
    let mut config: Config = toml::from_str(MINIMAL).unwrap();
    config.general.tls_certificate = Some("/tmp/cert.pem".to_string());
    assert!(config.validate().is_err());
}

#[test]
fn limits_file_parses() {
    let limits = parse_limits_file(
        "# comment\n\
         mydb alice 10 5 2\n\
         all  all   20\n\
         \n\
         otherdb bob 4 1\n",
    )
    .unwrap();

    assert_eq!(limits.len(), 3);
    assert_eq!(limits[0].database, "mydb");
    assert_eq!(limits[0].username, "alice");
    assert_eq!(limits[0].max_size, 10);
    assert_eq!(limits[0].initial_size, 5);
    assert_eq!(limits[0].min_size, 2);

    assert_eq!(limits[1].max_size, 20);
    assert_eq!(limits[1].initial_size, 0);

    assert_eq!(limits[2].initial_size, 1);
    assert_eq!(limits[2].min_size, 0);
}

#[test]
fn limits_file_rejects_garbage() {
    assert!(parse_limits_file("mydb alice\n").is_err());
    assert!(parse_limits_file("mydb alice ten\n").is_err());
    assert!(parse_limits_file("mydb alice 1 2 3 4\n").is_err());
}

#[test]
fn limits_validate_sizes() {
    let limits = parse_limits_file("mydb alice 2 5\n").unwrap();
    assert!(limits[0].validate().is_err());

    let limits = parse_limits_file("mydb alice 0\n").unwrap();
    assert!(limits[0].validate().is_err());
}

#[test]
fn password_encryption_roundtrip() {
    let master_key = b"0123456789abcdef0123456789abcdef";

    let encoded = encrypt_password("s3cret/pa55", master_key).unwrap();
    assert_ne!(encoded, "s3cret/pa55");
    assert_eq!(decrypt_password(&encoded, master_key).unwrap(), "s3cret/pa55");

    // A different master key must not decrypt it.
    let other_key = b"ffffffffffffffffffffffffffffffff";
    assert!(decrypt_password(&encoded, other_key).is_err());
}

#[test]
fn users_file_parses() {
    let master_key = b"0123456789abcdef0123456789abcdef";
    let alice = encrypt_password("wonderland", master_key).unwrap();
    let bob = encrypt_password("builder", master_key).unwrap();

    let users = parse_users_file(
        &format!("# users\nalice:{alice}\nbob:{bob}\n"),
        master_key,
    )
    .unwrap();

    assert_eq!(users.len(), 2);
    assert_eq!(users[0].username, "alice");
    assert_eq!(users[0].password, "wonderland");
    assert_eq!(users[1].username, "bob");
    assert_eq!(users[1].password, "builder");
}

#[test]
fn users_file_rejects_missing_separator() {
    let master_key = b"0123456789abcdef0123456789abcdef";
    assert!(parse_users_file("alice\n", master_key).is_err());
}

#[tokio::test]
#[serial]
async fn parse_installs_config_globally() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pg_warden.toml");
    std::fs::write(&path, MINIMAL).unwrap();

    parse(path.to_str().unwrap()).await.unwrap();

    let config = get_config();
    assert_eq!(config.general.port, 6432);
    assert_eq!(config.path, path.to_str().unwrap());
}
