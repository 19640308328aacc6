#![cfg(feature = "toml-config")]

mod common;

use std::io::Write;
use std::time::Duration;

use frame_bridge::config::{ENV_CALL_TIMEOUT_MS, ENV_HANDSHAKE_TIMEOUT_MS, ENV_PATH};
use frame_bridge::{ChannelConfig, ConfigError};
use serial_test::serial;

#[test]
fn missing_keys_keep_defaults() {
    let config = ChannelConfig::from_toml_str("call_timeout_ms = 1500\n").unwrap();
    assert_eq!(config.call_timeout(), Duration::from_millis(1500));
    assert_eq!(
        config.handshake_timeout_ms,
        ChannelConfig::default().handshake_timeout_ms
    );
    assert_eq!(config.path, None);
}

#[test]
fn unknown_keys_and_zero_timeouts_are_rejected() {
    assert!(matches!(
        ChannelConfig::from_toml_str("handshake_timeout = 5\n"),
        Err(ConfigError::Toml(_))
    ));
    assert!(matches!(
        ChannelConfig::from_toml_str("call_timeout_ms = 0\n"),
        Err(ConfigError::Zero {
            field: "call_timeout_ms"
        })
    ));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(
        file,
        "handshake_timeout_ms = 2500\ncall_timeout_ms = 9000\npath = \"/tools/editor\""
    )
    .unwrap();

    let config = ChannelConfig::from_file(file.path()).unwrap();
    assert_eq!(
        config,
        ChannelConfig::default()
            .with_handshake_timeout(Duration::from_millis(2500))
            .with_call_timeout(Duration::from_secs(9))
            .with_path("/tools/editor")
    );
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ChannelConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
#[serial]
fn env_overrides_win() {
    let _env = common::EnvGuard::set(&[
        (ENV_HANDSHAKE_TIMEOUT_MS, "750"),
        (ENV_CALL_TIMEOUT_MS, " 4000 "),
        (ENV_PATH, "/from/env"),
    ]);
    let config = ChannelConfig::default().with_env_overrides().unwrap();
    assert_eq!(config.handshake_timeout(), Duration::from_millis(750));
    assert_eq!(config.call_timeout(), Duration::from_secs(4));
    assert_eq!(config.path.as_deref(), Some("/from/env"));
}

#[test]
#[serial]
fn unparsable_env_value_is_reported() {
    let _env = common::EnvGuard::set(&[(ENV_CALL_TIMEOUT_MS, "soon")]);
    let err = ChannelConfig::default().with_env_overrides().unwrap_err();
    match err {
        ConfigError::InvalidEnv { var, value } => {
            assert_eq!(var, ENV_CALL_TIMEOUT_MS);
            assert_eq!(value, "soon");
        }
        other => panic!("unexpected error: {other}"),
    }
}
