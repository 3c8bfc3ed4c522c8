use pretty_assertions::assert_eq;
use quokka::config::{ListenerConfig, UserConfig};
use quokka::{Config, ConfigError};
use quokka_smtp::{Authenticator, Credentials, hash_password};
use std::time::Duration;

fn invalid(toml: &str) -> String {
    match Config::from_toml(toml) {
        Err(ConfigError::Invalid(reason)) => reason,
        other => panic!("expected invalid configuration, got {other:?}"),
    }
}

#[test]
fn default_config_round_trips() {
    let config = Config::default();
    let text = config.to_toml().unwrap();
    assert_eq!(Config::from_toml(&text).unwrap(), config);
}

#[test]
fn default_config_listeners() {
    let config = Config::default();
    let listeners: Vec<_> = config
        .listeners()
        .map(|(name, l)| (name, l.address.as_str()))
        .collect();
    assert_eq!(
        listeners,
        vec![
            ("smtp-relay", "0.0.0.0:25"),
            ("smtp-submission", "0.0.0.0:587"),
            ("smtp-submissions", "0.0.0.0:465"),
            ("imap", "0.0.0.0:143"),
        ]
    );
    assert_eq!(config.metrics, None);
}

#[test]
fn empty_file_disables_all_listeners() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.domain, "quokka.local");
    assert_eq!(config.max_message_size, quokka_smtp::DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(config.tls, None);
    assert_eq!(config.listeners().count(), 0);
    assert_eq!(config.queue.provider, "inmemory");
    assert!(config.auth.users.is_empty());
}

#[test]
fn parses_full_file() {
    let hash = hash_password("secret").unwrap();
    let config = Config::from_toml(&format!(
        r#"
        domain = "mail.example.org"
        max-message-size = 1048576

        [tls]
        cert = "/etc/quokka/cert.pem"
        key = "/etc/quokka/key.pem"

        [smtp-relay]
        address = "0.0.0.0:2525"

        [smtp-submissions]
        address = "[::]:465"

        [metrics]
        address = "127.0.0.1:9090"

        [queue]
        provider = "inmemory"

        [timeouts]
        command = 60
        data-block = 30

        [[auth.users]]
        username = "alice"
        password-hash = "{hash}"
        "#
    ))
    .unwrap();

    assert_eq!(config.domain, "mail.example.org");
    assert_eq!(config.smtp_relay, Some(ListenerConfig::new("0.0.0.0:2525")));
    assert_eq!(config.smtp_submission, None);
    assert_eq!(config.metrics, Some(ListenerConfig::new("127.0.0.1:9090")));
    assert_eq!(config.timeouts.data_block, 30);

    let relay = config.relay_server_config();
    assert_eq!(relay.domain, "mail.example.org");
    assert_eq!(relay.max_message_size, 1_048_576);
    assert_eq!(relay.timeouts.command, Duration::from_secs(60));
    assert!(!relay.auth_mandatory);

    let submissions = config.submissions_server_config();
    assert!(submissions.implicit_tls);
    assert!(submissions.auth_mandatory);
    assert!(config.submission_server_config().auth_mandatory);

    assert_eq!(
        config.auth.users,
        vec![UserConfig {
            username: "alice".into(),
            password_hash: hash,
        }]
    );
}

#[tokio::test]
async fn credentials_come_from_auth_users() {
    let toml = format!(
        "[[auth.users]]\nusername = \"bob\"\npassword-hash = \"{}\"\n",
        hash_password("pa55word").unwrap()
    );
    let config = Config::from_toml(&toml).unwrap();
    let credentials = config.credentials();
    assert_eq!(credentials.len(), 1);

    let ok = Credentials::from_plain(b"\0bob\0pa55word").unwrap();
    let bad = Credentials::from_plain(b"\0bob\0password").unwrap();
    assert!(credentials.authenticate(&ok).await);
    assert!(!credentials.authenticate(&bad).await);
}

#[test]
fn rejects_invalid_values() {
    assert_eq!(invalid("domain = \"  \""), "domain must not be empty");
    assert_eq!(
        invalid("max-message-size = 0"),
        "max-message-size must be greater than zero"
    );
    assert_eq!(
        invalid("[queue]\nprovider = \"redis\""),
        "unknown queue provider 'redis'"
    );
    assert_eq!(
        invalid("[smtp-submissions]\naddress = \"0.0.0.0:465\""),
        "smtp-submissions requires a [tls] section"
    );
    assert_eq!(
        invalid("[timeouts]\ncommand = 0"),
        "timeouts must be greater than zero"
    );
    assert_eq!(
        invalid("[smtp-relay]\naddress = \"\""),
        "smtp-relay address must not be empty"
    );
}

#[test]
fn rejects_bad_auth_users() {
    assert_eq!(
        invalid("[[auth.users]]\nusername = \"\"\npassword-hash = \"\""),
        "auth user with empty username"
    );
    assert_eq!(
        invalid("[[auth.users]]\nusername = \"alice\"\npassword-hash = \"secret\""),
        "password-hash of user 'alice' must be an argon2 PHC string"
    );
    assert_eq!(
        invalid(
            "[[auth.users]]\nusername = \"alice\"\n\
             password-hash = \"2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b\""
        ),
        "password-hash of user 'alice' must be an argon2 PHC string"
    );

    let hash = hash_password("x").unwrap();
    let duplicate = format!(
        "[[auth.users]]\nusername = \"alice\"\npassword-hash = \"{hash}\"\n\
         [[auth.users]]\nusername = \"alice\"\npassword-hash = \"{hash}\"\n"
    );
    assert_eq!(invalid(&duplicate), "duplicate auth user 'alice'");
}

#[test]
fn mistyped_values_are_parse_errors() {
    let err = Config::from_toml("domain = 42").unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn misspelled_sections_and_keys_are_parse_errors() {
    for toml in [
        "[smtp_relay]\naddress = \"0.0.0.0:25\"",
        "[smtp-relay]\nadress = \"0.0.0.0:25\"",
        "max_message_size = 1024",
        "[timeouts]\ndata_block = 30",
        "[[auth.users]]\nusername = \"alice\"\npassword-sha256 = \"x\"",
    ] {
        match Config::from_toml(toml) {
            Err(ConfigError::Parse { source, .. }) => {
                assert!(source.to_string().contains("unknown field"), "{toml}: {source}");
            }
            other => panic!("{toml}: expected parse error, got {other:?}"),
        }
    }
}

#[test]
fn load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err.to_string().contains("missing.toml"));
}

#[test]
fn load_reports_parse_errors_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[smtp-relay\naddress = ").unwrap();

    match Config::load(&path) {
        Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn write_to_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    Config::default().write_to(&path, false).unwrap();
    assert_eq!(Config::load(&path).unwrap(), Config::default());

    let err = Config::default().write_to(&path, false).unwrap_err();
    assert!(matches!(err, ConfigError::AlreadyExists(_)));

    let mut changed = Config::default();
    changed.domain = "changed.example.org".into();
    changed.write_to(&path, true).unwrap();
    assert_eq!(Config::load(&path).unwrap().domain, "changed.example.org");
}

#[cfg(unix)]
#[test]
fn written_config_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    Config::default().write_to(&path, false).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
