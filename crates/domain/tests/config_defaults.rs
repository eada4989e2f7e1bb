use hearth_domain::config::{Config, ConfigSeverity};

#[test]
fn empty_config_is_runnable() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.supervisor.ping_interval_secs, 30);
    assert_eq!(config.supervisor.backoff_floor_secs, 2);
    assert_eq!(config.supervisor.backoff_ceiling_secs, 60);
    assert_eq!(config.requests.observe_timeout_secs, 10);
    assert_eq!(config.requests.pair_timeout_secs, 60);
    assert_eq!(config.triage.echo_window_secs, 5);
    assert!(!config
        .validate()
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error));
}

#[test]
fn explicit_sections_parse() {
    let config: Config = toml::from_str(
        r#"
[state]
dir = "/var/lib/hearth"

[adapters]
package_dirs = ["/opt/hearth/adapters", "/usr/local/share/hearth"]

[supervisor]
ping_interval_secs = 10
backoff_ceiling_secs = 120
"#,
    )
    .unwrap();
    assert_eq!(config.state.dir.to_str(), Some("/var/lib/hearth"));
    assert_eq!(config.adapters.package_dirs.len(), 2);
    assert_eq!(config.supervisor.ping_interval_secs, 10);
    assert_eq!(config.supervisor.backoff_ceiling_secs, 120);
    // Unspecified fields still default.
    assert_eq!(config.supervisor.backoff_floor_secs, 2);
}

#[test]
fn inverted_backoff_is_an_error() {
    let config: Config = toml::from_str(
        r#"
[supervisor]
backoff_floor_secs = 90
backoff_ceiling_secs = 60
"#,
    )
    .unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("ceiling")));
}
