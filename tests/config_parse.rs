use complaint_relay::config::Config;

#[test]
fn parse_example_config() {
    let raw = include_str!("../complaint-relay.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    cfg.validate().expect("example config is valid");
    assert_eq!(cfg.remote.collection, "complaints");
    assert!(cfg.remote.timeout_ms > 0);
    assert!(!cfg.queue.path.is_empty());
    assert_eq!(cfg.capture.min_title_chars, 3);
    assert_eq!(cfg.capture.min_description_chars, 10);
}

#[test]
fn missing_sections_fall_back_to_defaults() {
    let cfg: Config = toml::from_str("[remote]\nbase_url = \"https://store.example\"\ncollection = \"complaints\"\npath_suffix = \".json\"\ntimeout_ms = 500\nuser_agent = \"t\"\n")
        .expect("parse TOML");
    assert_eq!(cfg.remote.path_suffix, ".json");
    assert!(cfg.queue.fsync);
    assert!(cfg.connectivity.drain_on_start);
    assert_eq!(cfg.logging.level, "info");
}

#[test]
fn zero_timeout_is_invalid() {
    let mut cfg = Config::default();
    cfg.remote.timeout_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn capture_thresholds_cannot_drop_below_floors() {
    let mut cfg = Config::default();
    cfg.capture.min_description_chars = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.capture.min_title_chars = 2;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.capture.min_title_chars = 5;
    cfg.capture.min_description_chars = 40;
    assert!(cfg.validate().is_ok());
}
