//! Rule store files and rules supplied through configuration

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use iface_router::config::{apply_env_overrides, load_config_str};
use iface_router::rules::{InlineSource, JsonFileSource, Rule, RuleKind, RuleSet, RuleStore};
use iface_router::RuleError;
use tempfile::tempdir;

fn store_at(path: Option<std::path::PathBuf>) -> RuleStore {
    RuleStore::new(Arc::new(RuleSet::new()), path)
}

#[test]
fn test_saved_rules_reload_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rules.json");

    let store = store_at(Some(path.clone()));
    store
        .add(Rule::with_id("office", RuleKind::Cidr, "172.16.0.0/12", "eth0").unwrap())
        .unwrap();
    store
        .add(
            Rule::with_id("stream", RuleKind::Host, "*.video.example", "wlan0")
                .unwrap()
                .with_comment("keep off the wired link"),
        )
        .unwrap();
    store.save().unwrap();

    let restored = store_at(Some(path));
    assert!(restored.load().unwrap().is_empty());
    let ids: Vec<String> = restored.rules().iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, ["office", "stream"]);
    assert_eq!(
        restored.rule_with_id("stream").unwrap().comment(),
        Some("keep off the wired link")
    );

    let hit = restored
        .engine()
        .match_destination(None, Some("cdn.video.example"))
        .unwrap();
    assert_eq!(hit.interface(), Some("wlan0"));
}

#[test]
fn test_malformed_file_leaves_rules_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{"ruleId": "not-an-array"}"#).unwrap();

    let store = store_at(None);
    store
        .add(Rule::with_id("keep", RuleKind::Cidr, "10.0.0.0/8", "eth0").unwrap())
        .unwrap();
    let version = store.engine().version();

    let err = store.import_from(&path).unwrap_err();
    assert!(matches!(err, RuleError::Parse(_)));
    assert_eq!(store.len(), 1);
    assert_eq!(store.engine().version(), version);

    let missing = store.import_from(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(missing, RuleError::Storage { .. }));
    assert_eq!(store.rules()[0].id(), "keep");
}

#[test]
fn test_import_skips_bad_records_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mixed.json");
    std::fs::write(
        &path,
        r#"[
            {"ruleId": "good", "type": 0, "pattern": "192.168.0.0/16", "interfaceName": "eth0"},
            {"ruleId": "bad-cidr", "type": 0, "pattern": "192.168.0.0/40", "interfaceName": "eth0"},
            {"ruleId": "good", "type": 1, "pattern": "dup.example", "interfaceName": "eth0"}
        ]"#,
    )
    .unwrap();

    let store = store_at(None);
    let dropped = store.import_from(&path).unwrap();
    assert_eq!(store.len(), 1);
    let indexes: Vec<usize> = dropped.iter().map(|d| d.index).collect();
    assert_eq!(indexes, [1, 2]);
}

#[test]
fn test_engine_sources_agree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("source.json");
    let records = serde_json::json!([
        {"ruleId": "a", "type": 0, "pattern": "100.64.0.0/10", "interfaceName": "tun0"},
        {"ruleId": "b", "type": 1, "pattern": "Printer.Local.", "interfaceName": "eth0"}
    ]);
    std::fs::write(&path, records.to_string()).unwrap();

    let from_file = RuleSet::new();
    from_file.load(&JsonFileSource::new(&path)).unwrap();
    let inline = RuleSet::new();
    let serde_json::Value::Array(values) = records else {
        unreachable!()
    };
    inline.load(&InlineSource::new(values)).unwrap();

    let ip: IpAddr = "100.100.1.1".parse().unwrap();
    for rules in [&from_file, &inline] {
        assert_eq!(rules.match_cidr(ip).unwrap().rule_id, "a");
        assert_eq!(rules.match_host("printer.local").unwrap().rule_id, "b");
    }

    let unreadable = RuleSet::new();
    assert!(unreadable
        .load(&JsonFileSource::new(dir.path().join("nope.json")))
        .is_err());
    assert_eq!(unreadable.version(), 0);
}

#[test]
fn test_config_inline_rules_and_env_overrides() {
    let mut config = load_config_str(
        r#"{
            "rules": {
                "inline": [
                    {"ruleId": "lab", "type": 0, "pattern": "10.10.0.0/16", "interfaceName": "eth1"},
                    {"ruleId": "lab-dns", "type": 1, "pattern": "*.lab.example"}
                ]
            }
        }"#,
    )
    .unwrap();
    assert!(config.rules.store_path.is_none());

    let store = store_at(None);
    let dropped = store.replace_with_values(config.rules.inline.clone());
    assert!(dropped.is_empty());
    let hit = store
        .engine()
        .match_destination(None, Some("ci.lab.example"))
        .unwrap();
    assert_eq!(hit.interface(), None);

    let env: HashMap<&str, &str> = [
        ("IFACE_ROUTER_RULES_PATH", "/var/lib/iface-router/rules.json"),
        ("IFACE_ROUTER_MAX_FLOWS", "64"),
    ]
    .into_iter()
    .collect();
    apply_env_overrides(&mut config, |name| env.get(name).map(|v| (*v).to_string())).unwrap();
    assert_eq!(config.flow.max_flows, 64);
    assert_eq!(
        config.rules.store_path.as_deref(),
        Some(std::path::Path::new("/var/lib/iface-router/rules.json"))
    );

    let bad: HashMap<&str, &str> = [("IFACE_ROUTER_MAX_FLOWS", "lots")].into_iter().collect();
    assert!(apply_env_overrides(&mut config, |name| bad.get(name).map(|v| (*v).to_string())).is_err());
}
