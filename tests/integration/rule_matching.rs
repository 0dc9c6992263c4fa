//! Rule matching through the public engine API

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use iface_router::events::{ChangeKind, EventBus, RouterEvent};
use iface_router::rules::{Rule, RuleKind, RuleSet};
use serde_json::json;

fn ip(a: u8, b: u8, c: u8, d: u8) -> Option<IpAddr> {
    Some(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

#[test]
fn test_first_match_wins_across_kinds() {
    let rules = RuleSet::new();
    rules.load_values(vec![
        json!({"ruleId": "host", "type": 1, "pattern": "*.lan.example", "interfaceName": "wlan0"}),
        json!({"ruleId": "cidr", "type": 0, "pattern": "10.0.0.0/8", "interfaceName": "eth0"}),
    ]);

    // Both facets match; the host rule comes first
    let hit = rules
        .match_destination(ip(10, 1, 1, 1), Some("nas.lan.example"))
        .unwrap();
    assert_eq!(hit.rule_id, "host");

    // Without a hostname only the CIDR rule can match
    let hit = rules.match_destination(ip(10, 1, 1, 1), None).unwrap();
    assert_eq!(hit.rule_id, "cidr");

    assert!(rules.match_destination(ip(192, 0, 2, 1), Some("other.example")).is_none());
}

#[test]
fn test_priority_then_position() {
    let rules = RuleSet::new();
    rules.load_values(vec![
        json!({"ruleId": "late", "type": 0, "pattern": "10.0.0.0/8", "interfaceName": "eth0", "priority": 5}),
        json!({"ruleId": "early", "type": 0, "pattern": "10.1.0.0/16", "interfaceName": "eth1", "priority": 1}),
        json!({"ruleId": "tie", "type": 0, "pattern": "10.1.2.0/24", "interfaceName": "eth2", "priority": 1}),
    ]);

    let ids: Vec<String> = rules
        .snapshot()
        .rules()
        .iter()
        .map(|r| r.id().to_string())
        .collect();
    assert_eq!(ids, ["early", "tie", "late"]);

    let hit = rules.match_destination(ip(10, 1, 2, 3), None).unwrap();
    assert_eq!(hit.rule_id, "early");
}

#[test]
fn test_ipv6_never_matches_cidr() {
    let rules = RuleSet::new();
    rules.publish(
        vec![Rule::with_id("all", RuleKind::Cidr, "0.0.0.0/0", "eth0").unwrap()],
        ChangeKind::Reload,
    );

    let v6: IpAddr = "2001:db8::1".parse().unwrap();
    assert!(rules.match_cidr(v6).is_none());
    assert!(rules.match_destination(Some(v6), None).is_none());
    assert!(rules.match_cidr("203.0.113.9".parse().unwrap()).is_some());
}

#[test]
fn test_reload_publishes_event() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let rules = RuleSet::with_event_bus(events);

    let report = rules.load_values(vec![
        json!({"ruleId": "a", "type": 0, "pattern": "10.0.0.0/8", "interfaceName": "eth0"}),
        json!({"ruleId": "a", "type": 0, "pattern": "11.0.0.0/8", "interfaceName": "eth0"}),
        json!("not a record"),
    ]);
    assert_eq!(report.loaded, 1);
    assert_eq!(report.dropped.len(), 2);

    match rx.try_recv().unwrap() {
        RouterEvent::RuleSetChanged {
            kind,
            version,
            rule_count,
        } => {
            assert_eq!(kind, ChangeKind::Reload);
            assert_eq!(version, report.version);
            assert_eq!(rule_count, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Readers racing a writer only ever see one of the two published lists
#[test]
fn test_concurrent_reload_is_atomic() {
    let rules = Arc::new(RuleSet::new());
    let list_a: Vec<Rule> = (0..50)
        .map(|i| Rule::with_id(format!("a{i}"), RuleKind::Cidr, format!("10.{i}.0.0/16"), "eth0").unwrap())
        .collect();
    let list_b: Vec<Rule> = (0..50)
        .map(|i| Rule::with_id(format!("b{i}"), RuleKind::Cidr, format!("10.{i}.0.0/16"), "wlan0").unwrap())
        .collect();
    rules.publish(list_a.clone(), ChangeKind::Reload);

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let rules = Arc::clone(&rules);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last_version = 0;
                while !stop.load(Ordering::Relaxed) {
                    let snapshot = rules.snapshot();
                    assert!(snapshot.version() >= last_version);
                    last_version = snapshot.version();

                    let prefix = &snapshot.rules()[0].id()[..1];
                    assert!(snapshot.rules().iter().all(|r| r.id().starts_with(prefix)));
                    assert_eq!(snapshot.len(), 50);
                }
            })
        })
        .collect();

    for round in 0..200 {
        let next = if round % 2 == 0 { list_b.clone() } else { list_a.clone() };
        rules.publish(next, ChangeKind::Reload);
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(rules.version(), 201);
}
