//! Performance benchmarks for the rule matching engine.
//!
//! Run with: `cargo bench`
//!
//! Performance targets:
//! - CIDR match over 1000 rules: <10us
//! - Host match over 1000 rules: <20us
//! - Snapshot publish of 1000 rules: <1ms

use std::net::{IpAddr, Ipv4Addr};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use iface_router::events::ChangeKind;
use iface_router::rules::{Rule, RuleKind, RuleSet};

// ============================================================================
// Helper Functions
// ============================================================================

/// Half CIDR rules, half host rules, with the interesting ones at the end.
fn build_rules(rule_count: usize) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(rule_count + 2);
    for i in 0..rule_count / 2 {
        let octet = i % 256;
        let second = (i / 256) % 256;
        rules.push(
            Rule::with_id(
                format!("cidr-{i}"),
                RuleKind::Cidr,
                format!("10.{second}.{octet}.0/24"),
                "eth0",
            )
            .expect("valid CIDR"),
        );
        rules.push(
            Rule::with_id(
                format!("host-{i}"),
                RuleKind::Host,
                format!("*.domain{i}.example"),
                "wlan0",
            )
            .expect("valid host pattern"),
        );
    }
    rules.push(Rule::with_id("lan", RuleKind::Cidr, "192.168.0.0/16", "eth1").expect("valid CIDR"));
    rules.push(
        Rule::with_id("target", RuleKind::Host, "api.target.example", "eth1")
            .expect("valid host pattern"),
    );
    rules
}

fn build_rule_set(rule_count: usize) -> RuleSet {
    let set = RuleSet::new();
    set.publish(build_rules(rule_count), ChangeKind::Reload);
    set
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_match_cidr(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_cidr");
    let last: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
    let miss: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    for count in [10, 100, 1000] {
        let set = build_rule_set(count);
        group.bench_with_input(BenchmarkId::new("last_rule", count), &set, |b, set| {
            b.iter(|| set.match_cidr(black_box(last)));
        });
        group.bench_with_input(BenchmarkId::new("no_match", count), &set, |b, set| {
            b.iter(|| set.match_cidr(black_box(miss)));
        });
    }
    group.finish();
}

fn bench_match_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_host");

    for count in [10, 100, 1000] {
        let set = build_rule_set(count);
        group.bench_with_input(BenchmarkId::new("exact_last", count), &set, |b, set| {
            b.iter(|| set.match_host(black_box("API.Target.Example.")));
        });
        group.bench_with_input(BenchmarkId::new("suffix_first", count), &set, |b, set| {
            b.iter(|| set.match_host(black_box("cdn.domain0.example")));
        });
    }
    group.finish();
}

fn bench_match_destination(c: &mut Criterion) {
    let set = build_rule_set(1000);
    let ip = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));

    c.bench_function("match_destination/both_facets_1000", |b| {
        b.iter(|| set.match_destination(black_box(ip), black_box(Some("api.target.example"))));
    });
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    for count in [100, 1000] {
        let set = RuleSet::new();
        let rules = build_rules(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &rules, |b, rules| {
            b.iter(|| set.publish(rules.clone(), ChangeKind::Reload));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_match_cidr,
    bench_match_host,
    bench_match_destination,
    bench_publish
);
criterion_main!(benches);
