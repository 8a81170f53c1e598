//! End-to-end provisioning runs against the in-memory stub plugins.
//!
//! Every test pauses the tokio clock, so deadline-length waits resolve
//! instantly and interval sampling is deterministic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use formation_core::{Settings, System};
use formation_engine::{Collaborators, EngineError, SystemProvisioner, SystemState};
use formation_provider::{DnsProvider, LoadBalancer, StubBalancer, StubDns, StubProvider};

fn settings(max_failures: u32) -> Settings {
    Settings {
        max_failures,
        deadline_secs: 30,
        poll_interval_secs: 2,
        ..Settings::default()
    }
}

fn collaborators(provider: &Arc<StubProvider>) -> Collaborators {
    Collaborators {
        provider: provider.clone(),
        balancer: None,
        dns: None,
    }
}

/// a ← b ← c dependency chain.
fn chain_system() -> System {
    System::from_value(json!({
        "nodes": [
            {"name": "a", "run_list": ["role[x]"]},
            {"name": "b", "run_list": ["role[y]"], "dependencies": ["role[x]"]},
            {"name": "c", "run_list": ["role[z]"], "dependencies": ["role[y]"]},
        ]
    }))
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn empty_system_completes_without_waiting() {
    let provider = Arc::new(StubProvider::new());
    let mut sp = SystemProvisioner::new(System::new(), settings(0), collaborators(&provider));

    let started = tokio::time::Instant::now();
    let state = sp.run().await;

    assert_eq!(state, SystemState::Complete);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(provider.created().is_empty());
}

#[tokio::test(start_paused = true)]
async fn chain_provisions_in_dependency_order() {
    let provider = Arc::new(StubProvider::new());
    let mut sp = SystemProvisioner::new(chain_system(), settings(0), collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Complete);
    assert_eq!(provider.apply_order(), vec!["a", "b", "c"]);
    assert_eq!(sp.failures(), 0);
    // Weights were rebalanced before provisioning: 1, 1+1*5, 1+6*5.
    assert_eq!(sp.system().node("a").unwrap().weight, 1);
    assert_eq!(sp.system().node("b").unwrap().weight, 6);
    assert_eq!(sp.system().node("c").unwrap().weight, 31);
}

#[tokio::test(start_paused = true)]
async fn assigned_addresses_land_in_node_options() {
    let provider = Arc::new(StubProvider::new());
    let mut sp = SystemProvisioner::new(chain_system(), settings(0), collaborators(&provider));

    sp.run().await;

    for name in ["a", "b", "c"] {
        let node = sp.system().node(name).unwrap();
        let ip = node.opt("node_ip").and_then(|v| v.as_str()).unwrap();
        assert!(ip.starts_with("10.0.0."), "unexpected address {ip:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn slow_boot_is_tolerated_within_the_deadline() {
    let provider = Arc::new(StubProvider::new());
    provider.reachable_after("b", 5);
    let mut sp = SystemProvisioner::new(chain_system(), settings(0), collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Complete);
    assert_eq!(provider.kill_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_node_with_retry_budget_tears_down_once_then_halts() {
    let provider = Arc::new(StubProvider::new());
    provider.set_unreachable("b");
    let mut sp = SystemProvisioner::new(chain_system(), settings(1), collaborators(&provider));

    let state = sp.run().await;

    // First failure: full teardown and recreation. Second: halt.
    assert_eq!(state, SystemState::Failed);
    assert_eq!(sp.failures(), 2);
    assert_eq!(provider.kill_count(), 1);
    assert_eq!(provider.killed()[0], vec!["a", "b", "c"]);
    assert!(provider.apply_order().is_empty());
    // The timeout reaches the retry decision as a timeout, not as a
    // generic provider failure.
    assert!(matches!(
        sp.last_error(),
        Some(EngineError::ReachabilityTimeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn apply_failure_without_retry_budget_halts_without_teardown() {
    let provider = Arc::new(StubProvider::new());
    provider.fail_apply("a");
    let mut sp = SystemProvisioner::new(chain_system(), settings(0), collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Failed);
    assert_eq!(sp.failures(), 1);
    assert_eq!(provider.kill_count(), 0);
    assert!(matches!(
        sp.last_error(),
        Some(EngineError::ConfigurationApply { node, .. }) if node == "a"
    ));
}

#[tokio::test(start_paused = true)]
async fn stalled_apply_fails_the_run_at_the_deadline() {
    let provider = Arc::new(StubProvider::new());
    provider.hold_apply("a");
    let system = System::from_value(json!({
        "nodes": [{"name": "a", "run_list": ["role[x]"]}]
    }))
    .unwrap();
    let mut sp = SystemProvisioner::new(system, settings(0), collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Failed);
    assert!(provider.apply_order().is_empty());
}

#[tokio::test(start_paused = true)]
async fn external_completion_signal_finishes_a_stalled_node() {
    let provider = Arc::new(StubProvider::new());
    provider.hold_apply("a");
    let system = System::from_value(json!({
        "nodes": [{"name": "a", "run_list": ["role[x]"]}]
    }))
    .unwrap();
    let mut sp = SystemProvisioner::new(system, settings(0), collaborators(&provider));

    let completions = sp.completion_handle();
    let driver = async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        completions.record();
    };
    let (state, ()) = tokio::join!(sp.run(), driver);

    assert_eq!(state, SystemState::Complete);
}

#[tokio::test(start_paused = true)]
async fn balancer_flow_merges_attributes_and_registers_dns() {
    let provider = Arc::new(StubProvider::new());
    let balancer = Arc::new(StubBalancer::new());
    let dns = Arc::new(StubDns::new());
    balancer.activate_after(2);

    let system = System::from_value(json!({
        "nodes": [
            {"name": "web1", "run_list": ["role[web]"]},
            {"name": "web2", "run_list": ["role[web]"]},
            {"name": "db", "run_list": ["role[db]"]},
        ],
        "load_balancers": [{
            "name": "front",
            "role": "role[web]",
            "attributes_template": {
                "haproxy": {"vip": "{{lb_ip}}", "member": "{{node_ip}}"}
            },
            "ssl": {"key": "k", "cert": "c"},
        }],
    }))
    .unwrap();

    let mut settings = settings(0);
    settings.domain = Some("example.com".to_string());
    settings.tag = Some("prod".to_string());
    let balancer_dyn: Arc<dyn LoadBalancer> = balancer.clone();
    let dns_dyn: Arc<dyn DnsProvider> = dns.clone();
    let collab = Collaborators {
        provider: provider.clone(),
        balancer: Some(balancer_dyn),
        dns: Some(dns_dyn),
    };
    let mut sp = SystemProvisioner::new(system, settings, collab);

    let state = sp.run().await;

    assert_eq!(state, SystemState::Complete);
    assert_eq!(balancer.created(), vec!["front"]);
    assert_eq!(balancer.members_of("front"), vec!["web1", "web2"]);
    assert_eq!(balancer.ssl_terminations(), vec![("front".to_string(), 443)]);

    let entries = dns.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "front");
    assert_eq!(entries[0].domain, "example.com");
    assert_eq!(entries[0].tag.as_deref(), Some("prod"));

    // Template bindings were substituted per node before the merge.
    let web1 = sp.system().node("web1").unwrap();
    let attrs = web1.attributes();
    let vip = attrs["haproxy"]["vip"].as_str().unwrap();
    assert_eq!(vip, entries[0].ip);
    let member = attrs["haproxy"]["member"].as_str().unwrap();
    assert!(member.starts_with("10.0.0."));

    // Nodes outside the balancer's role keep their attributes untouched.
    let db = sp.system().node("db").unwrap();
    assert!(db.attributes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn declared_balancer_without_a_plugin_fails_the_run() {
    let provider = Arc::new(StubProvider::new());
    let system = System::from_value(json!({
        "nodes": [{"name": "web", "run_list": ["role[web]"]}],
        "load_balancers": [{"name": "front", "role": "role[web]"}],
    }))
    .unwrap();
    let mut sp = SystemProvisioner::new(system, settings(0), collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Failed);
    assert!(provider.apply_order().is_empty());
}

#[tokio::test(start_paused = true)]
async fn post_provision_command_runs_on_opted_in_nodes() {
    let provider = Arc::new(StubProvider::new());
    let system = System::from_value(json!({
        "nodes": [
            {"name": "a", "run_list": ["role[x]"], "options": {"post_provision": true}},
            {"name": "b", "run_list": ["role[y]"]},
        ]
    }))
    .unwrap();

    let mut settings = settings(0);
    settings.post_provision_command = Some("chef-client".to_string());
    let mut sp = SystemProvisioner::new(system, settings, collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Complete);
    let commands = provider.commands();
    assert_eq!(commands, vec![("a".to_string(), "chef-client".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_post_provision_command_is_a_system_failure() {
    let provider = Arc::new(StubProvider::new());
    provider.fail_commands();
    let system = System::from_value(json!({
        "nodes": [{"name": "a", "run_list": ["role[x]"], "options": {"post_provision": true}}]
    }))
    .unwrap();

    let mut settings = settings(0);
    settings.post_provision_command = Some("chef-client".to_string());
    let mut sp = SystemProvisioner::new(system, settings, collaborators(&provider));

    let state = sp.run().await;

    assert_eq!(state, SystemState::Failed);
    assert!(provider.commands().is_empty());
    // The nodes themselves provisioned before the hook failed.
    assert_eq!(provider.apply_order(), vec!["a"]);
}
