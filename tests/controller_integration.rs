use std::path::Path;
use std::sync::Arc;

use appfence::config::Config;
use appfence::controller::{
    tiers, Action, ControllerBuilder, PerAppNetworkController, TierOutcome,
};
use appfence::platform::{FixedNetworkType, NetworkType, StaticPackageRegistry, StaticProcessTable};
use appfence::privileged::{PrivilegedCommand, Program, RecordingExecutor};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Harness {
    controller: PerAppNetworkController,
    exec: Arc<RecordingExecutor>,
    network: Arc<FixedNetworkType>,
    processes: Arc<StaticProcessTable>,
    _dir: TempDir,
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.platform.proc_root = Some(dir.to_path_buf());
    config.monitor.resolv_conf = Some(dir.join("resolv.conf"));
    config.monitor.process_poll_ms = Some(3_600_000);
    config.monitor.bypass_poll_ms = Some(3_600_000);
    config
}

fn harness(privileged: bool, network: NetworkType) -> Harness {
    let dir = tempdir().unwrap();
    let exec = Arc::new(RecordingExecutor::new(privileged));
    let network = Arc::new(FixedNetworkType::new(network));
    let processes = Arc::new(StaticProcessTable::new());
    let registry = StaticPackageRegistry::new()
        .with_package("pkg.a", 10100)
        .with_package("pkg.b", 10200)
        .with_package("pkg.c", 10300);

    let controller = ControllerBuilder::new(test_config(dir.path()))
        .executor(exec.clone())
        .package_registry(Arc::new(registry))
        .network_provider(network.clone())
        .process_table(processes.clone())
        .build()
        .unwrap();

    Harness {
        controller,
        exec,
        network,
        processes,
        _dir: dir,
    }
}

async fn send(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}

/// Upstream answering every request with `200 ok`.
async fn upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

fn rendered(commands: &[PrivilegedCommand]) -> Vec<String> {
    commands.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn test_block_state_visible_immediately() {
    let h = harness(false, NetworkType::Other);

    let task = h.controller.block_app_internet("pkg.a", true, true);
    assert!(h.controller.is_app_blocked("pkg.a"));
    assert_eq!(h.controller.get_all_blocked_apps(), vec!["pkg.a"]);
    let state = h.controller.get_app_block_state("pkg.a").unwrap();
    assert!(state.is_blocked && state.block_wifi && state.block_cellular);

    let report = task.wait().await.unwrap();
    assert_eq!(report.action, Action::Block);
    assert_eq!(report.outcome(tiers::PROXY), Some(&TierOutcome::Applied));
    assert_eq!(report.outcome(tiers::FIREWALL), Some(&TierOutcome::Unavailable));

    let task = h.controller.allow_app_internet("pkg.a");
    assert!(!h.controller.is_app_blocked("pkg.a"));
    assert!(h.controller.get_all_blocked_apps().is_empty());
    task.wait().await.unwrap();
    assert!(h.controller.proxy_port("pkg.a").await.is_none());
}

#[tokio::test]
async fn test_blocked_domain_gets_403() {
    let h = harness(false, NetworkType::Other);
    h.controller.block_app_internet("pkg.a", true, true).wait().await.unwrap();
    let port = h.controller.proxy_port("pkg.a").await.unwrap();

    let response = send(
        port,
        "GET http://www.facebook.com/feed HTTP/1.1\r\nHost: www.facebook.com\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 403"));
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_wifi_only_block_on_unprivileged_device() {
    let h = harness(false, NetworkType::Wifi);
    let up = upstream().await;

    let report = h
        .controller
        .block_app_internet("pkg.a", true, false)
        .wait()
        .await
        .unwrap();
    assert!(!h.controller.is_privileged());
    assert!(report.is_clean());
    assert!(h.exec.commands().is_empty());
    assert!(h.controller.get_app_block_state("pkg.a").unwrap().is_blocked);

    let port = h.controller.proxy_port("pkg.a").await.unwrap();
    let request = format!("GET http://127.0.0.1:{up}/ HTTP/1.1\r\n\r\n");

    assert!(send(port, &request).await.starts_with("HTTP/1.1 403"));

    h.network.set(NetworkType::Cellular);
    let response = send(port, &request).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_blocks_get_distinct_ports() {
    let h = harness(false, NetworkType::Other);
    let a = h.controller.block_app_internet("pkg.a", true, true);
    let b = h.controller.block_app_internet("pkg.b", true, true);
    a.wait().await.unwrap();
    b.wait().await.unwrap();

    let port_a = h.controller.proxy_port("pkg.a").await.unwrap();
    let port_b = h.controller.proxy_port("pkg.b").await.unwrap();
    assert_ne!(port_a, port_b);

    h.controller.allow_app_internet("pkg.a").wait().await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_err());
    let response = send(
        port_b,
        "GET http://facebook.com/ HTTP/1.1\r\nHost: facebook.com\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 403"));
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_allow_removes_exactly_the_installed_rules() {
    let h = harness(true, NetworkType::Other);
    assert!(h.controller.is_privileged());

    h.controller.block_app_internet("pkg.a", true, true).wait().await.unwrap();
    h.controller.block_app_internet("pkg.b", true, false).wait().await.unwrap();

    let uid_rules = |uid: &str, verb: &str| -> Vec<PrivilegedCommand> {
        h.exec
            .commands_for(Program::Iptables)
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(verb))
            .filter(|c| c.args.iter().any(|a| a == uid))
            .collect()
    };
    let added = uid_rules("10100", "-A");
    assert!(!added.is_empty());

    let report = h.controller.allow_app_internet("pkg.a").wait().await.unwrap();
    assert_eq!(report.outcome(tiers::FIREWALL), Some(&TierOutcome::Released));

    let expected: Vec<PrivilegedCommand> =
        added.iter().filter_map(PrivilegedCommand::to_delete).collect();
    assert_eq!(rendered(&uid_rules("10100", "-D")), rendered(&expected));
    assert!(uid_rules("10200", "-D").is_empty());
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_privileged_block_creates_interface() {
    let h = harness(true, NetworkType::Other);
    let report = h
        .controller
        .block_app_internet("pkg.a", true, true)
        .wait()
        .await
        .unwrap();
    assert_eq!(report.outcome(tiers::INTERFACE), Some(&TierOutcome::Applied));

    let ip = rendered(&h.exec.commands_for(Program::Ip));
    assert!(ip.iter().any(|c| c.starts_with("ip link add afence")));
    assert!(!h.exec.commands_for(Program::Tc).is_empty());

    h.exec.clear();
    h.controller.allow_app_internet("pkg.a").wait().await.unwrap();
    let ip = rendered(&h.exec.commands_for(Program::Ip));
    assert!(ip.iter().any(|c| c.starts_with("ip link del afence")));
}

#[tokio::test]
async fn test_unknown_package_keeps_app_level_tier() {
    let h = harness(true, NetworkType::Other);
    let report = h
        .controller
        .block_app_internet("pkg.unknown", true, true)
        .wait()
        .await
        .unwrap();

    assert!(report.outcome(tiers::FIREWALL).unwrap().is_failure());
    assert_eq!(report.outcome(tiers::PROXY), Some(&TierOutcome::Applied));
    assert_eq!(report.outcome(tiers::MONITORING), Some(&TierOutcome::Applied));
    assert!(h.controller.proxy_port("pkg.unknown").await.is_some());
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_watchers_start_once_and_stop_once() {
    let h = harness(false, NetworkType::Other);
    h.processes.set("pkg.a", vec![4242, 4243]);

    let tasks: Vec<_> = ["pkg.a", "pkg.b", "pkg.c"]
        .into_iter()
        .map(|p| h.controller.block_app_internet(p, true, true))
        .collect();
    for task in tasks {
        task.wait().await.unwrap();
    }

    let detector = h.controller.detector();
    assert_eq!(detector.watchers().start_count(), 1);
    assert_eq!(detector.process_monitor().watchers().start_count(), 1);
    assert_eq!(detector.process_monitor().monitored_pids("pkg.a"), vec![4242, 4243]);
    assert_eq!(detector.monitored_apps(), vec!["pkg.a", "pkg.b", "pkg.c"]);

    h.controller.allow_app_internet("pkg.a").wait().await.unwrap();
    h.controller.allow_app_internet("pkg.b").wait().await.unwrap();
    assert_eq!(detector.watchers().stop_count(), 0);
    h.controller.allow_app_internet("pkg.c").wait().await.unwrap();

    assert_eq!(detector.watchers().stop_count(), 1);
    assert_eq!(detector.process_monitor().watchers().stop_count(), 1);
    assert!(detector.monitored_apps().is_empty());
}

#[tokio::test]
async fn test_repeated_block_reuses_listener() {
    let h = harness(false, NetworkType::Wifi);
    let up = upstream().await;
    h.controller.block_app_internet("pkg.a", true, true).wait().await.unwrap();
    let first = h.controller.proxy_port("pkg.a").await.unwrap();

    let second_task = h.controller.block_app_internet("pkg.a", false, true);
    second_task.wait().await.unwrap();
    let second = h.controller.proxy_port("pkg.a").await.unwrap();
    assert_eq!(first, second);

    let state = h.controller.get_app_block_state("pkg.a").unwrap();
    assert!(!state.block_wifi);
    let response = send(second, &format!("GET http://127.0.0.1:{up}/ HTTP/1.1\r\n\r\n")).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    h.controller.cleanup().await;
}

#[tokio::test]
async fn test_block_then_allow_settles_on_last_write() {
    let h = harness(false, NetworkType::Other);
    let block = h.controller.block_app_internet("pkg.a", true, true);
    let allow = h.controller.allow_app_internet("pkg.a");
    block.wait().await.unwrap();
    allow.wait().await.unwrap();

    assert!(!h.controller.is_app_blocked("pkg.a"));
    assert!(h.controller.proxy_port("pkg.a").await.is_none());
    assert!(!h.controller.interceptor().is_intercepting("pkg.a"));
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let h = harness(true, NetworkType::Other);
    h.controller.block_app_internet("pkg.a", true, true).wait().await.unwrap();
    h.controller.block_app_internet("pkg.b", true, true).wait().await.unwrap();

    let first = h.controller.cleanup().await;
    assert_eq!(first.len(), 2);
    assert!(h.controller.proxy_port("pkg.a").await.is_none());
    assert!(h.controller.is_app_blocked("pkg.a"));

    let second = h.controller.cleanup().await;
    assert!(second.is_empty());

    let drops = rendered(&h.exec.commands_for(Program::Iptables))
        .into_iter()
        .filter(|c| c == "iptables -X appfence")
        .count();
    assert_eq!(drops, 1);
}

#[tokio::test]
async fn test_own_enforcement_is_not_reported_as_bypass() {
    let h = harness(true, NetworkType::Other);
    let mut events = h.controller.subscribe_bypass_events();

    h.controller.block_app_internet("pkg.a", true, true).wait().await.unwrap();
    let detector = h.controller.detector();
    assert!(detector.check_all().is_empty());

    // pkg.b's rules and interface land while pkg.a is monitored.
    h.controller.block_app_internet("pkg.b", true, true).wait().await.unwrap();
    assert!(detector.check_all().is_empty());

    h.controller.allow_app_internet("pkg.b").wait().await.unwrap();
    assert!(detector.check_all().is_empty());
    assert!(events.try_recv().is_err());

    h.controller.cleanup().await;
}
