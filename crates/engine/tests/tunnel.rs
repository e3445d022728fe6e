mod support;

use crossrun_common::{Error, ProcessStatus, TunnelIdentifier, TunnelOptions, Vendor};
use crossrun_engine::tunnel::{Manager, Tunnel, TunnelFlavor};
use std::path::Path;
use support::{config, fake_sauce_tunnel};

fn full_options(identifier: TunnelIdentifier, dir: &Path, port: u16) -> TunnelOptions {
    TunnelOptions {
        identifier,
        log_file: Some(dir.join(format!("sc-{}.log", port))),
        pid_file: Some(dir.join(format!("sc-{}.pid", port))),
        proxy_port: Some(port),
        selenium_port: Some(port + 1),
        extra_args: Vec::new(),
    }
}

fn manager(binary: &Path) -> Manager {
    Manager::new(TunnelFlavor::for_vendor(Vendor::SauceLabs), binary)
}

/// A second unidentified tunnel without differentiators is refused before
/// anything is spawned.
#[tokio::test]
async fn conflict_is_detected_before_spawn() {
    let tmp = tempfile::tempdir().unwrap();
    let binary = fake_sauce_tunnel(tmp.path());
    let config = config(tmp.path(), Some(binary.clone()));

    let first = Tunnel::new(Vendor::SauceLabs, binary.clone(), &config, &TunnelOptions::default());
    first.start().await.unwrap();
    assert_eq!(manager(&binary).running().await.unwrap().len(), 1);

    let second = Tunnel::new(Vendor::SauceLabs, binary.clone(), &config, &TunnelOptions::default());
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, Error::TunnelConflict(_)), "got {err}");
    assert_eq!(manager(&binary).running().await.unwrap().len(), 1);
    assert_eq!(second.status(), ProcessStatus::Stopped);

    first.stop().await.unwrap();
}

/// Two identified tunnels with full differentiators run side by side and
/// both show up in the process table.
#[tokio::test]
async fn distinct_identifiers_run_side_by_side() {
    let tmp = tempfile::tempdir().unwrap();
    let binary = fake_sauce_tunnel(tmp.path());
    let config = config(tmp.path(), Some(binary.clone()));

    let a = Tunnel::new(
        Vendor::SauceLabs,
        binary.clone(),
        &config,
        &full_options(TunnelIdentifier::Named("alpha".into()), tmp.path(), 4450),
    );
    let b = Tunnel::new(
        Vendor::SauceLabs,
        binary.clone(),
        &config,
        &full_options(TunnelIdentifier::Generate, tmp.path(), 4460),
    );
    a.start().await.unwrap();
    b.start().await.unwrap();

    let running = manager(&binary).running().await.unwrap();
    assert_eq!(running.len(), 2);
    let with_id = manager(&binary).with_id().await.unwrap();
    assert_eq!(with_id.len(), 2);
    assert!(with_id.iter().any(|t| t.identifier.as_deref() == Some("alpha")));
    assert!(with_id.iter().any(|t| t.identifier.as_deref() == b.identifier()));
    assert!(manager(&binary).without_id().await.unwrap().is_empty());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    assert!(manager(&binary).running().await.unwrap().is_empty());
}

/// Reusing an identifier that is already running is a conflict.
#[tokio::test]
async fn duplicate_identifier_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let binary = fake_sauce_tunnel(tmp.path());
    let config = config(tmp.path(), Some(binary.clone()));
    let options = TunnelOptions {
        identifier: TunnelIdentifier::Named("ci".into()),
        ..Default::default()
    };

    let first = Tunnel::new(Vendor::SauceLabs, binary.clone(), &config, &options);
    first.start().await.unwrap();
    let err = Tunnel::new(Vendor::SauceLabs, binary.clone(), &config, &options)
        .start()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("identifier 'ci'"));

    first.stop().await.unwrap();
}

/// Stopping is remembered, and stopping a dead tunnel is fine.
#[tokio::test]
async fn stop_marks_intentional() {
    let tmp = tempfile::tempdir().unwrap();
    let binary = fake_sauce_tunnel(tmp.path());
    let config = config(tmp.path(), Some(binary.clone()));

    let tunnel = Tunnel::new(Vendor::SauceLabs, binary, &config, &TunnelOptions::default());
    tunnel.start().await.unwrap();
    assert!(!tunnel.died_unexpectedly());

    tunnel.stop().await.unwrap();
    assert!(tunnel.is_intentionally_stopped());
    assert!(!tunnel.died_unexpectedly());
    tunnel.stop().await.unwrap();
}
