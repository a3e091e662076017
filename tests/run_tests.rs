//! Tests that supervise several apps at once through `relaunch::run`.

use pretty_assertions::assert_eq;
use relaunch::{config::ConfigError, AppConfig, Error};
use tokio::sync::mpsc;

use crate::common::setup;

mod common;

/// Every app is started; on shutdown they are stopped in reverse start
/// order, each one finishing before the next is asked to stop.
#[test_log::test(tokio::test)]
async fn supervises_multiple_apps_until_shutdown() {
    let dir = setup().await;
    let apps = vec![dir.daemon_app("daemon1"), dir.daemon_app("daemon2")];

    let (tx, rx) = mpsc::unbounded_channel();
    let (result, ()) = tokio::join!(relaunch::run(apps, rx), async {
        dir.wait_for_line("daemon1:started").await;
        dir.wait_for_line("daemon2:started").await;
        tx.send(()).unwrap();
    });
    assert!(result.is_ok());

    let output = dir.results().await;
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(6, lines.len());

    // The daemons start concurrently, so their startup lines can be in
    // either order.
    let mut started = lines[..2].to_vec();
    started.sort_unstable();
    assert_eq!(vec!["daemon1:started", "daemon2:started"], started);

    assert_eq!(
        vec![
            "daemon2:shutdown-requested",
            "daemon2:stopped",
            "daemon1:shutdown-requested",
            "daemon1:stopped",
        ],
        lines[2..].to_vec()
    );
}

/// Duplicate app names are rejected.
#[test_log::test(tokio::test)]
async fn rejects_duplicate_app_names() {
    let dir = setup().await;
    let apps = vec![dir.daemon_app("daemon"), dir.daemon_app("daemon")];

    let (_tx, rx) = mpsc::unbounded_channel();
    match relaunch::run(apps, rx).await {
        Err(Error::Config(ConfigError::DuplicateApp(name))) => assert_eq!("daemon", name),
        other => panic!("Expected DuplicateApp error, got {other:?}"),
    }
}

/// An invalid app aborts startup, and the apps that were already started
/// are stopped again.
#[test_log::test(tokio::test)]
async fn invalid_app_aborts_startup() {
    let dir = setup().await;
    let apps = vec![
        dir.daemon_app("daemon"),
        AppConfig::new("broken", "", dir.path()),
    ];

    let (_tx, rx) = mpsc::unbounded_channel();
    let result = relaunch::run(apps, rx).await;

    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::MissingField {
            field: "script",
            ..
        }))
    ));
}
