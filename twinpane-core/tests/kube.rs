#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;
use twinpane_core::backend::{KubeBackend, KubeTarget, Kubectl};
use twinpane_core::{ListingPolicy, Source, SourceError, SourceKind, TaskHandle};

/// Stands in for `kubectl`: drops everything up to `--` and runs the rest locally.
/// With a `noisy` file next to it, it first floods stderr.
const FAKE_KUBECTL: &str = r##"#!/bin/sh
[ -e "$(dirname "$0")/noisy" ] && head -c 300000 /dev/zero >&2
while [ "$#" -gt 0 ] && [ "$1" != "--" ]; do shift; done
shift
exec "$@"
"##;

fn fake_kubectl(bin: &TempDir) -> Kubectl {
    let program = bin.path().join("kubectl");
    std::fs::write(&program, FAKE_KUBECTL).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
    Kubectl::new(program.to_string_lossy().into_owned())
}

#[tokio::test]
async fn drives_container_files_through_exec() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let home = root.path().to_string_lossy().into_owned();
    std::fs::write(root.path().join("app.log"), b"started\n").unwrap();
    std::fs::create_dir(root.path().join("conf")).unwrap();
    std::fs::write(root.path().join("odd|name.txt"), b"").unwrap();

    let target = KubeTarget {
        namespace: "default".into(),
        pod: "web-0".into(),
        container: None,
    };
    let source = Source::new(
        KubeBackend::new(fake_kubectl(&bin), target, Some(home.clone()), 2),
        ListingPolicy::Strict,
    );
    assert_eq!(source.kind(), SourceKind::Kubernetes);
    assert_eq!(source.concurrency(), 2);
    assert_eq!(source.home().await.unwrap(), home);

    let dir = source.get(&home).await.unwrap();
    let names: Vec<String> = dir
        .list()
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.name().to_string())
        .collect();
    assert_eq!(names, ["conf", "app.log", "odd|name.txt"]);

    let log = source.get(&format!("{home}/app.log")).await.unwrap();
    assert_eq!(log.size(), 8);
    let mut out = Vec::new();
    log.transfer_to(&mut out, &TaskHandle::detached("download"))
        .await
        .unwrap();
    assert_eq!(out, b"started\n");

    let upload = TaskHandle::detached("upload");
    let created = dir
        .transfer_from("new file.txt", &mut &b"from the pane"[..], 13, &upload)
        .await
        .unwrap();
    assert_eq!(created.size(), 13);
    assert_eq!(
        std::fs::read(root.path().join("new file.txt")).unwrap(),
        b"from the pane"
    );

    let made = dir.create_dir("cache").await.unwrap();
    assert!(made.is_directory());
    let moved = made.rename("cache.old").await.unwrap();
    assert!(root.path().join("cache.old").is_dir());
    assert!(matches!(
        log.rename("new file.txt").await,
        Err(SourceError::Transport(_))
    ));

    moved.delete().await.unwrap();
    assert!(!root.path().join("cache.old").exists());

    let missing = format!("{home}/missing");
    assert!(matches!(
        source.get(&missing).await,
        Err(SourceError::NotFound(path)) if path == missing
    ));
    assert!(!source.is_valid(&missing).await);
    assert!(source.is_valid(&format!("{home}/conf")).await);

    // a large stderr stream must not stall transfers
    std::fs::write(bin.path().join("noisy"), b"").unwrap();
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let big = tokio::time::timeout(
        std::time::Duration::from_secs(20),
        dir.transfer_from("big.bin", &mut payload.as_slice(), payload.len() as u64, &upload),
    )
    .await
    .expect("upload stalled")
    .unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(
        std::time::Duration::from_secs(20),
        big.transfer_to(&mut out, &TaskHandle::detached("download")),
    )
    .await
    .expect("download stalled")
    .unwrap();
    assert_eq!(out, payload);
    std::fs::remove_file(bin.path().join("noisy")).unwrap();

    source.close().await;
    assert!(source.is_closed());
}
