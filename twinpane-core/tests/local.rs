use std::sync::Arc;

use tempfile::TempDir;
use twinpane_core::backend::LocalBackend;
use twinpane_core::{
    Activity, ChannelNotifier, ListingPolicy, Progress, Source, SourceError, SourceKind,
    TaskHandle, copy_entry,
};

fn source_in(dir: &TempDir) -> Source {
    let home = dir.path().to_string_lossy().into_owned();
    Source::new(LocalBackend::new(Some(home)), ListingPolicy::Lenient)
}

fn home_of(dir: &TempDir) -> String {
    dir.path().to_string_lossy().into_owned()
}

#[tokio::test]
async fn upload_then_download_round_trips_content() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    let home = source.get(&source.home().await.unwrap()).await.unwrap();
    assert!(home.is_directory());
    assert_eq!(source.kind(), SourceKind::Local);

    let content = b"hello from the left pane".to_vec();
    let progress = TaskHandle::detached("upload");
    let created = home
        .transfer_from(
            "notes.txt",
            &mut content.as_slice(),
            content.len() as u64,
            &progress,
        )
        .await
        .unwrap();
    assert_eq!(created.name(), "notes.txt");
    assert_eq!(created.size(), content.len() as u64);
    assert_eq!(progress.progress(), Progress::Fraction(1.0));

    let mut downloaded = Vec::new();
    let copied = created
        .transfer_to(&mut downloaded, &TaskHandle::detached("download"))
        .await
        .unwrap();
    assert_eq!(copied, content.len() as u64);
    assert_eq!(downloaded, content);
}

#[tokio::test]
async fn listing_puts_directories_first() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
    std::fs::write(dir.path().join("A.txt"), b"a").unwrap();
    std::fs::create_dir(dir.path().join("zeta")).unwrap();
    std::fs::create_dir(dir.path().join("alpha")).unwrap();

    let source = source_in(&dir);
    let home = source.get(&home_of(&dir)).await.unwrap();
    let names: Vec<String> = home
        .list()
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.name().to_string())
        .collect();
    assert_eq!(names, ["alpha", "zeta", "A.txt", "b.txt"]);

    let file = source.get(&format!("{}/b.txt", home_of(&dir))).await.unwrap();
    assert!(file.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn paths_are_canonicalized_before_lookup() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/readme.md"), b"# hi").unwrap();

    let source = source_in(&dir);
    let messy = format!("{}//docs/./../docs/readme.md/", home_of(&dir));
    let entry = source.get(&messy).await.unwrap();
    assert_eq!(entry.path(), format!("{}/docs/readme.md", home_of(&dir)));
    assert!(source.is_valid(&messy).await);
    assert!(!source.is_directory(&messy).await);
    assert!(source.is_directory(&format!("{}/docs/", home_of(&dir))).await);
}

#[tokio::test]
async fn missing_paths_are_not_found() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    let missing = format!("{}/nope", home_of(&dir));

    assert!(matches!(
        source.get(&missing).await,
        Err(SourceError::NotFound(path)) if path == missing
    ));
    assert!(!source.is_valid(&missing).await);
    assert!(!source.is_directory(&missing).await);
}

#[tokio::test]
async fn rename_resolves_the_new_entry() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("draft.txt"), b"v1").unwrap();
    let source = source_in(&dir);

    let draft = source
        .get(&format!("{}/draft.txt", home_of(&dir)))
        .await
        .unwrap();
    let renamed = draft.rename("final.txt").await.unwrap();
    assert_eq!(renamed.path(), format!("{}/final.txt", home_of(&dir)));
    assert_eq!(renamed.size(), 2);
    assert_eq!(renamed.name(), "final.txt");
    let old = format!("{}/draft.txt", home_of(&dir));
    assert!(matches!(
        source.get(&old).await,
        Err(SourceError::NotFound(path)) if path == old
    ));

    assert!(matches!(
        renamed.rename("../escape.txt").await,
        Err(SourceError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn create_and_delete_directory_tree() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    let home = source.get(&home_of(&dir)).await.unwrap();

    let photos = home.create_dir("photos").await.unwrap();
    assert!(photos.is_directory());
    let nested = photos.create_dir("2024").await.unwrap();
    nested
        .transfer_from("a.jpg", &mut &b"jpeg"[..], 4, &TaskHandle::detached("upload"))
        .await
        .unwrap();

    photos.delete().await.unwrap();
    assert!(!dir.path().join("photos").exists());

    let file = home
        .transfer_from("plain.txt", &mut &b"x"[..], 1, &TaskHandle::detached("upload"))
        .await
        .unwrap();
    assert!(matches!(
        file.create_dir("child").await,
        Err(SourceError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn upload_fails_when_input_is_short() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    let home = source.get(&home_of(&dir)).await.unwrap();

    let err = home
        .transfer_from("short.bin", &mut &b"abc"[..], 10, &TaskHandle::detached("upload"))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Io(_)));
}

#[tokio::test]
async fn copy_entry_moves_bytes_between_sources() {
    let left_dir = TempDir::new().unwrap();
    let right_dir = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(left_dir.path().join("data.bin"), &payload).unwrap();

    let left = source_in(&left_dir);
    let right = source_in(&right_dir);
    let file = left
        .get(&format!("{}/data.bin", home_of(&left_dir)))
        .await
        .unwrap();
    let target = right.get(&home_of(&right_dir)).await.unwrap();

    let progress = TaskHandle::detached("copy data.bin");
    let copied = copy_entry(&file, &target, &progress).await.unwrap();
    assert_eq!(copied.size(), payload.len() as u64);
    assert_eq!(progress.progress(), Progress::Fraction(1.0));
    assert_eq!(std::fs::read(right_dir.path().join("data.bin")).unwrap(), payload);

    assert!(matches!(
        copy_entry(&target, &file, &progress).await,
        Err(SourceError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn activity_reports_missing_files_to_the_user() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    let (notifier, mut notifications) = ChannelNotifier::new();
    let activity = Activity::new(Arc::new(notifier));
    let missing = format!("{}/gone.txt", home_of(&dir));

    let result = activity
        .run("open gone.txt", |_task| source.get(&missing))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(activity.is_idle());

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.title, "Not Found");
    assert_eq!(notification.message, missing);
}

#[tokio::test]
async fn closed_sources_report_their_state() {
    let dir = TempDir::new().unwrap();
    let source = source_in(&dir);
    assert!(!source.is_closed());
    source.close().await;
    source.close().await;
    assert!(source.is_closed());
}

#[tokio::test]
async fn rename_refuses_to_replace_existing_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"AAAA").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"precious").unwrap();
    let source = source_in(&dir);

    let a = source
        .get(&format!("{}/a.txt", home_of(&dir)))
        .await
        .unwrap();
    assert!(matches!(
        a.rename("b.txt").await,
        Err(SourceError::InvalidOperation(_))
    ));
    assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"precious");
    assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"AAAA");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn unreadable_names_do_not_hide_the_rest_of_a_listing() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("good.txt"), b"ok").unwrap();
    std::fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"??").unwrap();

    for policy in [ListingPolicy::Lenient, ListingPolicy::Strict] {
        let source = Source::new(LocalBackend::new(Some(home_of(&dir))), policy);
        let home = source.get(&home_of(&dir)).await.unwrap();
        let names: Vec<String> = home
            .list()
            .await
            .unwrap()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect();
        assert_eq!(names, ["good.txt"], "{policy:?}");
    }
}
