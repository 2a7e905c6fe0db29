//! Pipeline orchestration: trust-cache emission, task creation, the
//! full thumbnail flow through a real plugin, and the sidecar
//! round-trip laws.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lightbox_config::{ScanConfig, VolumeConfig};
use lightbox_core::cache::CacheSizeManager;
use lightbox_core::notifications::NotificationSender;
use lightbox_core::pipeline::{PipelineOrchestrator, meta_task_id, thumbnail_task_id, view_task_id};
use lightbox_core::plugins::{
    CacheLayout, FastMetadata, ImagePlugin, PluginRegistry, StandardImagePlugin,
};
use lightbox_core::scheduler::TaskScheduler;
use lightbox_core::store::MetadataStore;
use lightbox_core::volume::VolumeHealth;
use lightbox_core::watcher::WatchGuard;
use lightbox_core::{ActiveSession, Priority};
use lightbox_protocol::{Notification, NotificationKind};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    pipeline: Arc<PipelineOrchestrator>,
    scheduler: Arc<TaskScheduler>,
    store: Arc<MetadataStore>,
    notifications: tokio::sync::mpsc::Receiver<Notification>,
    session: ActiveSession,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let store = Arc::new(MetadataStore::open(&root.join("metadata.db")).await.unwrap());
    let (sender, receiver) = NotificationSender::channel(256);
    let scheduler = Arc::new(TaskScheduler::new(2, sender.clone()));
    let cache = Arc::new(CacheSizeManager::new(Arc::clone(&store), 0).await.unwrap());
    let layout = CacheLayout::create(&root.join("cache"), 64).unwrap();
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(StandardImagePlugin::new(layout)));
    let registry = Arc::new(registry);
    let session = ActiveSession::new();
    let scan = ScanConfig {
        min_file_size: 16,
        ..ScanConfig::default()
    };
    let pipeline = Arc::new(
        PipelineOrchestrator::new(
            Arc::clone(&scheduler),
            Arc::clone(&store),
            registry,
            cache,
            Arc::new(VolumeHealth::new(&VolumeConfig::default())),
            sender,
            session.clone(),
            Arc::new(WatchGuard::new()),
            &scan,
        )
        .unwrap(),
    );
    Fixture {
        _dir: dir,
        root,
        pipeline,
        scheduler,
        store,
        notifications: receiver,
        session,
    }
}

fn write_png(path: &Path, width: u32, height: u32) {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
    });
    img.save(path).unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn trust_cache_emits_exactly_one_notification_and_no_tasks() {
    let mut fx = fixture().await;
    let source = fx.root.join("cached.png");
    write_png(&source, 32, 32);
    let source_text = source.to_string_lossy().into_owned();
    let thumb = fx.root.join("cache").join("deadbeef.jpg");
    std::fs::write(&thumb, b"jpegish").unwrap();
    fx.store
        .set_thumbnail_paths(&source_text, Some(&thumb.to_string_lossy()), None)
        .await
        .unwrap();

    assert!(
        fx.pipeline
            .request_thumbnail(&source_text, Priority::GuiRequest, None)
            .await
    );

    let notification = fx.notifications.try_recv().unwrap();
    assert_eq!(notification.kind, NotificationKind::PreviewsReady);
    assert!(fx.notifications.try_recv().is_err(), "exactly one emission");
    assert_eq!(fx.scheduler.graph_len(), 0, "no tasks for a cache hit");
}

#[tokio::test]
async fn cold_request_submits_thumbnail_and_metadata_tasks() {
    let fx = fixture().await;
    let source = fx.root.join("cold.png");
    write_png(&source, 32, 32);
    let source_text = source.to_string_lossy().into_owned();

    fx.pipeline
        .request_thumbnail(&source_text, Priority::GuiRequest, Some("sess"))
        .await;
    assert!(fx.scheduler.contains_task(&thumbnail_task_id(&source)));
    assert!(fx.scheduler.contains_task(&meta_task_id(&source)));
    assert_eq!(
        fx.scheduler.task_priority(&thumbnail_task_id(&source)),
        Some(Priority::GuiRequest)
    );

    // A second request is an upgrade path, not a duplicate task.
    fx.pipeline
        .request_thumbnail(&source_text, Priority::FullresRequest, Some("sess"))
        .await;
    assert_eq!(
        fx.scheduler.task_priority(&thumbnail_task_id(&source)),
        Some(Priority::FullresRequest)
    );
}

#[tokio::test]
async fn thumbnail_flow_produces_cache_file_and_notification() {
    let mut fx = fixture().await;
    let source = fx.root.join("photo.png");
    write_png(&source, 320, 200);
    let source_text = source.to_string_lossy().into_owned();

    fx.scheduler.start();
    fx.pipeline
        .request_thumbnail(&source_text, Priority::GuiRequest, None)
        .await;

    let notification = tokio::time::timeout(Duration::from_secs(10), fx.notifications.recv())
        .await
        .expect("previews_ready within timeout")
        .expect("channel open");
    assert_eq!(notification.kind, NotificationKind::PreviewsReady);

    let record = fx.store.get(&source_text).await.unwrap().unwrap();
    let thumb = record.thumbnail_path.expect("thumbnail recorded");
    assert!(Path::new(&thumb).exists());
    let (w, h) = image::image_dimensions(&thumb).unwrap();
    assert!(w <= 64 && h <= 64);

    // Second request now takes the trust-cache path: no new tasks.
    wait_until(|| fx.scheduler.graph_len() == 0).await;
    fx.pipeline
        .request_thumbnail(&source_text, Priority::GuiRequest, None)
        .await;
    assert_eq!(fx.scheduler.graph_len(), 0);

    fx.scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn view_image_request_returns_cached_path_without_tasks() {
    let fx = fixture().await;
    let source = fx.root.join("a.png");
    write_png(&source, 32, 32);
    let source_text = source.to_string_lossy().into_owned();
    let view = fx.root.join("cache").join("view.jpg");
    std::fs::write(&view, b"jpegish").unwrap();
    fx.store
        .set_thumbnail_paths(&source_text, None, Some(&view.to_string_lossy()))
        .await
        .unwrap();

    let got = fx.pipeline.request_view_image(&source_text, None).await;
    assert_eq!(got.as_deref(), Some(view.to_string_lossy().as_ref()));
    assert_eq!(fx.scheduler.graph_len(), 0);

    // Without a cached view the task is queued at FULLRES_REQUEST.
    let other = fx.root.join("b.png");
    write_png(&other, 32, 32);
    let other_text = other.to_string_lossy().into_owned();
    let got = fx.pipeline.request_view_image(&other_text, None).await;
    assert!(got.is_none());
    assert_eq!(
        fx.scheduler.task_priority(&view_task_id(&other)),
        Some(Priority::FullresRequest)
    );
}

#[tokio::test]
async fn speculative_fullres_can_be_cancelled() {
    let fx = fixture().await;
    let source = fx.root.join("spec.png");
    write_png(&source, 32, 32);
    let source_text = source.to_string_lossy().into_owned();

    fx.pipeline
        .request_speculative_fullres(&source_text, Priority::ContentHash, None)
        .await;
    assert!(fx.scheduler.contains_task(&view_task_id(&source)));
    fx.pipeline.cancel_speculative_fullres(&source_text);

    // The tombstoned task never runs once workers start.
    fx.scheduler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        fx.store
            .get(&source_text)
            .await
            .unwrap()
            .is_none_or(|r| r.view_image_path.is_none())
    );
    fx.scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stale_session_aborts_view_image_work() {
    let mut fx = fixture().await;
    let source = fx.root.join("stale.png");
    write_png(&source, 64, 64);
    let source_text = source.to_string_lossy().into_owned();

    fx.session.set("new-session");
    fx.scheduler.start();
    // Stamped with a session that is no longer active.
    fx.pipeline
        .request_view_image(&source_text, Some("old-session"))
        .await;

    wait_until(|| fx.scheduler.graph_len() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        fx.store
            .get(&source_text)
            .await
            .unwrap()
            .is_none_or(|r| r.view_image_path.is_none()),
        "expensive decode must be skipped for a stale session"
    );
    assert!(fx.notifications.try_recv().is_err());
    fx.scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn missing_file_fails_task_and_queues_cleanup() {
    let fx = fixture().await;
    let ghost = fx.root.join("ghost.png");
    let ghost_text = ghost.to_string_lossy().into_owned();
    // Seed a record pointing at a file that no longer exists.
    write_png(&ghost, 32, 32);
    fx.store
        .batch_ensure_records_exist(&[ghost_text.clone()])
        .await
        .unwrap();
    std::fs::remove_file(&ghost).unwrap();

    fx.scheduler.start();
    fx.pipeline
        .request_thumbnail(&ghost_text, Priority::GuiRequest, None)
        .await;

    // The failed task queues a jit-cleanup which removes the record.
    let mut cleaned = false;
    for _ in 0..1000 {
        if fx.store.get(&ghost_text).await.unwrap().is_none() {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cleaned, "stale record must be cleaned up");
    fx.scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn rating_roundtrips_through_the_sidecar() {
    let fx = fixture().await;
    let source = fx.root.join("rated.png");
    write_png(&source, 32, 32);

    let layout = CacheLayout::create(&fx.root.join("cache2"), 64).unwrap();
    let plugin = StandardImagePlugin::new(layout);
    plugin.write_rating(&source, 4).await.unwrap();

    let sidecar = fx.root.join("rated.png.xmp");
    assert!(sidecar.exists(), "sidecar lives at <image>.xmp");

    let fast: FastMetadata = plugin.extract_metadata(&source).await.unwrap().unwrap();
    assert_eq!(fast.rating, Some(4), "fast extractor reads the sidecar back");

    // The sidecar stays authoritative across rewrites.
    plugin.write_rating(&source, 1).await.unwrap();
    let fast = plugin.extract_metadata(&source).await.unwrap().unwrap();
    assert_eq!(fast.rating, Some(1));
}

#[tokio::test]
async fn tag_writes_replace_the_subject_list() {
    let fx = fixture().await;
    let source = fx.root.join("tagged.png");
    write_png(&source, 32, 32);

    let layout = CacheLayout::create(&fx.root.join("cache3"), 64).unwrap();
    let plugin = StandardImagePlugin::new(layout);
    plugin
        .write_tags(&source, &["alpha".into(), "beta".into()])
        .await
        .unwrap();
    plugin.write_tags(&source, &["gamma".into()]).await.unwrap();

    let sidecar = std::fs::read(fx.root.join("tagged.png.xmp")).unwrap();
    let fields = lightbox_core::plugins::sidecar::parse_xmp_fields(&sidecar);
    assert_eq!(fields.subjects, vec!["gamma"], "subject list is replaced, not merged");
}

#[tokio::test]
async fn factories_skip_unsupported_and_tiny_files() {
    let fx = fixture().await;
    let tiny = fx.root.join("tiny.png");
    std::fs::write(&tiny, b"x").unwrap();
    let text = fx.root.join("notes.txt");
    std::fs::write(&text, vec![0u8; 64]).unwrap();
    let good = fx.root.join("good.png");
    write_png(&good, 32, 32);

    assert!(fx.pipeline.tasks_for_file(&tiny, Priority::Low).await.is_empty());
    assert!(fx.pipeline.tasks_for_file(&text, Priority::Low).await.is_empty());
    let specs = fx.pipeline.tasks_for_file(&good, Priority::Low).await;
    assert_eq!(specs.len(), 2, "metadata + thumbnail for a fresh file");
}
