//! Metadata store contracts: ratings, tags, filters, moves, cache
//! accounting and LRU eviction.

use std::path::PathBuf;

use lightbox_core::CoreError;
use lightbox_core::plugins::{FastMetadata, FullMetadata};
use lightbox_core::store::MetadataStore;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    store: MetadataStore,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let store = MetadataStore::open(&root.join("metadata.db")).await.unwrap();
    Fixture {
        _dir: dir,
        root,
        store,
    }
}

impl Fixture {
    /// Create a real image-ish file so stat-based record creation works.
    fn file(&self, name: &str, bytes: usize) -> String {
        let path = self.root.join(name);
        std::fs::write(&path, vec![0xAB; bytes]).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn cache_file(&self, name: &str, bytes: usize) -> String {
        let path = self.root.join(name);
        std::fs::write(&path, vec![0xCD; bytes]).unwrap();
        path.to_string_lossy().into_owned()
    }
}

#[tokio::test]
async fn rating_roundtrip_and_bounds() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);

    fx.store.set_rating(&a, 4).await.unwrap();
    assert_eq!(fx.store.get_rating(&a).await.unwrap(), 4);

    // Reading back always returns the last written value.
    fx.store.set_rating(&a, 2).await.unwrap();
    assert_eq!(fx.store.get_rating(&a).await.unwrap(), 2);

    assert!(matches!(
        fx.store.set_rating(&a, 6).await,
        Err(CoreError::InvalidRating(6))
    ));
    assert!(matches!(
        fx.store.set_rating(&a, -1).await,
        Err(CoreError::InvalidRating(-1))
    ));
    assert!(matches!(
        fx.store.batch_set_ratings(&[a.clone()], 9).await,
        Err(CoreError::InvalidRating(9))
    ));
    // Rejected writes leave the previous value intact.
    assert_eq!(fx.store.get_rating(&a).await.unwrap(), 2);
}

#[tokio::test]
async fn batch_ratings_write_existing_and_new_rows() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let b = fx.file("b.jpg", 100);
    fx.store.set_rating(&a, 1).await.unwrap();

    let (all_written, written) = fx
        .store
        .batch_set_ratings(&[a.clone(), b.clone()], 5)
        .await
        .unwrap();
    assert!(all_written);
    assert_eq!(written, 2);
    assert_eq!(fx.store.get_rating(&a).await.unwrap(), 5);
    assert_eq!(fx.store.get_rating(&b).await.unwrap(), 5);

    // A path that cannot be stat'ed is skipped, not fatal.
    let ghost = fx.root.join("ghost.jpg").to_string_lossy().into_owned();
    let (all_written, written) = fx
        .store
        .batch_set_ratings(&[a.clone(), ghost], 3)
        .await
        .unwrap();
    assert!(!all_written);
    assert_eq!(written, 1);
}

#[tokio::test]
async fn thumbnail_paths_upsert_and_validity() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 4096);
    let thumb = fx.cache_file("thumb.jpg", 512);

    // No record yet: not valid.
    assert!(!fx.store.is_thumbnail_valid(&a).await.unwrap());

    fx.store
        .set_thumbnail_paths(&a, Some(&thumb), None)
        .await
        .unwrap();
    assert!(fx.store.is_thumbnail_valid(&a).await.unwrap());

    let previews = fx.store.preview_paths(&a).await.unwrap().unwrap();
    assert_eq!(previews.thumbnail_path.as_deref(), Some(thumb.as_str()));
    assert_eq!(previews.view_image_path, None);

    // Source file grew: stored (size, mtime) no longer match.
    std::fs::write(&a, vec![0xAB; 8192]).unwrap();
    assert!(!fx.store.is_thumbnail_valid(&a).await.unwrap());

    // Thumbnail file vanished: not valid either.
    std::fs::write(&a, vec![0xAB; 4096]).unwrap();
    fx.store
        .set_thumbnail_paths(&a, Some(&thumb), None)
        .await
        .unwrap();
    std::fs::remove_file(&thumb).unwrap();
    assert!(!fx.store.is_thumbnail_valid(&a).await.unwrap());
}

#[tokio::test]
async fn directory_listing_respects_recursion() {
    let fx = fixture().await;
    std::fs::create_dir(fx.root.join("sub")).unwrap();
    let a = fx.file("a.jpg", 100);
    let b = fx.file("sub/b.jpg", 100);
    fx.store
        .batch_ensure_records_exist(&[a.clone(), b.clone()])
        .await
        .unwrap();

    let root = fx.root.to_string_lossy().into_owned();
    let mut flat = fx.store.get_directory_files(&root, false).await.unwrap();
    flat.sort();
    assert_eq!(flat, vec![a.clone()]);

    let mut deep = fx.store.get_directory_files(&root, true).await.unwrap();
    deep.sort();
    assert_eq!(deep, vec![a, b]);
}

#[tokio::test]
async fn filtered_paths_combine_text_stars_and_tags() {
    let fx = fixture().await;
    let trip = fx.file("trip_rome.jpg", 100);
    let home = fx.file("home.jpg", 100);
    let other = fx.file("other_rome.jpg", 100);
    fx.store.set_rating(&trip, 5).await.unwrap();
    fx.store.set_rating(&home, 3).await.unwrap();
    fx.store.set_rating(&other, 0).await.unwrap();
    fx.store
        .set_image_tags(&trip, &["holiday".into()])
        .await
        .unwrap();

    // Text filter only.
    let all = [true; 6];
    let hits = fx
        .store
        .get_filtered_file_paths("rome", &all, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);

    // Star filter: only fives.
    let mut fives = [false; 6];
    fives[5] = true;
    let hits = fx
        .store
        .get_filtered_file_paths("", &fives, None)
        .await
        .unwrap();
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![trip.clone()]);

    // No rating level enabled matches nothing.
    let none = [false; 6];
    assert!(fx
        .store
        .get_filtered_file_paths("", &none, None)
        .await
        .unwrap()
        .is_empty());

    // Tag intersection.
    let tags = vec!["holiday".to_string()];
    let hits = fx
        .store
        .get_filtered_file_paths("", &all, Some(&tags))
        .await
        .unwrap();
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![trip]);
}

#[tokio::test]
async fn tag_set_replace_and_cascade() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    fx.store.batch_ensure_records_exist(&[a.clone()]).await.unwrap();

    fx.store
        .set_image_tags(&a, &["alpha".into(), "beta".into()])
        .await
        .unwrap();
    assert_eq!(
        fx.store.get_image_tags(&a).await.unwrap(),
        vec!["alpha", "beta"]
    );

    // Replace semantics, not merge.
    fx.store.set_image_tags(&a, &["gamma".into()]).await.unwrap();
    assert_eq!(fx.store.get_image_tags(&a).await.unwrap(), vec!["gamma"]);

    fx.store
        .add_image_tags(&a, &["alpha".into()])
        .await
        .unwrap();
    fx.store
        .remove_image_tags(&a, &["gamma".into()])
        .await
        .unwrap();
    assert_eq!(fx.store.get_image_tags(&a).await.unwrap(), vec!["alpha"]);

    // Tag vocabulary survives; links cascade away with the record.
    fx.store.remove_records(&[a.clone()]).await.unwrap();
    assert!(fx.store.get_image_tags(&a).await.unwrap().is_empty());
    let vocabulary = fx.store.get_all_tags(None).await.unwrap();
    assert!(vocabulary.contains(&"alpha".to_string()));
}

#[tokio::test]
async fn directory_tags_and_kinds() {
    let fx = fixture().await;
    std::fs::create_dir(fx.root.join("sub")).unwrap();
    let a = fx.file("a.jpg", 100);
    let b = fx.file("sub/b.jpg", 100);
    fx.store
        .batch_ensure_records_exist(&[a.clone(), b.clone()])
        .await
        .unwrap();
    fx.store.set_image_tags(&a, &["roots".into()]).await.unwrap();
    fx.store.set_image_tags(&b, &["leaves".into()]).await.unwrap();
    fx.store
        .get_or_create_tag("workflow-print", Some("workflow"))
        .await
        .unwrap();

    let root = fx.root.to_string_lossy().into_owned();
    let directory_tags = fx.store.get_directory_tags(&root).await.unwrap();
    assert_eq!(directory_tags, vec!["leaves", "roots"]);

    let workflow = fx.store.get_all_tags(Some("workflow")).await.unwrap();
    assert_eq!(workflow, vec!["workflow-print"]);
}

#[tokio::test]
async fn batch_set_tags_applies_to_every_path() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let b = fx.file("b.jpg", 100);
    fx.store
        .batch_ensure_records_exist(&[a.clone(), b.clone()])
        .await
        .unwrap();

    let written = fx
        .store
        .batch_set_tags(&[a.clone(), b.clone()], &["pick".into()])
        .await
        .unwrap();
    assert_eq!(written, 2);
    let tags = fx.store.get_image_tags_batch(&[a, b]).await.unwrap();
    assert!(tags.values().all(|t| t == &vec!["pick".to_string()]));
}

#[tokio::test]
async fn move_records_renames_rows() {
    let fx = fixture().await;
    let old = fx.file("old.jpg", 100);
    fx.store.set_rating(&old, 4).await.unwrap();
    let new = fx.root.join("new.jpg").to_string_lossy().into_owned();

    let moved = fx
        .store
        .move_records(&[(old.clone(), new.clone())])
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert!(fx.store.get(&old).await.unwrap().is_none());
    let record = fx.store.get(&new).await.unwrap().unwrap();
    assert_eq!(record.rating, 4);
}

#[tokio::test]
async fn remove_records_unlinks_cache_files() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let thumb = fx.cache_file("t.jpg", 256);
    let view = fx.cache_file("v.jpg", 256);
    fx.store
        .set_thumbnail_paths(&a, Some(&thumb), Some(&view))
        .await
        .unwrap();

    let removed = fx.store.remove_records(&[a.clone()]).await.unwrap();
    assert_eq!(removed, 1);
    assert!(fx.store.get(&a).await.unwrap().is_none());
    assert!(!std::path::Path::new(&thumb).exists());
    assert!(!std::path::Path::new(&view).exists());
}

#[tokio::test]
async fn lru_eviction_removes_least_recently_accessed_first() {
    let fx = fixture().await;
    let mut paths = Vec::new();
    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        let source = fx.file(name, 64);
        let cache = fx.cache_file(&format!("cache_{name}"), 20 * 1024);
        fx.store
            .set_thumbnail_paths(&source, Some(&cache), None)
            .await
            .unwrap();
        paths.push((source, cache));
    }
    assert_eq!(fx.store.get_total_cache_size().await.unwrap(), 60 * 1024);

    // Establish the LRU order a < b < c by touching in sequence.
    for (source, _) in &paths {
        fx.store.preview_paths(source).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let freed = fx.store.evict_lru_cache(40 * 1024).await.unwrap();
    assert!(freed >= 20 * 1024);
    assert!(fx.store.get_total_cache_size().await.unwrap() <= 40 * 1024);

    // Exactly the oldest-accessed record went away.
    assert!(fx.store.get(&paths[0].0).await.unwrap().is_none());
    assert!(!std::path::Path::new(&paths[0].1).exists());
    assert!(fx.store.get(&paths[1].0).await.unwrap().is_some());
    assert!(fx.store.get(&paths[2].0).await.unwrap().is_some());
}

#[tokio::test]
async fn preview_reads_touch_the_lru_clock() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let thumb = fx.cache_file("t.jpg", 100);
    fx.store
        .set_thumbnail_paths(&a, Some(&thumb), None)
        .await
        .unwrap();
    let before = fx.store.get(&a).await.unwrap().unwrap().accessed_at;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    fx.store.preview_paths(&a).await.unwrap();
    let after = fx.store.get(&a).await.unwrap().unwrap().accessed_at;
    assert!(after > before, "cache-path reads must update accessed_at");
}

#[tokio::test]
async fn fast_and_full_metadata_tiers() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let thumb = fx.cache_file("t.jpg", 100);
    fx.store
        .set_thumbnail_paths(&a, Some(&thumb), None)
        .await
        .unwrap();

    assert!(fx.store.needs_full_metadata(&a).await.unwrap());

    fx.store
        .apply_fast_metadata(
            &a,
            &FastMetadata {
                orientation: Some(6),
                rating: Some(3),
            },
        )
        .await
        .unwrap();
    let record = fx.store.get(&a).await.unwrap().unwrap();
    assert_eq!(record.orientation, Some(6));
    assert_eq!(record.rating, 3);
    // Fast tier never clobbers cache paths.
    assert_eq!(record.thumbnail_path.as_deref(), Some(thumb.as_str()));
    assert!(fx.store.needs_full_metadata(&a).await.unwrap());

    let full = FullMetadata {
        width: Some(6000),
        height: Some(4000),
        camera_make: Some("Canon".into()),
        camera_model: Some("EOS R5".into()),
        iso: Some(400),
        exif_data: serde_json::json!({"Make": "Canon"}),
        ..FullMetadata::default()
    };
    fx.store.store_full_metadata(&a, &full).await.unwrap();
    assert!(!fx.store.needs_full_metadata(&a).await.unwrap());

    let record = fx.store.get(&a).await.unwrap().unwrap();
    assert_eq!(record.width, Some(6000));
    assert_eq!(record.camera_make.as_deref(), Some("Canon"));
    assert_eq!(record.iso, Some(400));
    // Deep tier without a rating keeps the sidecar-derived one.
    assert_eq!(record.rating, 3);
    assert_eq!(record.thumbnail_path.as_deref(), Some(thumb.as_str()));
}

#[tokio::test]
async fn ensure_records_is_idempotent() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    let b = fx.file("b.jpg", 100);

    assert_eq!(
        fx.store
            .batch_ensure_records_exist(&[a.clone(), b.clone()])
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        fx.store
            .batch_ensure_records_exist(&[a.clone(), b.clone()])
            .await
            .unwrap(),
        0
    );

    fx.store.set_rating(&a, 5).await.unwrap();
    fx.store.batch_ensure_records_exist(&[a.clone()]).await.unwrap();
    // Re-ensuring must not reset existing data.
    assert_eq!(fx.store.get_rating(&a).await.unwrap(), 5);
}

#[tokio::test]
async fn content_hash_attaches_to_existing_rows() {
    let fx = fixture().await;
    let a = fx.file("a.jpg", 100);
    fx.store.batch_ensure_records_exist(&[a.clone()]).await.unwrap();

    assert!(fx.store.get(&a).await.unwrap().unwrap().content_hash.is_none());
    fx.store.set_content_hash(&a, "abc123").await.unwrap();
    assert_eq!(
        fx.store.get(&a).await.unwrap().unwrap().content_hash.as_deref(),
        Some("abc123")
    );
}
