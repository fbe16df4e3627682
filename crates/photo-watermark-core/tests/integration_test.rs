//! End-to-end tests for the export engine

use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use photo_watermark_core::{
    version, AppConfig, ExportPolicy, ExportRequest, ExportService, JobSnapshot, JobStatus,
    LocalStorage, NamingRule, OutputFormat, RetentionPolicy, SourceFile,
    StorageRoot, StrokeStyle, SystemFontCatalog, TextWatermark, WatermarkSpec,
};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const POLL: Duration = Duration::from_millis(10);

fn service(config: AppConfig) -> (ExportService, TempDir) {
    let dir = tempdir().unwrap();
    let storage: Arc<dyn StorageRoot> = Arc::new(LocalStorage::with_fallback(None, dir.path().join("storage")));
    let fonts = SystemFontCatalog::embedded_only().unwrap().into_shared();
    (ExportService::with_parts(&config, storage, fonts), dir)
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

fn policy(output_dir: &Path) -> ExportPolicy {
    ExportPolicy {
        output_dir: Some(output_dir.to_path_buf()),
        format: OutputFormat::Png,
        ..Default::default()
    }
}

fn sample_text() -> WatermarkSpec {
    WatermarkSpec::text(TextWatermark {
        opacity: Some(80.0),
        ..TextWatermark::new("Sample")
    })
}

async fn run(service: &ExportService, files: Vec<SourceFile>, request: ExportRequest) -> JobSnapshot {
    let submitted = service.jobs.submit(files, request).await.unwrap();
    service.jobs.wait_for_terminal(submitted.id, POLL).await.unwrap()
}

fn assert_counters(snapshot: &JobSnapshot) {
    assert_eq!(snapshot.processed_files, snapshot.success_count + snapshot.failure_count);
    assert!(snapshot.processed_files <= snapshot.total_files);
    assert_eq!(snapshot.results.len(), snapshot.processed_files);
    assert!((0.0..=1.0).contains(&snapshot.progress));
    assert!(snapshot.updated_at >= snapshot.created_at);
}

#[test]
fn test_version_info() {
    assert_eq!(version(), "0.1.0");
}

#[tokio::test]
async fn test_three_images_with_text_watermark() {
    let (service, dir) = service(AppConfig::default());
    let files = (1..=3)
        .map(|i| SourceFile::new(format!("photo{}.png", i), png(120, 80)))
        .collect();
    let request = ExportRequest {
        watermark_config: Some(sample_text()),
        export_config: Some(policy(dir.path())),
    };

    let done = run(&service, files, request).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.total_files, 3);
    assert_eq!(done.success_count, 3);
    assert_eq!(done.failure_count, 0);
    assert_eq!(done.progress, 1.0);
    assert_eq!(done.message.as_deref(), Some("All files exported successfully"));
    assert!(done.current_file.is_none());
    assert_counters(&done);

    let mut names: Vec<String> = done.results.iter().filter_map(|r| r.output_name.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3);
    for name in &names {
        let written = image::open(done.output_directory.join(name)).unwrap();
        assert_eq!(written.dimensions(), (120, 80));
    }
}

#[tokio::test]
async fn test_undecodable_file_is_recorded_not_fatal() {
    let (service, dir) = service(AppConfig::default());
    let files = vec![
        SourceFile::new("good.png", png(40, 40)),
        SourceFile::new("bad.png", b"definitely not an image".to_vec()),
    ];
    let request = ExportRequest {
        watermark_config: None,
        export_config: Some(policy(dir.path())),
    };

    let done = run(&service, files, request).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.success_count, 1);
    assert_eq!(done.failure_count, 1);
    assert_eq!(done.message.as_deref(), Some("Completed with 1 failed file(s)"));
    assert_counters(&done);

    let bad = &done.results[1];
    assert_eq!(bad.source_name, "bad.png");
    assert!(!bad.success);
    assert!(bad.output_name.is_none());
    assert!(!bad.message.as_deref().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_oversized_stroke_does_not_break_batch() {
    let (service, dir) = service(AppConfig::default());
    let files = vec![
        SourceFile::new("first.png", png(200, 120)),
        SourceFile::new("second.png", png(200, 120)),
    ];
    let watermark = WatermarkSpec::text(TextWatermark {
        stroke: Some(StrokeStyle {
            color: Some("#FF0000".to_string()),
            width: Some(1e10),
        }),
        ..TextWatermark::new("Hi")
    });
    let request = ExportRequest {
        watermark_config: Some(watermark),
        export_config: Some(policy(dir.path())),
    };

    let done = tokio::time::timeout(Duration::from_secs(60), run(&service, files, request))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.success_count, 2);
    assert_counters(&done);
}

#[tokio::test]
async fn test_cancel_mid_batch() {
    let (service, dir) = service(AppConfig::default());
    let mut updates = service.jobs.subscribe();
    let files = (0..5)
        .map(|i| SourceFile::new(format!("big{}.png", i), png(1600, 1200)))
        .collect();
    let request = ExportRequest {
        watermark_config: Some(sample_text()),
        export_config: Some(policy(dir.path())),
    };

    let submitted = service.jobs.submit(files, request).await.unwrap();
    loop {
        let update = updates.recv().await.unwrap();
        if update.id == submitted.id && update.processed_files >= 2 {
            break;
        }
    }

    let cancelled = service.jobs.cancel(submitted.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(service.jobs.cancel(submitted.id).await.is_none());

    // The worker refines the message once it reaches the next file boundary.
    let observed = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let snapshot = service.jobs.get_status(submitted.id).await.unwrap();
            let refined = snapshot
                .message
                .as_deref()
                .is_some_and(|m| m.starts_with("Export cancelled after processing"));
            if refined {
                return snapshot;
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .unwrap();

    let done = observed;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(done.processed_files < 5);
    assert!(done.current_file.is_none());
    let files_written = std::fs::read_dir(&done.output_directory).unwrap().count();
    assert_eq!(files_written, done.success_count);
    assert_counters(&done);
}

#[tokio::test]
async fn test_resize_by_width_short_mode() {
    let (service, dir) = service(AppConfig::default());
    let request = ExportRequest {
        watermark_config: None,
        export_config: Some(ExportPolicy {
            resize: Some(serde_json::from_str(r#"{"mode":"w","width":200}"#).unwrap()),
            ..policy(dir.path())
        }),
    };

    let done = run(&service, vec![SourceFile::new("wide.png", png(400, 300))], request).await;
    let name = done.results[0].output_name.clone().unwrap();
    let written = image::open(done.output_directory.join(name)).unwrap();
    assert_eq!(written.dimensions(), (200, 150));
}

#[tokio::test]
async fn test_name_collisions_get_numeric_suffix() {
    let (service, dir) = service(AppConfig::default());
    let files = vec![
        SourceFile::new("a/name.png", png(10, 10)),
        SourceFile::new("b\\name.jpg", png(10, 10)),
        SourceFile::new("name.png", png(10, 10)),
    ];
    let request = ExportRequest {
        watermark_config: None,
        export_config: Some(policy(dir.path())),
    };

    let done = run(&service, files, request).await;
    let names: Vec<String> = done.results.iter().filter_map(|r| r.output_name.clone()).collect();
    assert_eq!(names, vec!["name.png", "name-1.png", "name-2.png"]);
    assert_eq!(done.results[1].source_name, "name.jpg");
}

#[tokio::test]
async fn test_jpeg_output_with_naming_rule() {
    let (service, dir) = service(AppConfig::default());
    let transparent = encode(
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]))),
        ImageFormat::Png,
    );
    let request = ExportRequest {
        watermark_config: None,
        export_config: Some(ExportPolicy {
            format: OutputFormat::Jpeg,
            jpeg_quality: Some(90),
            naming: Some(NamingRule {
                prefix: Some("wm_".to_string()),
                suffix: Some("_final".to_string()),
            }),
            ..policy(dir.path())
        }),
    };

    let done = run(&service, vec![SourceFile::new("holiday.png", transparent)], request).await;
    assert_eq!(done.results[0].output_name.as_deref(), Some("wm_holiday_final.jpg"));

    let written = image::open(done.output_directory.join("wm_holiday_final.jpg")).unwrap().to_rgb8();
    let centre = written.get_pixel(8, 8);
    assert!(centre.0.iter().all(|c| *c > 240), "transparent pixels flatten to white: {:?}", centre);
}

#[tokio::test]
async fn test_cancel_after_completion_is_rejected() {
    let (service, dir) = service(AppConfig::default());
    let request = ExportRequest {
        watermark_config: None,
        export_config: Some(policy(dir.path())),
    };

    let done = run(&service, vec![SourceFile::new("x.png", png(8, 8))], request).await;
    assert!(service.jobs.cancel(done.id).await.is_none());
    assert_eq!(service.jobs.get_status(done.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_list_and_retention() {
    let mut config = AppConfig::default();
    config.export.retention = RetentionPolicy::MaxFinished { max: 2 };
    let (service, dir) = service(config);

    let mut ids = Vec::new();
    for i in 0..4 {
        let request = ExportRequest {
            watermark_config: None,
            export_config: Some(policy(dir.path())),
        };
        let done = run(&service, vec![SourceFile::new(format!("{}.png", i), png(8, 8))], request).await;
        ids.push(done.id);
    }

    let listed: Vec<_> = service.jobs.list().await.into_iter().map(|s| s.id).collect();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0], ids[3]);
    assert!(!listed.contains(&ids[0]));
}

#[tokio::test]
async fn test_progress_updates_are_monotonic() {
    let (service, dir) = service(AppConfig::default());
    let mut updates = service.jobs.subscribe();
    let files = (0..4).map(|i| SourceFile::new(format!("{}.png", i), png(32, 32))).collect();
    let request = ExportRequest {
        watermark_config: Some(sample_text()),
        export_config: Some(policy(dir.path())),
    };
    let submitted = service.jobs.submit(files, request).await.unwrap();

    let mut last_processed = 0;
    let mut last_updated = submitted.updated_at;
    loop {
        let update = updates.recv().await.unwrap();
        if update.id != submitted.id {
            continue;
        }
        assert!(update.processed_files >= last_processed);
        assert!(update.updated_at >= last_updated);
        assert_eq!(update.created_at, submitted.created_at);
        assert_counters(&update);
        last_processed = update.processed_files;
        last_updated = update.updated_at;
        if update.is_terminal() {
            break;
        }
    }
    assert_eq!(last_processed, 4);
}
