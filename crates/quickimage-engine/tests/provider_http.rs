use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use quickimage_contracts::runs::{FailureKind, GenerationRequest, PostProcessOptions};
use quickimage_engine::poller::JobState;
use quickimage_engine::{Engine, EngineConfig, GenerationError, PollPolicy, ProviderConfig, VideoRequest};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn png_bytes(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        if x > width / 3 && x < 2 * width / 3 && y > height / 3 && y < 2 * height / 3 {
            Rgb([10, 120, 30])
        } else {
            Rgb([250, 250, 250])
        }
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn engine_for(server: &MockServer, image_dir: &Path) -> Engine {
    let mut config = EngineConfig::new(image_dir);
    config.openai = ProviderConfig::new(format!("{}/v1", server.uri())).with_api_key("test-key");
    config.stability = ProviderConfig::new(server.uri()).with_api_key("test-key");
    config.poll = PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts: Some(50),
        timeout: None,
    };
    Engine::new(config)
}

fn dir_entries(dir: &Path) -> anyhow::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();
    Ok(names)
}

#[tokio::test]
async fn dall_e_3_downloads_temporary_url_and_keeps_revised_prompt() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created": 1,
            "data": [{
                "url": format!("{}/files/generated.png", server.uri()),
                "revised_prompt": "A bright red bicycle leaning on a wall",
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/generated.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes(16, 16)?, "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let result = engine
        .generate(&GenerationRequest::new("b1", "dall-e-3", "a red bicycle"))
        .await;

    assert!(result.succeeded, "{:?}", result.error);
    assert_eq!(
        result.revised_prompt.as_deref(),
        Some("A bright red bicycle leaning on a wall")
    );
    assert!(result
        .temporary_remote_url
        .as_deref()
        .is_some_and(|url| url.ends_with("/files/generated.png")));

    let metadata = engine.read_metadata("b1").await?;
    assert_eq!(metadata.prompt, "a red bicycle");
    assert_eq!(metadata.model, "dall-e-3");
    assert_eq!(metadata.size.as_deref(), Some("1024x1024"));
    assert_eq!(metadata.style.as_deref(), Some("vivid"));
    assert_eq!(metadata.quality.as_deref(), Some("standard"));
    assert_eq!(dir_entries(temp.path())?, ["b1.json", "b1.png"]);
    Ok(())
}

#[tokio::test]
async fn stability_rejection_surfaces_status_and_writes_nothing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"errors": ["prompt is not allowed"]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let result = engine
        .generate(&GenerationRequest::new("b2", "stabilitydiffusion-3", "forbidden"))
        .await;

    assert!(!result.succeeded);
    let report = result.error.clone().unwrap_or_else(|| panic!("failure report expected"));
    assert_eq!(report.kind, FailureKind::ProviderRejected);
    assert!(report.message.starts_with("Error: stability request failed (400)"));
    assert!(report.message.contains("prompt is not allowed"));
    assert!(dir_entries(temp.path())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_key_fails_before_any_request() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = EngineConfig::new(temp.path());
    config.stability = ProviderConfig::new(server.uri()).with_api_key("   ");
    let engine = Engine::new(config);
    let result = engine
        .generate(&GenerationRequest::new("b3", "stable-image-core", "a fox"))
        .await;

    assert_eq!(result.error.map(|report| report.kind), Some(FailureKind::MissingCredentials));
    assert!(dir_entries(temp.path())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_option_is_rejected_before_the_network() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let request = GenerationRequest::new("b4", "dall-e-3", "a fox").with_provider_options(
        quickimage_contracts::runs::ProviderOptions {
            quality: Some("ultra".to_string()),
            ..Default::default()
        },
    );
    let result = engine.generate(&request).await;
    assert_eq!(result.error.map(|report| report.kind), Some(FailureKind::InvalidRequest));
    Ok(())
}

#[tokio::test]
async fn failed_background_removal_still_reports_success() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/core"))
        .and(header("accept", "image/*"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"not actually a png".to_vec(), "image/png"),
        )
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let request = GenerationRequest::new("b5", "stable-image-core", "a teapot").with_post_process(
        PostProcessOptions {
            remove_background_keep_original: true,
            ..PostProcessOptions::default()
        },
    );
    let result = engine.generate(&request).await;

    assert!(result.succeeded, "{:?}", result.error);
    assert!(result.error.is_none());
    assert!(result.background_removed_path.is_none());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(dir_entries(temp.path())?, ["b5.json", "b5.png"]);

    let metadata = engine.read_metadata("b5").await?;
    assert_eq!(metadata.warnings, result.warnings);
    assert_eq!(metadata.aspect_ratio.as_deref(), Some("1:1"));
    Ok(())
}

#[tokio::test]
async fn stability_jpeg_output_uses_response_mime_for_extension() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    let mut jpeg = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(8, 8)).write_to(&mut jpeg, ImageFormat::Jpeg)?;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(jpeg.into_inner(), "image/jpeg"))
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let request = GenerationRequest::new("b6", "stabilitydiffusion-3", "night sky")
        .with_provider_options(quickimage_contracts::runs::ProviderOptions {
            output_format: Some("jpeg".to_string()),
            ..Default::default()
        })
        .with_post_process(PostProcessOptions {
            save_jpeg_copy: true,
            ..PostProcessOptions::default()
        });
    let result = engine.generate(&request).await;

    assert!(result.succeeded, "{:?}", result.error);
    assert_eq!(result.artifact_path, Some(temp.path().join("b6.jpg")));
    assert_eq!(result.jpeg_path, result.artifact_path);
    assert_eq!(engine.read_metadata("b6").await?.format, "jpg");
    Ok(())
}

#[tokio::test]
async fn retry_in_another_format_replaces_every_earlier_file() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;

    let mut jpeg = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(8, 8)).write_to(&mut jpeg, ImageFormat::Jpeg)?;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes(24, 24)?, "image/png"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(jpeg.into_inner(), "image/jpeg"))
        .mount(&server)
        .await;

    let engine = engine_for(&server, temp.path());
    let first = engine
        .generate(
            &GenerationRequest::new("a1", "stabilitydiffusion-3", "a lighthouse").with_post_process(
                PostProcessOptions {
                    remove_background_keep_original: true,
                    ..PostProcessOptions::default()
                },
            ),
        )
        .await;
    assert!(first.succeeded, "{:?}", first.error);
    assert_eq!(
        dir_entries(temp.path())?,
        ["a1-background-removed.png", "a1.json", "a1.png"]
    );

    let retry = engine
        .generate(
            &GenerationRequest::new("a1", "stabilitydiffusion-3", "a lighthouse").with_provider_options(
                quickimage_contracts::runs::ProviderOptions {
                    output_format: Some("jpeg".to_string()),
                    ..Default::default()
                },
            ),
        )
        .await;
    assert!(retry.succeeded, "{:?}", retry.error);
    assert_eq!(dir_entries(temp.path())?, ["a1.jpg", "a1.json"]);

    let metadata = engine.read_metadata("a1").await?;
    assert_eq!(metadata.format, "jpg");
    assert_eq!(metadata.background_removed_path, None);
    assert_eq!(engine.list_newest(10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn video_job_polls_until_complete() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;
    let source = temp.path().join("still.png");
    std::fs::write(&source, png_bytes(64, 48)?)?;
    let image_dir = temp.path().join("images");

    Mock::given(method("POST"))
        .and(path("/v2beta/image-to-video"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "job-42"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2beta/image-to-video/result/job-42"))
        .and(header("accept", "video/*"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"status": "in-progress"})))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2beta/image-to-video/result/job-42"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"fake-mp4".to_vec(), "video/mp4"))
        .mount(&server)
        .await;

    let engine = engine_for(&server, &image_dir);
    let result = engine
        .generate_video(&VideoRequest {
            id: "v1".to_string(),
            source_image: source,
        })
        .await?;

    assert_eq!(result.job_id, "job-42");
    assert_eq!(result.attempts, 3);
    assert_eq!(
        result.states,
        [JobState::Submitted, JobState::Polling, JobState::Complete]
    );
    assert_eq!(std::fs::read(&result.video_path)?, b"fake-mp4");
    assert_eq!(dir_entries(&image_dir)?, ["v1.mp4"]);
    assert!(engine.list_newest(50).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn video_job_error_status_fails_after_one_poll() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir()?;
    let source = temp.path().join("still.png");
    std::fs::write(&source, png_bytes(32, 32)?)?;

    Mock::given(method("POST"))
        .and(path("/v2beta/image-to-video"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "job-7"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2beta/image-to-video/result/job-7"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, &temp.path().join("images"));
    let err = engine
        .generate_video(&VideoRequest {
            id: "v2".to_string(),
            source_image: source,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GenerationError::PollingFailed { status: 500, ref body, .. } if body == "upstream exploded"
    ));
    assert!(!temp.path().join("images").join("v2.mp4").exists());
    Ok(())
}
