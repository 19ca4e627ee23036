use sign_stream::core_modules::reconciler::DEFAULT_VIDEO_FPS;
use sign_stream::protocol::MediaKind;
use sign_stream::{Detection, DetectionPayload, DetectionReconciler, SessionConfig, UploadClient};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: playback_tester <media_path> [step_ms]");
        return Ok(());
    }
    let media_path = Path::new(&args[1]);
    let step_ms: u64 = match args.get(2) {
        Some(raw) => raw.parse()?,
        None => 500,
    };

    // --- 2. Upload ---
    let client = UploadClient::from_config(&SessionConfig::from_env());
    let result = client.upload(media_path).await?;

    let kind = match result.kind {
        Some(MediaKind::Video) => "video",
        Some(MediaKind::Image) => "image",
        None => "unknown",
    };
    println!("Uploaded {} ({kind})", media_path.display());
    println!("Annotated result: {}", client.result_url());
    if let Some(sentence) = &result.sentence {
        println!("Sentence: {sentence}");
    }

    // --- 3. Reconciliation along the playback clock ---
    let mut reconciler = DetectionReconciler::new();
    let update = reconciler.apply(&result);

    let Some(DetectionPayload::Timed(frames)) = &result.detections else {
        println!("{}", describe(update.detections.as_deref().unwrap_or_default()));
        return Ok(());
    };

    let fps = reconciler.timeline_fps().unwrap_or(DEFAULT_VIDEO_FPS);
    let duration = frames
        .iter()
        .map(|frame| frame.timestamp.max(frame.frame_number as f64 / fps))
        .fold(0.0_f64, f64::max);
    println!("{} timed frames at {fps} fps, {duration:.2}s", frames.len());

    let step = step_ms.max(1) as f64 / 1000.0;
    let mut time = 0.0;
    while time <= duration + f64::EPSILON {
        let detections = reconciler.seek(time).unwrap_or_default();
        println!("t={time:>7.3}s  {}", describe(&detections));
        time += step;
    }

    Ok(())
}

fn describe(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return "-".to_string();
    }
    detections
        .iter()
        .map(|d| format!("{} ({:.0}%)", d.class_name, d.confidence * 100.0))
        .collect::<Vec<_>>()
        .join(", ")
}
