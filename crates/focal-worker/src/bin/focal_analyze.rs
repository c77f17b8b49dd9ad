//! Run one image through a supervised worker and print the analysis.
//!
//! Usage: focal-analyze <image> [--debug] [--no-faces] [--overlay <out.jpg>]

use std::path::PathBuf;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use focal_models::ProcessingConfig;
use focal_vision::resolve;
use focal_worker::{init_tracing, HarnessConfig, WorkerHarness};

struct Args {
    image: PathBuf,
    options: ProcessingConfig,
    overlay: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut image = None;
    let mut options = ProcessingConfig::default();
    let mut overlay = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--debug" => options.debug_mode = true,
            "--no-faces" => options.face_detection_enabled = false,
            "--overlay" => {
                let path = args.next().context("--overlay needs a path")?;
                options.debug_mode = true;
                overlay = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            path if image.is_none() => image = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {}", extra),
        }
    }

    let image = image
        .context("usage: focal-analyze <image> [--debug] [--no-faces] [--overlay <out.jpg>]")?;
    Ok(Args {
        image,
        options,
        overlay,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("focal=info");

    let args = parse_args()?;
    let bytes = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let filename = args
        .image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let harness = WorkerHarness::start(HarnessConfig::from_env()).await?;
    let outcome = harness.process_image(bytes, &filename, args.options).await;
    harness.shutdown().await?;
    let result = outcome?;

    let focal_point = resolve(
        &result.faces,
        &result.interest_candidates,
        result.image_width as f64,
        result.image_height as f64,
        "no-detections",
    );

    if let (Some(path), Some(encoded)) = (&args.overlay, &result.debug_image) {
        let jpeg = STANDARD.decode(encoded).context("debug image is not base64")?;
        tokio::fs::write(path, jpeg)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let report = serde_json::json!({
        "file": filename,
        "focalPoint": focal_point,
        "fractions": focal_point.to_fractions(result.image_width as f64, result.image_height as f64),
        "result": result,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
