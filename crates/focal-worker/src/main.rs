//! Focal point worker binary.
//!
//! Speaks newline-delimited JSON on stdin/stdout; logs go to stderr.

use std::io::{self, BufWriter};

use focal_vision::VisionConfig;
use focal_worker::{init_tracing, worker};
use tracing::info;

fn main() {
    dotenvy::dotenv().ok();
    init_tracing("focal=info,ort=warn");
    worker::install_panic_hook();

    let config = VisionConfig::from_env();
    info!(
        face_model = ?config.face.model_path,
        cascade_model = ?config.face.cascade_model_path,
        "Starting focal-worker"
    );

    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    let exit = worker::run(stdin, stdout, &config);

    info!(?exit, "Worker stopped");
    std::process::exit(exit.code());
}
