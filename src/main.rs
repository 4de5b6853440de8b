use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use screenwise_lib::{
    init_logging, DirectorySource, HttpVisionAnalyzer, LogSubscriber, Pipeline, PipelineConfig,
    PipelineController,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let Some(frames_dir) = env::args().nth(1) else {
        bail!("usage: screenwise <frames_dir>");
    };

    let config = match env::var("SCREENWISE_CONFIG") {
        Ok(path) => PipelineConfig::load(&path)?,
        Err(_) => PipelineConfig::default(),
    };

    let analyzer_timeout = config.analyzer_timeout();
    let mut builder = Pipeline::builder(config).subscriber(Arc::new(LogSubscriber));
    if let Ok(url) = env::var("SCREENWISE_ANALYZER_URL") {
        let model = env::var("SCREENWISE_ANALYZER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let mut analyzer = HttpVisionAnalyzer::new(url, model).with_timeout(analyzer_timeout);
        if let Ok(key) = env::var("SCREENWISE_API_KEY") {
            analyzer = analyzer.with_api_key(key);
        }
        builder = builder.analyzer(Arc::new(analyzer));
    } else {
        log::info!("SCREENWISE_ANALYZER_URL not set, every batch uses the local fallback");
    }
    let pipeline = Arc::new(builder.build().context("Invalid pipeline config")?);

    let source = DirectorySource::open(&frames_dir)?;
    log::info!("Replaying {} frame(s) from {}", source.remaining(), frames_dir);

    let mut controller = PipelineController::new(Arc::clone(&pipeline));
    controller.start(Box::new(source))?;

    let interrupted = tokio::select! {
        result = controller.wait_for_capture() => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        log::info!("Interrupted, draining");
        controller.drain();
    }
    controller.stop().await?;

    let report = pipeline.report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
