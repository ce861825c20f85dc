use apipe_engine::{check_ffmpeg, check_ffprobe, FfmpegEngine};
use apipe_storage::{LocalPayloadStore, S3Config};
use apipe_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with profile={} concurrency={}",
        config.profile, config.concurrency
    );

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    ensure_ffmpeg().await?;
    ensure_storage().await?;
    if !config.profile.uses_in_memory_backends() {
        ensure_env_present(&["REDIS_URL"])?;
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_ffmpeg() -> anyhow::Result<()> {
    check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    check_ffprobe().map_err(|e| anyhow::anyhow!("ffprobe not available: {}", e))?;

    let engine = FfmpegEngine::detect().await?;
    println!("worker-selfcheck: engine {}", apipe_engine::AudioEngine::version(&engine));
    Ok(())
}

async fn ensure_storage() -> anyhow::Result<()> {
    if S3Config::is_configured() {
        S3Config::from_env()?;
        println!("worker-selfcheck: using S3 payload storage");
    } else {
        let store = LocalPayloadStore::from_env();
        store.ensure_dirs().await?;
        println!(
            "worker-selfcheck: using local payload storage at {} and {}",
            store.uploads_dir().display(),
            store.exports_dir().display()
        );
    }
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
