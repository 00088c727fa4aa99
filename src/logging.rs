//! ログ初期化
//!
//! コンソールへは常にcompact形式で出力し、設定で有効なら日次ローテーションの
//! ファイルにも書き出す。ファイル出力時に返す `WorkerGuard` はプロセス終了まで保持すること。

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{ConfigManager, LogConfig};

/// ログファイル名の接頭辞（`speedheart.log.YYYY-MM-DD`）
pub const LOG_FILE_PREFIX: &str = "speedheart.log";

/// `RUST_LOG` があればそれを、なければ設定のログレベルを使う
pub fn build_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level)
            .or_else(|_| EnvFilter::try_new("info"))
            .map_err(|e| anyhow::anyhow!("Invalid log filter: {}", e)),
    }
}

/// ファイル出力先ディレクトリ
pub fn resolve_log_dir(config: &LogConfig) -> anyhow::Result<PathBuf> {
    match &config.log_dir {
        Some(dir) => Ok(dir.clone()),
        None => ConfigManager::default_log_dir(),
    }
}

/// ログを初期化する
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = build_filter(config)?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = if config.enable_file_logging {
        let log_dir = resolve_log_dir(config)?;
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create log directory {}: {}", log_dir.display(), e)
        })?;

        let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.enable_file_logging {
        tracing::info!("📝 File logging enabled ({})", LOG_FILE_PREFIX);
    }
    Ok(guard)
}
