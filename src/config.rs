//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリの `config.toml` に接続先・リアルタイム・ログ設定を保存する。
//! セクションを省略した場合はデフォルト値になる。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::api::{BackendEndpoint, RealtimeConfig};
use crate::models::UserId;

/// バックエンド接続設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// プロジェクトURL（例: https://xyz.supabase.co）
    pub url: String,
    pub anon_key: String,
    /// ログイン済みユーザーのアクセストークン
    pub access_token: Option<String>,
    /// ログイン済みユーザーのID
    pub user_id: Option<String>,
}

impl BackendConfig {
    /// 接続先を組み立てる（URL・キー未設定ならエラー）
    pub fn endpoint(&self) -> Result<BackendEndpoint> {
        if self.url.trim().is_empty() {
            anyhow::bail!("backend.url is not configured");
        }
        if self.anon_key.trim().is_empty() {
            anyhow::bail!("backend.anon_key is not configured");
        }

        let endpoint = BackendEndpoint::new(self.url.trim(), self.anon_key.trim());
        Ok(match &self.access_token {
            Some(token) if !token.trim().is_empty() => endpoint.with_access_token(token.trim()),
            _ => endpoint,
        })
    }

    pub fn user(&self) -> Option<UserId> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| UserId(id.to_string()))
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// 設定管理マネージャー
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 新しい設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 任意のパスを使う（テスト・`--config` 指定用）
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("app", "speedheart", "speedheart")
            .context("Failed to get project directories")
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    fn get_config_path() -> Result<PathBuf> {
        let config_file = Self::project_dirs()?.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());
        Ok(config_file)
    }

    /// デフォルトのログディレクトリ
    pub fn default_log_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().join("logs"))
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );
        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }

    pub fn get_config_file_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// 設定をリセット（デフォルト値に戻す）
    pub fn reset_config(&self) -> Result<()> {
        self.save_config(&AppConfig::default())?;
        info!("🔄 Configuration reset to defaults");
        Ok(())
    }

    pub fn config_exists(&self) -> bool {
        self.config_path.exists()
    }

    /// 設定ファイルをバックアップ
    pub fn backup_config(&self) -> Result<PathBuf> {
        if !self.config_path.exists() {
            return Err(anyhow::anyhow!("Config file does not exist"));
        }

        let backup_path = self.config_path.with_extension("toml.bak");
        fs::copy(&self.config_path, &backup_path)
            .with_context(|| format!("Failed to backup config to: {}", backup_path.display()))?;

        info!("📋 Configuration backed up to: {}", backup_path.display());
        Ok(backup_path)
    }
}
