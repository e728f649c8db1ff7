use anyhow::{anyhow, Result};
use dialoguer::{theme::ColorfulTheme, Input, Select};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::analysis::ComplexityThresholds;
use crate::collector::DEFAULT_BINARY_THRESHOLD;
use crate::openai::ClientSettings;

const CONFIG_FILE: &str = ".codeinsight.yml";
const GLOBAL_CONFIG_DIR: &str = ".config/codeinsight";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Thresholds {
    /// 前 1 KiB 中非可列印位元組超過此比例即視為二進位檔
    #[serde(default = "default_binary_threshold")]
    pub binary_ratio: f64,
    #[serde(default)]
    pub complexity: ComplexityThresholds,
}

fn default_binary_threshold() -> f64 {
    DEFAULT_BINARY_THRESHOLD
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            binary_ratio: DEFAULT_BINARY_THRESHOLD,
            complexity: ComplexityThresholds::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub cache_url: Option<String>,
    #[serde(default)]
    pub ingest_dir: Option<PathBuf>,
    /// ingestion 工具的執行指令（程式與固定參數）
    #[serde(default = "default_ingest_command")]
    pub ingest_command: Vec<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub output: Option<String>,
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_ingest_command() -> Vec<String> {
    vec!["python3".to_string(), "repository-ingest.py".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            client: ClientSettings::default(),
            cache_url: None,
            ingest_dir: None,
            ingest_command: default_ingest_command(),
            thresholds: Thresholds::default(),
            output: None,
        }
    }
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            // 專案沒有配置時改用全局配置
            if let Some(global_config) = Self::load_global()? {
                Ok(global_config)
            } else {
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_yaml::to_string(self)?;
        fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn load_global() -> Result<Option<Self>> {
        if let Some(home) = dirs::home_dir() {
            let global_config_path = home.join(GLOBAL_CONFIG_DIR).join(CONFIG_FILE);
            if global_config_path.exists() {
                let content = fs::read_to_string(&global_config_path)?;
                Ok(Some(serde_yaml::from_str(&content)?))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }

    pub fn save_global(&self) -> Result<()> {
        if let Some(home) = dirs::home_dir() {
            let global_config_dir = home.join(GLOBAL_CONFIG_DIR);
            fs::create_dir_all(&global_config_dir)?;
            let global_config_path = global_config_dir.join(CONFIG_FILE);
            let content = serde_yaml::to_string(self)?;
            fs::write(&global_config_path, content)?;
            Ok(())
        } else {
            Err(anyhow!("無法找到使用者主目錄"))
        }
    }

    /// 預設的 ingestion 輸出目錄：~/.cache/codeinsight 或系統暫存目錄
    pub fn ingest_dir(&self) -> PathBuf {
        if let Some(dir) = &self.ingest_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("codeinsight")
    }
}

pub async fn configure_interactive(project_dir: &Path, global: bool) -> Result<()> {
    let theme = ColorfulTheme::default();
    let current_config = if global {
        Config::load_global()?.unwrap_or_default()
    } else {
        Config::load(project_dir)?
    };
    println!("\n🔧 CodeInsight 配置設定");
    println!("==================");
    if global {
        println!("正在設定全局配置\n");
    } else {
        println!("正在設定專案配置\n");
    }
    let api_url: String = Input::with_theme(&theme)
        .with_prompt("API URL")
        .with_initial_text(&current_config.api_url)
        .interact_text()?;
    let api_key: String = Input::with_theme(&theme)
        .with_prompt("API Key")
        .with_initial_text(&current_config.api_key)
        .interact_text()?;
    let cache_url: String = Input::with_theme(&theme)
        .with_prompt("Cache URL（留空使用記憶體快取）")
        .with_initial_text(current_config.cache_url.clone().unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;
    let models = match crate::openai::get_available_models(&api_url, &api_key).await {
        Ok(models) if !models.is_empty() => {
            info!("成功獲取可用模型列表");
            models
        }
        Ok(_) | Err(_) => {
            warn!("無法獲取模型列表，使用預設列表");
            vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gpt-3.5-turbo".to_string(),
            ]
        }
    };
    let default_index = models
        .iter()
        .position(|m| m == &current_config.model)
        .unwrap_or(0);
    let model_index = Select::with_theme(&theme)
        .with_prompt("選擇模型")
        .default(default_index)
        .items(&models)
        .interact()?;
    let new_config = Config {
        api_url,
        api_key,
        model: models[model_index].clone(),
        cache_url: if cache_url.trim().is_empty() {
            None
        } else {
            Some(cache_url.trim().to_string())
        },
        ..current_config
    };
    if global {
        new_config.save_global()?;
        info!("已更新全局配置");
    } else {
        new_config.save(project_dir)?;
        info!("已更新專案配置");
    }
    Ok(())
}

pub fn init_project(project_dir: &Path) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(anyhow!("配置文件已存在：{}", config_path.display()));
    }
    let config = Config::default();
    config.save(project_dir)?;
    info!("已創建配置文件：{}", config_path.display());
    // 配置含 API key，加入 .gitignore
    let gitignore_path = project_dir.join(".gitignore");
    if gitignore_path.exists() {
        let mut content = fs::read_to_string(&gitignore_path)?;
        if !content.contains(CONFIG_FILE) {
            if !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(CONFIG_FILE);
            content.push('\n');
            fs::write(&gitignore_path, content)?;
            info!("已將 {} 添加到 .gitignore", CONFIG_FILE);
        }
    } else {
        fs::write(&gitignore_path, format!("{}\n", CONFIG_FILE))?;
        info!("已創建 .gitignore 並添加 {}", CONFIG_FILE);
    }
    Ok(())
}

/// 讀取有效配置；API key 為空時以環境變數補上
pub fn get_effective_config(project_dir: &Path) -> Result<Config> {
    let mut config = Config::load(project_dir)?;
    if config.api_key.is_empty() {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.api_key = key;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_config_and_gitignore_entry() {
        let dir = TempDir::new().unwrap();
        init_project(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(CONFIG_FILE));
        assert!(init_project(dir.path()).is_err());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "api_url: http://localhost:8080/v1\napi_key: abc\nmodel: local\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.model, "local");
        assert_eq!(config.client.min_interval_ms, 1000);
        assert_eq!(config.thresholds.binary_ratio, DEFAULT_BINARY_THRESHOLD);
        assert_eq!(config.thresholds.complexity.low_max_lines, 100.0);
    }

    #[test]
    fn saved_config_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            cache_url: Some("redis://127.0.0.1:6379".to_string()),
            ..Config::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.cache_url.as_deref(), Some("redis://127.0.0.1:6379"));
    }
}
