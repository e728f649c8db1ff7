use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::analysis::language_for_path;
use crate::collector::FilterConfig;
use crate::error::IngestError;
use crate::models::FileEntry;

const METADATA_SUFFIX: &str = "_metadata.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ArtifactFiles {
    pub summary: String,
    pub tree: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStats {
    pub summary_length: usize,
    pub tree_length: usize,
    pub content_length: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngestMetadata {
    pub repository_id: String,
    /// 工具寫入的原始時間字串
    pub processed_at: String,
    pub files: ArtifactFiles,
    pub stats: ArtifactStats,
}

#[derive(Debug, Clone)]
pub struct IngestedRepository {
    pub id: String,
    pub summary: String,
    pub tree: String,
    pub content: String,
    pub metadata: Option<IngestMetadata>,
}

/// 由路徑或 clone URL 推導倉庫 id：目錄名稱，或去掉 `.git` 的最後一段 URL
pub fn derive_repo_id(repo: &str) -> String {
    let path = Path::new(repo);
    if path.is_dir() {
        let name = fs::canonicalize(path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if let Some(name) = name {
            return name;
        }
    }
    let last = repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(repo);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// id 只能是單一檔名片段
fn validate_id(id: &str) -> Result<(), IngestError> {
    if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\']) {
        return Err(IngestError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// ingestion 工具的輸出目錄，每個 id 有 `{id}_summary.txt`、`{id}_tree.txt`、
/// `{id}_content.txt` 與 `{id}_metadata.json`
#[derive(Debug, Clone)]
pub struct IngestStore {
    dir: PathBuf,
}

impl IngestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact(&self, id: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, suffix))
    }

    /// 讀取三個文字檔，以及存在時的 metadata
    pub fn load(&self, id: &str) -> Result<IngestedRepository, IngestError> {
        validate_id(id)?;
        let summary_path = self.artifact(id, "_summary.txt");
        let tree_path = self.artifact(id, "_tree.txt");
        let content_path = self.artifact(id, "_content.txt");
        if ![&summary_path, &tree_path, &content_path]
            .iter()
            .all(|p| p.is_file())
        {
            return Err(IngestError::NotProcessed(id.to_string()));
        }

        let metadata_path = self.artifact(id, METADATA_SUFFIX);
        let metadata = if metadata_path.is_file() {
            let raw = fs::read_to_string(&metadata_path)?;
            Some(serde_json::from_str(&raw)?)
        } else {
            debug!(id, "沒有 metadata 記錄");
            None
        };

        Ok(IngestedRepository {
            id: id.to_string(),
            summary: fs::read_to_string(&summary_path)?,
            tree: fs::read_to_string(&tree_path)?,
            content: fs::read_to_string(&content_path)?,
            metadata,
        })
    }

    /// 有 metadata 記錄的 id，已排序
    pub fn list_repositories(&self) -> Result<Vec<String>, IngestError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(METADATA_SUFFIX)) {
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// metadata 檔最近被寫入的 id；同時間取字母序較後者
    pub fn latest_repository(&self) -> Result<Option<String>, IngestError> {
        let mut latest: Option<(SystemTime, String)> = None;
        for id in self.list_repositories()? {
            let modified = fs::metadata(self.artifact(&id, METADATA_SUFFIX))?.modified()?;
            if latest.as_ref().map_or(true, |(time, _)| modified >= *time) {
                latest = Some((modified, id));
            }
        }
        Ok(latest.map(|(_, id)| id))
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line.len() >= 3 && line.chars().all(|c| c == '=')
}

/// 把合併的內容摘要切回檔案；每個檔案以夾在 `=` 分隔線之間的 `File: <path>` 開頭，
/// 不符路徑規則或超過大小上限的略過
pub fn split_content(content: &str, filters: &FilterConfig) -> Vec<FileEntry> {
    let lines: Vec<&str> = content.lines().collect();
    let mut headers = Vec::new();
    let mut i = 0;
    while i + 2 < lines.len() {
        let path = lines[i + 1].trim().strip_prefix("File:").map(str::trim);
        match path {
            Some(path) if is_separator(lines[i]) && is_separator(lines[i + 2]) => {
                headers.push((i, path.to_string()));
                i += 3;
            }
            _ => i += 1,
        }
    }

    let mut files = Vec::new();
    for (n, (start, path)) in headers.iter().enumerate() {
        let end = headers.get(n + 1).map_or(lines.len(), |(next, _)| *next);
        let body = lines[start + 3..end].join("\n");
        let body = body.trim_matches('\n').to_string();
        let path = path.trim_start_matches("./").trim_start_matches('/').to_string();

        if let Some(reason) = filters.skip_path(&path) {
            debug!(path = %path, reason, "略過 ingestion 檔案");
            continue;
        }
        if body.len() as u64 > filters.max_file_size {
            debug!(path = %path, reason = "檔案過大", "略過 ingestion 檔案");
            continue;
        }
        files.push(FileEntry {
            language: language_for_path(&path).map(str::to_string),
            size: body.len() as u64,
            path,
            content: body,
        });
    }
    files
}

/// 執行 ingestion 工具並讀回它的輸出
#[derive(Debug, Clone)]
pub struct IngestRunner {
    command: Vec<String>,
    store: IngestStore,
}

impl IngestRunner {
    /// `command`：程式名稱加上固定的前置參數
    pub fn new(command: Vec<String>, store: IngestStore) -> Self {
        Self { command, store }
    }

    pub fn store(&self) -> &IngestStore {
        &self.store
    }

    pub async fn run(&self, repo: &str, id: Option<&str>) -> Result<IngestedRepository, IngestError> {
        let id = id.map_or_else(|| derive_repo_id(repo), str::to_string);
        validate_id(&id)?;
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| IngestError::Subprocess {
                status: "not started".to_string(),
                stderr: "ingestion command is empty".to_string(),
            })?;

        fs::create_dir_all(self.store.dir())?;
        info!(repo, id = %id, "執行 ingestion 工具");
        let output = Command::new(program)
            .args(leading)
            .arg("--repo")
            .arg(repo)
            .arg("--repo-id")
            .arg(&id)
            .arg("--output-dir")
            .arg(self.store.dir())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(repo, status = %output.status, "ingestion 工具執行失敗");
            return Err(IngestError::Subprocess {
                status: output.status.to_string(),
                stderr,
            });
        }
        self.store.load(&id)
    }
}
