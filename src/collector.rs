use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::analysis::language_for_path;
use crate::models::FileEntry;

/// 判斷二進位檔時從檔頭取樣的位元組數
pub const BINARY_SAMPLE_BYTES: usize = 1024;

/// 不可列印位元組超過這個比例就視為二進位
pub const DEFAULT_BINARY_THRESHOLD: f64 = 0.10;

pub const DEFAULT_MAX_FILE_SIZE_MB: f64 = 1.0;

/// 可能是原始碼或文字的副檔名，其他的不開檔直接略過
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "js", "jsx", "mjs", "cjs", "ts", "tsx", "vue", "svelte", "py", "rb", "php", "java", "kt",
    "kts", "scala", "groovy", "gradle", "go", "rs", "c", "h", "cc", "cpp", "cxx", "hpp", "cs",
    "swift", "m", "dart", "lua", "r", "pl", "ex", "exs", "erl", "hs", "clj", "sh", "bash", "zsh",
    "ps1", "sql", "html", "htm", "css", "scss", "sass", "less", "json", "yaml", "yml", "toml",
    "xml", "ini", "cfg", "conf", "md", "txt", "graphql", "proto", "tf",
];

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub include_node_modules: bool,
    pub include_tests: bool,
    pub include_docs: bool,
    /// 大小上限（位元組）
    pub max_file_size: u64,
    pub binary_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_node_modules: false,
            include_tests: false,
            include_docs: false,
            max_file_size: mb_to_bytes(DEFAULT_MAX_FILE_SIZE_MB),
            binary_threshold: DEFAULT_BINARY_THRESHOLD,
        }
    }
}

fn mb_to_bytes(mb: f64) -> u64 {
    (mb * 1024.0 * 1024.0) as u64
}

impl FilterConfig {
    /// 以 MB 字串設定大小上限，例如 `"2"` 或 `"0.5"`；無法解析或非正數時保留預設值
    pub fn with_max_file_size_mb(mut self, value: &str) -> Self {
        match value.trim().parse::<f64>() {
            Ok(mb) if mb.is_finite() && mb > 0.0 => self.max_file_size = mb_to_bytes(mb),
            _ => warn!(value, "檔案大小上限無效，使用預設值"),
        }
        self
    }

    /// 根目錄以下的目錄名稱規則
    fn skip_dir(&self, name: &str) -> Option<&'static str> {
        let lower = name.to_lowercase();
        if lower.starts_with('.') {
            return Some("hidden directory");
        }
        if lower == "node_modules" && !self.include_node_modules {
            return Some("node_modules");
        }
        if is_test_name(&lower) && !self.include_tests {
            return Some("test directory");
        }
        if lower == "docs" && !self.include_docs {
            return Some("docs directory");
        }
        None
    }

    /// 單一檔案路徑的名稱與副檔名規則，ingestion 的檔案也共用
    pub fn skip_path(&self, relative: &str) -> Option<&'static str> {
        let lower = relative.to_lowercase();
        for component in lower.split('/').filter(|c| !c.is_empty()) {
            if component == "node_modules" && !self.include_node_modules {
                return Some("node_modules");
            }
            if component == "docs" && !self.include_docs {
                return Some("docs directory");
            }
        }
        let name = lower.rsplit('/').next().unwrap_or(&lower);
        if is_test_name(&lower) && !self.include_tests {
            return Some("test file");
        }
        if name.ends_with(".md") && !self.include_docs {
            return Some("documentation file");
        }
        let allowed = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| ALLOWED_EXTENSIONS.contains(&ext));
        if !allowed {
            return Some("extension not allowed");
        }
        None
    }
}

fn is_test_name(name: &str) -> bool {
    name.contains("test") || name.contains("spec")
}

/// 取樣含 NUL，或可列印 ASCII 以外的位元組超過 `threshold`（tab、LF、CR 不算）時為二進位
pub fn is_binary(sample: &[u8], threshold: f64) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| !(matches!(b, b'\t' | b'\n' | b'\r') || (0x20..=0x7e).contains(&b)))
        .count();
    non_printable as f64 / sample.len() as f64 > threshold
}

/// 含替換字元或 tab、LF、CR 以外的控制字元時視為損毀
pub fn is_corrupted_text(text: &str) -> bool {
    text.chars().any(|c| {
        c == char::REPLACEMENT_CHARACTER || (c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    })
}

fn read_sample(path: &Path) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut buf = vec![0u8; BINARY_SAMPLE_BYTES];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

pub struct FileCollector {
    root: PathBuf,
    canonical_root: PathBuf,
    filters: FilterConfig,
}

impl FileCollector {
    pub fn new(root: impl Into<PathBuf>, filters: FilterConfig) -> Result<Self> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .with_context(|| format!("Cannot resolve repository root {}", root.display()))?;
        Ok(Self {
            root,
            canonical_root,
            filters,
        })
    }

    fn keep_entry(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        match self.filters.skip_dir(&name) {
            Some(reason) => {
                debug!(path = %entry.path().display(), reason, "略過目錄");
                false
            }
            None => true,
        }
    }

    /// 依走訪順序收集根目錄下所有安全的文字檔
    pub fn collect(&self) -> Vec<FileEntry> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| self.keep_entry(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "無法讀取目錄項目，繼續");
                    continue;
                }
            };
            if entry.path_is_symlink() {
                debug!(path = %entry.path().display(), "略過符號連結");
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(file) = self.inspect(entry.path()) {
                files.push(file);
            }
        }

        debug!(count = files.len(), root = %self.root.display(), "檔案收集完成");
        files
    }

    fn inspect(&self, path: &Path) -> Option<FileEntry> {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "無法解析路徑，略過");
                return None;
            }
        };
        if !canonical.starts_with(&self.canonical_root) {
            warn!(path = %path.display(), "路徑位於倉庫之外，拒絕");
            return None;
        }
        let relative = canonical
            .strip_prefix(&self.canonical_root)
            .ok()?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if let Some(reason) = self.filters.skip_path(&relative) {
            debug!(path = %relative, reason, "略過檔案");
            return None;
        }

        let size = match canonical.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %relative, error = %e, "無法取得檔案資訊，略過");
                return None;
            }
        };
        if size > self.filters.max_file_size {
            debug!(path = %relative, size, "檔案超過大小上限，略過");
            return None;
        }

        match read_sample(&canonical) {
            Ok(sample) if is_binary(&sample, self.filters.binary_threshold) => {
                debug!(path = %relative, "略過二進位檔案");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %relative, error = %e, "無法讀取檔案，略過");
                return None;
            }
        }

        let bytes = match std::fs::read(&canonical) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %relative, error = %e, "無法讀取檔案，略過");
                return None;
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(text) if !is_corrupted_text(&text) => text,
            _ => {
                debug!(path = %relative, "略過損毀或非 UTF-8 檔案");
                return None;
            }
        };

        Some(FileEntry {
            language: language_for_path(&relative).map(str::to_string),
            path: relative,
            content,
            size,
        })
    }
}

pub fn collect_files(root: &Path, filters: &FilterConfig) -> Result<Vec<FileEntry>> {
    Ok(FileCollector::new(root, filters.clone())?.collect())
}
