use std::sync::LazyLock;

use regex::Regex;

use crate::models::{FileEntry, KeyFileScore, KeyFileSummary};

pub const KEY_FILE_LIMIT: usize = 10;
pub const SNIPPET_BUDGET: usize = 2000;
/// 單一定義區塊最多擷取的字元數
pub const DEFINITION_CONTEXT: usize = 500;

const ENTRY_POINT_BONUS: i64 = 50;
const CONFIG_BONUS: i64 = 40;
const IMPORT_WEIGHT: i64 = 5;
const SIZE_BONUS: i64 = 30;
const TEST_PENALTY: i64 = -20;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:import\s|from\s+\S+\s+import\s|use\s+\S|#include\s|require\(|(?:const|let|var)\s+.+=\s*require\(|@import\s)",
    )
    .unwrap()
});

static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:abstract\s+)?(?:class|function|interface|type|struct|enum|trait|impl|fn|def|func)\b",
    )
    .unwrap()
});

pub fn is_import_line(line: &str) -> bool {
    IMPORT_RE.is_match(line)
}

fn count_imports(content: &str) -> usize {
    content.lines().filter(|l| is_import_line(l)).count()
}

fn is_entry_point(path: &str) -> bool {
    ["index", "main", "app"].iter().any(|k| path.contains(k))
}

fn is_config(path: &str) -> bool {
    path.contains("config")
        || [".json", ".yaml", ".yml"].iter().any(|ext| path.ends_with(ext))
}

fn is_test(path: &str) -> bool {
    path.contains("test") || path.contains("spec")
}

/// 單一檔案的重要性分數
pub fn score_file(file: &FileEntry) -> i64 {
    let path = file.path.to_lowercase();
    let mut score = 0;
    if is_entry_point(&path) {
        score += ENTRY_POINT_BONUS;
    }
    if is_config(&path) {
        score += CONFIG_BONUS;
    }
    score += IMPORT_WEIGHT * count_imports(&file.content) as i64;
    let lines = file.content.lines().count();
    if lines > 100 && lines < 1000 {
        score += SIZE_BONUS;
    }
    if is_test(&path) {
        score += TEST_PENALTY;
    }
    score
}

/// 依分數由高到低排序；穩定排序，同分時保留收集順序
pub fn rank_files(files: &[FileEntry]) -> Vec<KeyFileScore> {
    let mut ranked: Vec<KeyFileScore> = files
        .iter()
        .map(|f| KeyFileScore {
            path: f.path.clone(),
            score: score_file(f),
        })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}

pub fn select_key_files<'a>(files: &'a [FileEntry], limit: usize) -> Vec<(&'a FileEntry, i64)> {
    let mut scored: Vec<(&FileEntry, i64)> = files.iter().map(|f| (f, score_file(f))).collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(limit);
    scored
}

/// 以計分依據產生關鍵檔案的簡短說明
pub fn describe_key_file(file: &FileEntry, score: i64) -> KeyFileSummary {
    let path = file.path.to_lowercase();
    let lines = file.content.lines().count();
    let imports = count_imports(&file.content);

    let mut reasons = Vec::new();
    if is_entry_point(&path) {
        reasons.push("entry point".to_string());
    }
    if is_config(&path) {
        reasons.push("configuration".to_string());
    }
    if imports > 0 {
        reasons.push(format!("{} imports", imports));
    }
    if lines > 100 && lines < 1000 {
        reasons.push("substantial module".to_string());
    }
    if is_test(&path) {
        reasons.push("test code".to_string());
    }
    let description = match (&file.language, reasons.is_empty()) {
        (Some(lang), true) => format!("{} file, {} lines", lang, lines),
        (Some(lang), false) => format!("{} file, {} lines: {}", lang, lines, reasons.join(", ")),
        (None, true) => format!("{} lines", lines),
        (None, false) => format!("{} lines: {}", lines, reasons.join(", ")),
    };

    KeyFileSummary {
        path: file.path.clone(),
        score,
        language: file.language.clone(),
        lines,
        description,
    }
}

/// 截到最多 `max` 個字元
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

struct Budget {
    out: String,
    used: usize,
    limit: usize,
}

impl Budget {
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    /// 盡量放入 `piece`；預算用完時回傳 false
    fn push(&mut self, piece: &str) -> bool {
        let piece = truncate_chars(piece, self.remaining());
        self.used += piece.chars().count();
        self.out.push_str(piece);
        self.remaining() > 0
    }
}

/// 從 `start` 開始擷取定義區塊，到下一個空行或 `DEFINITION_CONTEXT` 個字元為止
fn definition_block(content: &str, start: usize) -> &str {
    let rest = &content[start..];
    let end = rest.find("\n\n").map(|i| i + 1).unwrap_or(rest.len());
    truncate_chars(&rest[..end], DEFINITION_CONTEXT)
}

/// 在 `budget` 個字元內擷取具代表性的片段：import、定義區塊，最後以檔頭補滿
pub fn extract_snippet(content: &str, budget: usize) -> String {
    if content.chars().count() <= budget {
        return content.to_string();
    }
    let mut out = Budget {
        out: String::with_capacity(budget),
        used: 0,
        limit: budget,
    };

    let imports: Vec<&str> = content.lines().filter(|l| is_import_line(l)).collect();
    if !imports.is_empty() {
        let block = format!("{}\n\n", imports.join("\n"));
        if !out.push(&block) {
            return out.out;
        }
    }

    let mut offset = 0;
    let mut last_end = 0;
    for line in content.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        if start < last_end || !DEFINITION_RE.is_match(line) {
            continue;
        }
        let block = definition_block(content, start);
        last_end = start + block.len();
        let block = format!("{}\n", block.trim_end());
        if !out.push(&block) {
            return out.out;
        }
    }

    out.push(content);
    out.out
}

/// 前 `limit` 個關鍵檔案的 (路徑, 片段)，依排名排列
pub fn extract_snippets(files: &[FileEntry], limit: usize, budget: usize) -> Vec<(String, String)> {
    select_key_files(files, limit)
        .into_iter()
        .map(|(file, _)| (file.path.clone(), extract_snippet(&file.content, budget)))
        .collect()
}
