use crate::models::{ComplexityLevel, FileEntry, RepositoryStats};
use anyhow::Result;
use git2::Repository;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub loc: usize,
    pub blank_lines: usize,
    pub comment_lines: usize,
    pub code_lines: usize,
}

/// 複雜度分級門檻，預設值為 100/200 行與 25/50 分
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ComplexityThresholds {
    pub low_max_lines: f64,
    pub low_max_complexity: f64,
    pub medium_max_lines: f64,
    pub medium_max_complexity: f64,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self {
            low_max_lines: 100.0,
            low_max_complexity: 25.0,
            medium_max_lines: 200.0,
            medium_max_complexity: 50.0,
        }
    }
}

impl ComplexityThresholds {
    pub fn classify(&self, avg_lines: f64, avg_complexity: f64) -> ComplexityLevel {
        if avg_lines <= self.low_max_lines && avg_complexity <= self.low_max_complexity {
            ComplexityLevel::Low
        } else if avg_lines <= self.medium_max_lines
            && avg_complexity <= self.medium_max_complexity
        {
            ComplexityLevel::Medium
        } else {
            ComplexityLevel::High
        }
    }
}

const LANGUAGES: &[(&str, &str)] = &[
    ("js", "JavaScript"),
    ("jsx", "JavaScript"),
    ("mjs", "JavaScript"),
    ("cjs", "JavaScript"),
    ("ts", "TypeScript"),
    ("tsx", "TypeScript"),
    ("vue", "Vue"),
    ("svelte", "Svelte"),
    ("py", "Python"),
    ("rb", "Ruby"),
    ("php", "PHP"),
    ("java", "Java"),
    ("kt", "Kotlin"),
    ("kts", "Kotlin"),
    ("scala", "Scala"),
    ("groovy", "Groovy"),
    ("go", "Go"),
    ("rs", "Rust"),
    ("c", "C"),
    ("h", "C"),
    ("cc", "C++"),
    ("cpp", "C++"),
    ("cxx", "C++"),
    ("hpp", "C++"),
    ("cs", "C#"),
    ("swift", "Swift"),
    ("m", "Objective-C"),
    ("dart", "Dart"),
    ("lua", "Lua"),
    ("r", "R"),
    ("pl", "Perl"),
    ("ex", "Elixir"),
    ("exs", "Elixir"),
    ("erl", "Erlang"),
    ("hs", "Haskell"),
    ("clj", "Clojure"),
    ("sh", "Shell"),
    ("bash", "Shell"),
    ("zsh", "Shell"),
    ("ps1", "PowerShell"),
    ("sql", "SQL"),
    ("html", "HTML"),
    ("htm", "HTML"),
    ("css", "CSS"),
    ("scss", "SCSS"),
    ("sass", "SCSS"),
    ("less", "Less"),
];

/// 依副檔名判斷語言；未列入表中的副檔名回傳 None
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
    LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// 獲取 Git 倉庫的當前提交 hash
pub fn get_git_version(project_path: &Path) -> Result<Option<String>> {
    if !project_path.join(".git").exists() {
        return Ok(None);
    }
    let repo = Repository::open(project_path)?;
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    Ok(Some(commit.id().to_string()))
}

pub fn analyze_code(content: &str) -> FileStats {
    let mut stats = FileStats::default();
    for line in content.lines() {
        let line = line.trim();
        stats.loc += 1;
        if line.is_empty() {
            stats.blank_lines += 1;
        } else if line.starts_with("//") || line.starts_with("/*") || line.starts_with('*') {
            stats.comment_lines += 1;
        } else {
            stats.code_lines += 1;
        }
    }
    stats
}

static IF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bif\b").unwrap());
static SWITCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bswitch\b").unwrap());
static TERNARY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s\?\s[^:\n]*\s:\s").unwrap());
static LOOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:for|while|loop)\b|\bdo\s*\{").unwrap());
static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bfunction\b|\bfn\s+\w|\bdef\s+\w|\bfunc\s+\w|=>").unwrap()
});

/// 最長的行首空白（tab 視為 2 格）換算成 2 格一層的縮排深度
fn max_indent_depth(content: &str) -> usize {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| if c == '\t' { 2 } else { 1 })
                .sum::<usize>()
        })
        .max()
        .unwrap_or(0)
        / 2
}

/// 單一檔案的複雜度分數
pub fn file_complexity(content: &str) -> usize {
    max_indent_depth(content) * 2
        + IF_RE.find_iter(content).count()
        + SWITCH_RE.find_iter(content).count() * 2
        + TERNARY_RE.find_iter(content).count()
        + LOOP_RE.find_iter(content).count() * 2
        + FUNCTION_RE.find_iter(content).count()
}

/// 計算整個倉庫的行數、語言分佈與複雜度等級
pub fn calculate_stats(files: &[FileEntry], thresholds: &ComplexityThresholds) -> RepositoryStats {
    let mut totals = FileStats::default();
    let mut language_lines: BTreeMap<String, usize> = BTreeMap::new();
    let mut complexity_sum = 0usize;

    for file in files {
        let stats = analyze_code(&file.content);
        totals.loc += stats.loc;
        totals.blank_lines += stats.blank_lines;
        totals.comment_lines += stats.comment_lines;
        totals.code_lines += stats.code_lines;
        if let Some(lang) = &file.language {
            *language_lines.entry(lang.clone()).or_default() += stats.loc;
        }
        complexity_sum += file_complexity(&file.content);
    }

    let mapped_lines: usize = language_lines.values().sum();
    let languages = language_lines
        .into_iter()
        .filter(|(_, lines)| *lines > 0)
        .map(|(lang, lines)| {
            let share = (lines as f64 / mapped_lines as f64 * 100.0).round() as u32;
            (lang, share)
        })
        .collect();

    let (average_lines_per_file, average_complexity) = if files.is_empty() {
        (0.0, 0.0)
    } else {
        (
            totals.loc as f64 / files.len() as f64,
            complexity_sum as f64 / files.len() as f64,
        )
    };

    RepositoryStats {
        total_files: files.len(),
        total_lines: totals.loc,
        blank_lines: totals.blank_lines,
        comment_lines: totals.comment_lines,
        code_lines: totals.code_lines,
        languages,
        average_lines_per_file,
        average_complexity,
        complexity: thresholds.classify(average_lines_per_file, average_complexity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_string(),
            size: content.len() as u64,
            language: language_for_path(path).map(str::to_string),
        }
    }

    #[test]
    fn counts_line_kinds() {
        let stats = analyze_code("// header\n\nfn main() {}\n * doc\n");
        assert_eq!(
            stats,
            FileStats {
                loc: 4,
                blank_lines: 1,
                comment_lines: 2,
                code_lines: 1
            }
        );
    }

    #[test]
    fn language_shares_exclude_unmapped_extensions() {
        let files = vec![
            entry("a.ts", &"x\n".repeat(30)),
            entry("b.py", &"x\n".repeat(10)),
            entry("package.json", &"x\n".repeat(60)),
        ];
        let stats = calculate_stats(&files, &ComplexityThresholds::default());
        assert_eq!(stats.total_lines, 100);
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.languages.get("TypeScript"), Some(&75));
        assert_eq!(stats.languages.get("Python"), Some(&25));
        assert!(!stats.languages.contains_key("JSON"));
    }

    #[test]
    fn complexity_counts_markers() {
        let code = "function f(a) {\n    if (a) {\n        for (;;) {}\n    }\n    return a ? 1 : 2;\n}\n";
        // depth 4 -> 8, if 1, loop 2, ternary 1, function 1
        assert_eq!(file_complexity(code), 13);
        assert_eq!(file_complexity("let x = foo()?;\n"), 0);
    }

    #[test]
    fn complexity_label_thresholds() {
        let t = ComplexityThresholds::default();
        assert_eq!(t.classify(100.0, 25.0), ComplexityLevel::Low);
        assert_eq!(t.classify(101.0, 10.0), ComplexityLevel::Medium);
        assert_eq!(t.classify(150.0, 50.0), ComplexityLevel::Medium);
        assert_eq!(t.classify(201.0, 1.0), ComplexityLevel::High);
        assert_eq!(t.classify(10.0, 51.0), ComplexityLevel::High);
    }

    #[test]
    fn empty_repository_is_low() {
        let stats = calculate_stats(&[], &ComplexityThresholds::default());
        assert_eq!(stats.complexity, ComplexityLevel::Low);
        assert!(stats.languages.is_empty());
    }
}
