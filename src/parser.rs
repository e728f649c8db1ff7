use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{DocumentationSections, Finding, FindingKind, IssueType, Severity};
use crate::selector::truncate_chars;

pub const DESCRIPTION_LIMIT: usize = 500;
pub const MAX_INSIGHTS: usize = 7;
pub const MIN_INSIGHT_LEN: usize = 10;

// 標記字後只允許編號（如 "Vulnerability 2:"）與 markdown 粗體，接著必須是冒號
static VULNERABILITY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t>*#\-\d.)]*(vulnerability|security issue)[*_]*(?:[ \t]+#?\d+)?[*_]*[ \t]*:[* \t]*(.+)$")
        .unwrap()
});
static QUALITY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t>*#\-\d.)]*(issue|warning|improvement|error)[*_]*(?:[ \t]+#?\d+)?[*_]*[ \t]*:[* \t]*(.+)$")
        .unwrap()
});
static HIGH_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:critical|high)\b").unwrap());
static LOW_WORDS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blow\b").unwrap());
static WARNING_WORDS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bwarning\b").unwrap());
static ERROR_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:error|critical)\b").unwrap());
static LINE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bline\s+(\d+)").unwrap());
static GENERIC_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)vulnerabilit|security issue").unwrap());
static NEGATED_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bno\s+(?:known\s+|obvious\s+|significant\s+|security\s+)?(?:vulnerabilities|vulnerability|security issues?)\b")
        .unwrap()
});
static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)|\n").unwrap());
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•+]|\d+[.)])\s*").unwrap());

static OVERVIEW_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:overview|introduction|summary)\b").unwrap());
static ARCHITECTURE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:architecture|structure|design)\b").unwrap());
static SETUP_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:setup|set up|installation|install|getting started)\b").unwrap()
});
static DEPLOYMENT_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:deployment|deploy|deploying)\b").unwrap());

fn clean_title(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '*' || c == '_' || c == '`').trim().to_string()
}

/// 標記行之後到下一個空行為止的文字，最多 `DESCRIPTION_LIMIT` 個字元
fn description_after(text: &str, offset: usize) -> String {
    let rest = &text[offset..];
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')).unwrap_or(rest);
    let end = rest
        .find("\n\n")
        .or_else(|| rest.find("\r\n\r\n"))
        .unwrap_or(rest.len());
    truncate_chars(rest[..end].trim(), DESCRIPTION_LIMIT)
        .trim()
        .to_string()
}

fn line_number(text: &str) -> Option<u32> {
    LINE_NUMBER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn vulnerability_severity(header: &str) -> Severity {
    if HIGH_WORDS.is_match(header) {
        Severity::High
    } else if LOW_WORDS.is_match(header) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

fn issue_type(header: &str) -> IssueType {
    if WARNING_WORDS.is_match(header) {
        IssueType::Warning
    } else if ERROR_WORDS.is_match(header) {
        IssueType::Error
    } else {
        IssueType::Improvement
    }
}

fn scan_markers(
    text: &str,
    marker: &Regex,
    file: Option<&str>,
    kind_for: impl Fn(&str, &str) -> FindingKind,
) -> Vec<Finding> {
    marker
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let keyword = caps.get(1)?.as_str();
            let title = clean_title(caps.get(2)?.as_str());
            if title.is_empty() {
                return None;
            }
            let description = description_after(text, whole.end());
            let line = line_number(&description).or_else(|| line_number(&title));
            Some(Finding {
                kind: kind_for(keyword, &title),
                title,
                description,
                file: file.map(str::to_string),
                line,
            })
        })
        .collect()
}

/// 是否有任何一句提到漏洞而且沒有被否定
fn has_unnegated_mention(text: &str) -> bool {
    SENTENCE_BREAK
        .split(text)
        .any(|sentence| GENERIC_MENTION.is_match(sentence) && !NEGATED_MENTION.is_match(sentence))
}

/// 從安全審查回應中擷取漏洞；沒有標記時，未被否定的泛稱提及會產生一筆 Low 發現
pub fn parse_vulnerabilities(text: &str, file: Option<&str>) -> Vec<Finding> {
    let findings: Vec<Finding> = scan_markers(text, &VULNERABILITY_MARKER, file, |_, title| {
        FindingKind::Vulnerability {
            severity: vulnerability_severity(title),
        }
    })
    .into_iter()
    .filter(|f| !NEGATED_MENTION.is_match(&f.title))
    .collect();
    if !findings.is_empty() {
        return findings;
    }
    if has_unnegated_mention(text) {
        let summary = truncate_chars(text.trim(), DESCRIPTION_LIMIT).to_string();
        return vec![Finding {
            kind: FindingKind::Vulnerability {
                severity: Severity::Low,
            },
            title: "Potential security issue".to_string(),
            line: line_number(&summary),
            description: summary,
            file: file.map(str::to_string),
        }];
    }
    Vec::new()
}

/// 從品質審查回應中擷取問題
pub fn parse_quality_issues(text: &str, file: Option<&str>) -> Vec<Finding> {
    scan_markers(text, &QUALITY_MARKER, file, |keyword, title| {
        FindingKind::QualityIssue {
            issue_type: issue_type(&format!("{} {}", keyword, title)),
        }
    })
}

#[derive(Clone, Copy)]
enum Section {
    Overview,
    Architecture,
    Setup,
    Deployment,
}

/// 標題：`#` 開頭、整行粗體，或以冒號結尾的短行
fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('#') {
        return Some(rest.trim_start_matches('#').trim());
    }
    if trimmed.len() > 4 && trimmed.starts_with("**") && trimmed.ends_with("**") {
        return Some(trimmed.trim_matches('*').trim());
    }
    if trimmed.ends_with(':') && trimmed.len() <= 40 && !trimmed.contains(". ") {
        return Some(trimmed.trim_end_matches(':').trim());
    }
    None
}

fn classify_heading(heading: &str) -> Option<Section> {
    if OVERVIEW_HEADING.is_match(heading) {
        Some(Section::Overview)
    } else if ARCHITECTURE_HEADING.is_match(heading) {
        Some(Section::Architecture)
    } else if SETUP_HEADING.is_match(heading) {
        Some(Section::Setup)
    } else if DEPLOYMENT_HEADING.is_match(heading) {
        Some(Section::Deployment)
    } else {
        None
    }
}

/// 將文件回應切成四個段落；無法辨識的標題下的內容捨棄，沒出現的段落留空
pub fn parse_documentation(text: &str) -> DocumentationSections {
    let mut sections = DocumentationSections::default();
    let mut current: Option<Section> = None;
    let mut buffer: Vec<&str> = Vec::new();

    fn flush(sections: &mut DocumentationSections, current: Option<Section>, buffer: &mut Vec<&str>) {
        if let Some(section) = current {
            let body = buffer.join("\n").trim().to_string();
            let slot = match section {
                Section::Overview => &mut sections.overview,
                Section::Architecture => &mut sections.architecture,
                Section::Setup => &mut sections.setup,
                Section::Deployment => &mut sections.deployment,
            };
            if slot.is_empty() {
                *slot = body;
            } else if !body.is_empty() {
                slot.push_str("\n\n");
                slot.push_str(&body);
            }
        }
        buffer.clear();
    }

    for line in text.lines() {
        if let Some(heading) = heading_text(line) {
            flush(&mut sections, current, &mut buffer);
            current = classify_heading(heading);
            continue;
        }
        if current.is_some() {
            buffer.push(line);
        }
    }
    flush(&mut sections, current, &mut buffer);
    sections
}

/// 逐行整理洞察：去掉項目符號、去重、過短的捨棄，最多七筆
pub fn parse_insights(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(|line| BULLET.replace(line.trim(), "").trim().to_string())
        .map(|line| clean_title(&line))
        .filter(|line| line.chars().count() >= MIN_INSIGHT_LEN)
        .filter(|line| seen.insert(line.to_lowercase()))
        .take(MAX_INSIGHTS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_vulnerability_defaults_to_medium() {
        let text = "Vulnerability: SQL Injection risk\nDescription text...\n\n";
        let findings = parse_vulnerabilities(text, Some("db.js"));
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.title, "SQL Injection risk");
        assert_eq!(f.severity(), Some(Severity::Medium));
        assert_eq!(f.description, "Description text...");
        assert_eq!(f.file.as_deref(), Some("db.js"));
        assert_eq!(f.line, None);
    }

    #[test]
    fn severity_and_line_are_inferred() {
        let text = "1. **Vulnerability**: Critical command injection\nUser input reaches exec on line 42.\n\n\
                    - Security Issue: Low entropy session ids\nSee line 7\n\n\
                    Vulnerability 3: Allows open redirect\nredirects anywhere\n";
        let findings = parse_vulnerabilities(text, None);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].severity(), Some(Severity::High));
        assert_eq!(findings[0].title, "Critical command injection");
        assert_eq!(findings[0].line, Some(42));
        assert_eq!(findings[1].severity(), Some(Severity::Low));
        assert_eq!(findings[1].line, Some(7));
        // "Allows" 不能算成 "low"
        assert_eq!(findings[2].severity(), Some(Severity::Medium));
    }

    #[test]
    fn description_is_capped() {
        let text = format!("Vulnerability: XSS\n{}\n", "a".repeat(2000));
        let findings = parse_vulnerabilities(&text, None);
        assert_eq!(findings[0].description.len(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn generic_mention_synthesizes_one_low_finding() {
        let text = "The handler may contain a vulnerability around token parsing.";
        let findings = parse_vulnerabilities(text, Some("auth.go"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity(), Some(Severity::Low));

        assert!(parse_vulnerabilities("No vulnerabilities were found.", None).is_empty());
        assert!(parse_vulnerabilities("Looks clean to me.", None).is_empty());
    }

    #[test]
    fn assessment_heading_with_all_clear_is_not_a_finding() {
        let text = "Vulnerability assessment: No vulnerabilities found.";
        assert!(parse_vulnerabilities(text, Some("app.py")).is_empty());
    }

    #[test]
    fn marker_allows_numbering_and_bold() {
        let text = "**Vulnerability 2:** Path traversal in upload\nline 18\n";
        let findings = parse_vulnerabilities(text, None);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "Path traversal in upload");
        assert_eq!(findings[0].line, Some(18));
    }

    #[test]
    fn negation_only_covers_its_own_sentence() {
        let text = "No security issues in the router. However the upload handler may \
                    contain a vulnerability in path handling.";
        let findings = parse_vulnerabilities(text, Some("upload.js"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity(), Some(Severity::Low));
        assert_eq!(findings[0].file.as_deref(), Some("upload.js"));
    }

    #[test]
    fn description_cap_counts_characters() {
        let text = format!("Vulnerability: XSS\n{}\n", "字".repeat(800));
        let findings = parse_vulnerabilities(&text, None);
        assert_eq!(findings[0].description.chars().count(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn quality_issue_types() {
        let text = "Issue: Error handling swallows exceptions\nThe catch block is empty.\n\n\
                    Warning: unused variable `tmp`\nline 3\n\n\
                    Improvement: extract helper\nDuplicated code.\n";
        let issues = parse_quality_issues(text, Some("a.ts"));
        let types: Vec<_> = issues.iter().filter_map(|i| i.issue_type()).collect();
        assert_eq!(
            types,
            vec![IssueType::Error, IssueType::Warning, IssueType::Improvement]
        );
        assert_eq!(issues[1].line, Some(3));
    }

    #[test]
    fn unstructured_quality_text_yields_nothing() {
        assert!(parse_quality_issues("The code looks tidy overall.", None).is_empty());
    }

    #[test]
    fn documentation_sections_by_heading() {
        let text = "# Project Overview\nA CLI tool.\n\n## Architecture\nThree layers.\n\n\
                    ## Installation\nRun cargo install.\n\n## Contributing\nPRs welcome.\n";
        let docs = parse_documentation(text);
        assert_eq!(docs.overview, "A CLI tool.");
        assert_eq!(docs.architecture, "Three layers.");
        assert_eq!(docs.setup, "Run cargo install.");
        assert_eq!(docs.deployment, "");
    }

    #[test]
    fn documentation_without_headings_is_empty() {
        assert!(parse_documentation("just some prose without structure").is_empty());
    }

    #[test]
    fn insights_are_cleaned_deduplicated_and_capped() {
        let text = "- Uses Express for routing\n* Uses Express for routing\n1. short\n\
                    2) Database access goes through an ORM\n• Heavy use of async/await\n\
                    - Tests cover the API layer\n- Config is loaded from env vars\n\
                    - CI runs on every push\n- Logging uses winston\n- Docker image is multi-stage\n";
        let insights = parse_insights(text);
        assert_eq!(insights.len(), MAX_INSIGHTS);
        assert_eq!(insights[0], "Uses Express for routing");
        assert_eq!(insights[1], "Database access goes through an ORM");
        assert!(insights.iter().all(|i| i.len() >= MIN_INSIGHT_LEN));
    }
}
