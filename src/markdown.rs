use crate::models::{AnalysisResult, Finding};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::info;

fn push_section(md_content: &mut String, title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    md_content.push_str(&format!("### {}\n\n", title));
    md_content.push_str(body.trim());
    md_content.push_str("\n\n");
}

fn finding_location(finding: &Finding) -> String {
    match (&finding.file, finding.line) {
        (Some(file), Some(line)) => format!("`{}` 第 {} 行", file, line),
        (Some(file), None) => format!("`{}`", file),
        (None, Some(line)) => format!("第 {} 行", line),
        (None, None) => String::new(),
    }
}

/// 依檔案分組列出發現項目；沒有檔案資訊的歸在「其他」
fn push_findings(md_content: &mut String, findings: &[Finding], label: impl Fn(&Finding) -> String) {
    let mut by_file: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in findings {
        let file = finding.file.as_deref().unwrap_or("其他");
        by_file.entry(file).or_default().push(finding);
    }
    for (file, items) in by_file {
        md_content.push_str(&format!("#### {}\n\n", file));
        for finding in items {
            let location = finding_location(finding);
            if location.is_empty() {
                md_content.push_str(&format!("- **[{}]** {}\n", label(finding), finding.title));
            } else {
                md_content.push_str(&format!(
                    "- **[{}]** {}（{}）\n",
                    label(finding),
                    finding.title,
                    location
                ));
            }
            if !finding.description.is_empty() {
                for line in finding.description.lines() {
                    md_content.push_str(&format!("  > {}\n", line));
                }
            }
        }
        md_content.push('\n');
    }
}

pub fn render_report(result: &AnalysisResult) -> String {
    let mut md_content = String::new();
    md_content.push_str("# 程式碼分析報告\n\n");

    md_content.push_str("## 基本資訊\n\n");
    md_content.push_str(&format!("- 倉庫：{}\n", result.repository));
    if let Some(branch) = &result.branch {
        md_content.push_str(&format!("- 分支：{}\n", branch));
    }
    if let Some(commit) = &result.commit {
        md_content.push_str(&format!("- 提交：`{}`\n", commit));
    }
    md_content.push_str(&format!(
        "- 產生時間：{}\n\n",
        result.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    md_content.push_str("## 評分\n\n");
    md_content.push_str("| 項目 | 分數 | 等級 |\n|---|---|---|\n");
    md_content.push_str(&format!(
        "| 安全性 | {} | {} |\n",
        result.security_grade.score, result.security_grade.letter
    ));
    md_content.push_str(&format!(
        "| 程式碼品質 | {} | {} |\n",
        result.quality_grade.score, result.quality_grade.letter
    ));
    md_content.push_str(&format!("| 複雜度 | - | {} |\n\n", result.complexity));

    let stats = &result.stats;
    md_content.push_str("## 統計\n\n");
    md_content.push_str(&format!("- 總檔案數：{}\n", stats.total_files));
    md_content.push_str(&format!("- 總程式碼行數：{}\n", stats.total_lines));
    md_content.push_str(&format!(
        "- 程式碼 / 註解 / 空白：{} / {} / {}\n",
        stats.code_lines, stats.comment_lines, stats.blank_lines
    ));
    md_content.push_str(&format!(
        "- 平均每檔行數：{:.1}\n- 平均複雜度：{:.1}\n\n",
        stats.average_lines_per_file, stats.average_complexity
    ));
    if !stats.languages.is_empty() {
        md_content.push_str("### 語言分佈\n\n");
        let mut languages: Vec<_> = stats.languages.iter().collect();
        languages.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (language, share) in languages {
            md_content.push_str(&format!("- {}：{}%\n", language, share));
        }
        md_content.push('\n');
    }

    if !result.key_files.is_empty() {
        md_content.push_str("## 關鍵檔案\n\n");
        for key_file in &result.key_files {
            md_content.push_str(&format!(
                "- `{}`（分數 {}）：{}\n",
                key_file.path, key_file.score, key_file.description
            ));
        }
        md_content.push('\n');
    }

    md_content.push_str("## 安全性問題\n\n");
    if result.vulnerabilities.is_empty() {
        md_content.push_str("未發現安全性問題。\n\n");
    } else {
        push_findings(&mut md_content, &result.vulnerabilities, |f| {
            f.severity().map(|s| format!("{:?}", s)).unwrap_or_default()
        });
    }

    md_content.push_str("## 程式碼品質\n\n");
    if result.quality_issues.is_empty() {
        md_content.push_str("未發現品質問題。\n\n");
    } else {
        push_findings(&mut md_content, &result.quality_issues, |f| {
            f.issue_type().map(|t| format!("{:?}", t)).unwrap_or_default()
        });
    }

    if !result.insights.is_empty() {
        md_content.push_str("## 洞察\n\n");
        for insight in &result.insights {
            md_content.push_str(&format!("- {}\n", insight));
        }
        md_content.push('\n');
    }

    if !result.documentation.is_empty() {
        let docs = &result.documentation;
        md_content.push_str("## 文件\n\n");
        push_section(&mut md_content, "概覽", &docs.overview);
        push_section(&mut md_content, "架構", &docs.architecture);
        push_section(&mut md_content, "安裝設定", &docs.setup);
        push_section(&mut md_content, "部署", &docs.deployment);
    }

    md_content
}

pub async fn generate_markdown_report(result: &AnalysisResult, output_path: &str) -> Result<()> {
    let md_content = render_report(result);
    tokio::fs::write(output_path, md_content)
        .await
        .with_context(|| format!("無法寫入報告：{}", output_path))?;
    info!("Markdown 報告已生成並寫入 {}", output_path);
    Ok(())
}

pub async fn generate_md_from_json(report_path: &str, output_path: Option<&str>) -> Result<()> {
    // 讀取 JSON 報告
    let report_content = tokio::fs::read_to_string(report_path)
        .await
        .with_context(|| format!("無法讀取報告：{}", report_path))?;
    let result: AnalysisResult = serde_json::from_str(&report_content)?;
    let output = output_path.unwrap_or("analysis_report.md");
    generate_markdown_report(&result, output).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{calculate_stats, language_for_path, ComplexityThresholds};
    use crate::models::{
        DocumentationSections, FileEntry, FindingKind, Grade, IssueType, KeyFileSummary, Severity,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample() -> AnalysisResult {
        let files = vec![FileEntry {
            path: "src/server.ts".to_string(),
            content: "import http from 'http';\nhttp.createServer();\n".to_string(),
            size: 44,
            language: language_for_path("src/server.ts").map(str::to_string),
        }];
        let stats = calculate_stats(&files, &ComplexityThresholds::default());
        AnalysisResult {
            repository: "https://example.com/acme/api.git".to_string(),
            branch: Some("main".to_string()),
            commit: Some("abc123".to_string()),
            complexity: stats.complexity,
            stats,
            key_files: vec![KeyFileSummary {
                path: "src/server.ts".to_string(),
                score: 5,
                language: Some("TypeScript".to_string()),
                lines: 2,
                description: "TypeScript file, 2 lines: 1 imports".to_string(),
            }],
            vulnerabilities: vec![Finding {
                kind: FindingKind::Vulnerability {
                    severity: Severity::High,
                },
                title: "Open redirect".to_string(),
                description: "Redirect target is not validated".to_string(),
                file: Some("src/server.ts".to_string()),
                line: Some(2),
            }],
            quality_issues: vec![Finding {
                kind: FindingKind::QualityIssue {
                    issue_type: IssueType::Warning,
                },
                title: "Missing error handling".to_string(),
                description: String::new(),
                file: None,
                line: None,
            }],
            insights: vec!["Single HTTP entry point".to_string()],
            documentation: DocumentationSections {
                overview: "A tiny API.".to_string(),
                ..DocumentationSections::default()
            },
            security_grade: Grade {
                score: 70,
                letter: "C-".to_string(),
            },
            quality_grade: Grade {
                score: 95,
                letter: "A".to_string(),
            },
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn report_contains_grades_and_findings() {
        let md = render_report(&sample());
        assert!(md.contains("| 安全性 | 70 | C- |"));
        assert!(md.contains("- 分支：main"));
        assert!(md.contains("#### src/server.ts"));
        assert!(md.contains("**[High]** Open redirect（`src/server.ts` 第 2 行）"));
        assert!(md.contains("#### 其他"));
        assert!(md.contains("- TypeScript：100%"));
        assert!(md.contains("### 概覽\n\nA tiny API."));
        assert!(!md.contains("### 部署"));
    }

    #[test]
    fn empty_findings_are_stated() {
        let mut result = sample();
        result.vulnerabilities.clear();
        result.quality_issues.clear();
        let md = render_report(&result);
        assert!(md.contains("未發現安全性問題。"));
        assert!(md.contains("未發現品質問題。"));
    }

    #[tokio::test]
    async fn converts_saved_json_report() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("report.json");
        let md_path = dir.path().join("report.md");
        std::fs::write(&json_path, serde_json::to_string_pretty(&sample()).unwrap()).unwrap();

        generate_md_from_json(json_path.to_str().unwrap(), md_path.to_str())
            .await
            .unwrap();
        let md = std::fs::read_to_string(&md_path).unwrap();
        assert!(md.starts_with("# 程式碼分析報告"));
        assert!(md.contains("Open redirect"));
    }
}
