use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use git2::build::RepoBuilder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::{calculate_stats, get_git_version, ComplexityThresholds};
use crate::cache::ResilientCache;
use crate::collector::{collect_files, FilterConfig};
use crate::config::Config;
use crate::error::{AnalysisError, JobError};
use crate::ingest::{split_content, IngestStore};
use crate::models::{
    AnalysisJob, AnalysisResult, DocumentationSections, FileEntry, Finding, KeyFileSummary,
    RepositoryStats, Severity,
};
use crate::openai::{AnalysisClient, AnalysisFocus};
use crate::parser::{
    parse_documentation, parse_insights, parse_quality_issues, parse_vulnerabilities,
};
use crate::scoring::{quality_grade, security_grade};
use crate::selector::{
    describe_key_file, extract_snippets, select_key_files, KEY_FILE_LIMIT, SNIPPET_BUDGET,
};

/// 分析結果在快取中保留的時間
const ANALYSIS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    /// 本機工作目錄
    Path(PathBuf),
    /// 需要先 clone 的 Git URL
    Url(String),
    /// 已由 ingestion 工具處理過的倉庫 id
    Ingested(String),
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub source: RepoSource,
    pub branch: Option<String>,
    pub filters: FilterConfig,
}

impl JobRequest {
    pub fn new(source: RepoSource) -> Self {
        Self {
            source,
            branch: None,
            filters: FilterConfig::default(),
        }
    }

    fn repository_name(&self) -> String {
        match &self.source {
            RepoSource::Path(path) => path.display().to_string(),
            RepoSource::Url(url) => url.clone(),
            RepoSource::Ingested(id) => id.clone(),
        }
    }
}

/// 收集完成的檔案；clone 的暫存目錄跟著這個值一起釋放
struct Collected {
    files: Vec<FileEntry>,
    commit: Option<String>,
    _checkout: Option<TempDir>,
}

fn clone_repository(url: &str, branch: Option<&str>) -> Result<TempDir> {
    let checkout = tempfile::Builder::new().prefix("codeinsight-").tempdir()?;
    let mut builder = RepoBuilder::new();
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder
        .clone(url, checkout.path())
        .with_context(|| format!("無法 clone 倉庫：{}", url))?;
    Ok(checkout)
}

fn collect_with_commit(root: &Path, filters: &FilterConfig) -> Result<(Vec<FileEntry>, Option<String>)> {
    let files = collect_files(root, filters)?;
    let commit = match get_git_version(root) {
        Ok(commit) => commit,
        Err(e) => {
            debug!("無法讀取 Git 版本：{}", e);
            None
        }
    };
    Ok((files, commit))
}

/// 快取鍵：分析焦點加上路徑與內容的 SHA-256，跨行程與版本都穩定
fn cache_key(focus: AnalysisFocus, path: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let tag = match focus {
        AnalysisFocus::Security => "security",
        AnalysisFocus::Quality => "quality",
    };
    format!("codeinsight:analysis:{}:{:x}", tag, hasher.finalize())
}

/// 跑完整個分析流程：收集、統計、關鍵檔案分析、文件、洞察與評分
pub struct Analyzer {
    client: AnalysisClient,
    cache: Arc<ResilientCache>,
    ingest: IngestStore,
    thresholds: ComplexityThresholds,
}

impl Analyzer {
    pub fn new(
        client: AnalysisClient,
        cache: Arc<ResilientCache>,
        ingest: IngestStore,
        thresholds: ComplexityThresholds,
    ) -> Self {
        Self {
            client,
            cache,
            ingest,
            thresholds,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let cache = match &config.cache_url {
            Some(url) => ResilientCache::connect(url),
            None => ResilientCache::in_memory(),
        };
        Self::new(
            AnalysisClient::from_config(config),
            Arc::new(cache),
            IngestStore::new(config.ingest_dir()),
            config.thresholds.complexity,
        )
    }

    /// 在背景任務中執行一個新的分析工作，完成後回傳終態的 job
    pub fn spawn(self: Arc<Self>, request: JobRequest) -> JoinHandle<AnalysisJob> {
        tokio::spawn(async move {
            let mut job = AnalysisJob::new();
            if let Err(e) = self.execute(&mut job, &request).await {
                warn!(job = %job.id, "工作狀態錯誤：{}", e);
            }
            job
        })
    }

    /// 將 pending 的 job 推進到 completed 或 failed
    pub async fn execute(&self, job: &mut AnalysisJob, request: &JobRequest) -> Result<(), JobError> {
        job.start()?;
        info!(job = %job.id, repository = %request.repository_name(), "開始分析");
        match self.analyze(request).await {
            Ok(result) => {
                info!(
                    job = %job.id,
                    security = %result.security_grade.letter,
                    quality = %result.quality_grade.letter,
                    "分析完成"
                );
                job.complete(result)
            }
            Err(e) => {
                error!(job = %job.id, "分析失敗：{:#}", e);
                job.fail(format!("{:#}", e))
            }
        }
    }

    async fn collect(&self, request: &JobRequest) -> Result<Collected> {
        let filters = request.filters.clone();
        match &request.source {
            RepoSource::Path(path) => {
                if request.branch.is_some() {
                    debug!("本機路徑使用目前的工作目錄，忽略分支設定");
                }
                let root = path.clone();
                let (files, commit) =
                    tokio::task::spawn_blocking(move || collect_with_commit(&root, &filters))
                        .await??;
                Ok(Collected {
                    files,
                    commit,
                    _checkout: None,
                })
            }
            RepoSource::Url(url) => {
                let url = url.clone();
                let branch = request.branch.clone();
                let (checkout, files, commit) = tokio::task::spawn_blocking(move || {
                    info!(url = %url, "正在 clone 倉庫");
                    let checkout = clone_repository(&url, branch.as_deref())?;
                    let (files, commit) = collect_with_commit(checkout.path(), &filters)?;
                    Ok::<_, anyhow::Error>((checkout, files, commit))
                })
                .await??;
                Ok(Collected {
                    files,
                    commit,
                    _checkout: Some(checkout),
                })
            }
            RepoSource::Ingested(id) => {
                let repo = self.ingest.load(id)?;
                Ok(Collected {
                    files: split_content(&repo.content, &filters),
                    commit: None,
                    _checkout: None,
                })
            }
        }
    }

    async fn analyze_file(&self, file: &FileEntry, focus: AnalysisFocus) -> Result<String, AnalysisError> {
        let key = cache_key(focus, &file.path, &file.content);
        match self.cache.get(&key).await {
            Ok(Some(text)) => {
                debug!(path = %file.path, ?focus, "使用快取的分析結果");
                return Ok(text);
            }
            Ok(None) => {}
            Err(e) => debug!("讀取快取失敗：{}", e),
        }
        let text = self.client.analyze_code(&file.path, &file.content, focus).await?;
        if let Err(e) = self.cache.set(&key, &text, Some(ANALYSIS_CACHE_TTL)).await {
            debug!("寫入快取失敗：{}", e);
        }
        Ok(text)
    }

    async fn analyze(&self, request: &JobRequest) -> Result<AnalysisResult> {
        let collected = self.collect(request).await?;
        let files = collected.files;
        if files.is_empty() {
            return Err(anyhow!("找不到可分析的檔案：{}", request.repository_name()));
        }
        info!(files = files.len(), "檔案收集完成");

        let stats = calculate_stats(&files, &self.thresholds);
        let key_files = select_key_files(&files, KEY_FILE_LIMIT);
        let summaries: Vec<KeyFileSummary> = key_files
            .iter()
            .map(|(file, score)| describe_key_file(file, *score))
            .collect();

        let mut vulnerabilities = Vec::new();
        let mut quality_issues = Vec::new();
        for (file, _) in &key_files {
            match self.analyze_file(file, AnalysisFocus::Security).await {
                Ok(text) => vulnerabilities.extend(parse_vulnerabilities(&text, Some(file.path.as_str()))),
                Err(e) => warn!(path = %file.path, "安全分析失敗，略過：{}", e),
            }
            match self.analyze_file(file, AnalysisFocus::Quality).await {
                Ok(text) => quality_issues.extend(parse_quality_issues(&text, Some(file.path.as_str()))),
                Err(e) => warn!(path = %file.path, "品質分析失敗，略過：{}", e),
            }
        }

        let snippets = extract_snippets(&files, KEY_FILE_LIMIT, SNIPPET_BUDGET);
        let documentation = match self.client.generate_documentation(&stats, &snippets).await {
            Ok(text) => {
                let sections = parse_documentation(&text);
                if sections.is_empty() {
                    warn!("文件回應無法解析，改用統計資料");
                    fallback_documentation(&stats, &summaries)
                } else {
                    sections
                }
            }
            Err(e) => {
                warn!("文件生成失敗，改用統計資料：{}", e);
                fallback_documentation(&stats, &summaries)
            }
        };

        let context = findings_context(&vulnerabilities, &quality_issues, &summaries);
        let insights = match self.client.extract_insights(&stats, &context).await {
            Ok(text) => parse_insights(&text),
            Err(e) => {
                warn!("洞察生成失敗：{}", e);
                Vec::new()
            }
        };
        let insights = if insights.is_empty() {
            fallback_insights(&stats, &vulnerabilities, &quality_issues)
        } else {
            insights
        };

        Ok(AnalysisResult {
            repository: request.repository_name(),
            branch: request.branch.clone(),
            commit: collected.commit,
            complexity: stats.complexity,
            security_grade: security_grade(&vulnerabilities),
            quality_grade: quality_grade(&quality_issues),
            stats,
            key_files: summaries,
            vulnerabilities,
            quality_issues,
            insights,
            documentation,
            generated_at: Utc::now(),
        })
    }
}

fn findings_context(
    vulnerabilities: &[Finding],
    quality_issues: &[Finding],
    key_files: &[KeyFileSummary],
) -> String {
    let high = vulnerabilities
        .iter()
        .filter(|f| f.severity() == Some(Severity::High))
        .count();
    let mut context = format!(
        "Findings: {} vulnerabilities ({} high severity), {} quality issues.\n",
        vulnerabilities.len(),
        high,
        quality_issues.len()
    );
    for finding in vulnerabilities.iter().chain(quality_issues).take(10) {
        context.push_str(&format!("- {}\n", finding.title));
    }
    if !key_files.is_empty() {
        let paths: Vec<&str> = key_files.iter().map(|k| k.path.as_str()).collect();
        context.push_str(&format!("Key files: {}\n", paths.join(", ")));
    }
    context
}

fn fallback_documentation(stats: &RepositoryStats, key_files: &[KeyFileSummary]) -> DocumentationSections {
    let language = stats
        .primary_language()
        .map(|(lang, share)| format!(", mostly {} ({}%)", lang, share))
        .unwrap_or_default();
    let architecture = if key_files.is_empty() {
        String::new()
    } else {
        key_files
            .iter()
            .map(|k| format!("- {}: {}", k.path, k.description))
            .collect::<Vec<_>>()
            .join("\n")
    };
    DocumentationSections {
        overview: format!(
            "The repository contains {} files and {} lines of code{}.",
            stats.total_files, stats.total_lines, language
        ),
        architecture,
        setup: String::new(),
        deployment: String::new(),
    }
}

fn fallback_insights(
    stats: &RepositoryStats,
    vulnerabilities: &[Finding],
    quality_issues: &[Finding],
) -> Vec<String> {
    let mut insights = Vec::new();
    if let Some((lang, share)) = stats.primary_language() {
        insights.push(format!("Primary language is {} ({}% of lines)", lang, share));
    }
    insights.push(format!(
        "Overall complexity is {} with {:.1} lines per file on average",
        stats.complexity, stats.average_lines_per_file
    ));
    insights.push(format!(
        "Review reported {} potential vulnerabilities and {} quality issues",
        vulnerabilities.len(),
        quality_issues.len()
    ));
    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::models::JobStatus;
    use crate::openai::{ChatRequest, ChatTransport, ClientSettings};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;

    /// 依提示類型回答，可讓安全分析失敗
    #[derive(Default)]
    struct FakeModel {
        prompts: Mutex<Vec<String>>,
        fail_security: bool,
    }

    #[async_trait]
    impl ChatTransport for FakeModel {
        async fn complete(&self, request: &ChatRequest) -> Result<String, TransportError> {
            let prompt = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt.clone());
            if prompt.contains("security vulnerabilities") {
                if self.fail_security {
                    return Err(TransportError::Api {
                        status: 500,
                        message: "upstream".to_string(),
                    });
                }
                if prompt.contains("db.query") {
                    return Ok("Vulnerability: High SQL injection\nUser input on line 3.\n".to_string());
                }
                return Ok("No vulnerabilities found.".to_string());
            }
            if prompt.contains("code quality") {
                return Ok("Warning: magic number\nline 1\n\nImprovement: add types\n".to_string());
            }
            if prompt.contains("## Overview") {
                return Ok("## Overview\nA small service.\n\n## Setup\nnpm install\n".to_string());
            }
            Ok("- Express handles routing\n- Database access is unparameterised\n".to_string())
        }
    }

    impl FakeModel {
        fn count(&self, needle: &str) -> usize {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.contains(needle))
                .count()
        }
    }

    fn analyzer(model: Arc<FakeModel>, ingest_dir: &Path) -> Analyzer {
        let settings = ClientSettings {
            min_interval_ms: 0,
            ..ClientSettings::default()
        };
        let client = AnalysisClient::new(model, &settings, "test-model", 256, 0.0);
        Analyzer::new(
            client,
            Arc::new(ResilientCache::in_memory()),
            IngestStore::new(ingest_dir),
            ComplexityThresholds::default(),
        )
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/index.js"),
            "import express from 'express';\nconst app = express();\ndb.query('SELECT ' + req.query.id);\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/util.js"), "export const add = (a, b) => a + b;\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn completes_job_for_local_path() {
        let repo = fixture();
        let model = Arc::new(FakeModel::default());
        let analyzer = analyzer(model.clone(), repo.path());

        let mut job = AnalysisJob::new();
        let request = JobRequest::new(RepoSource::Path(repo.path().to_path_buf()));
        analyzer.execute(&mut job, &request).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        let result = job.result.unwrap();
        assert_eq!(result.stats.total_files, 2);
        assert_eq!(result.key_files[0].path, "src/index.js");
        assert_eq!(result.vulnerabilities.len(), 1);
        assert_eq!(result.vulnerabilities[0].file.as_deref(), Some("src/index.js"));
        assert_eq!(result.security_grade.score, 70);
        assert_eq!(result.quality_issues.len(), 4);
        assert_eq!(result.quality_grade.score, 88);
        assert_eq!(result.documentation.overview, "A small service.");
        assert_eq!(result.documentation.setup, "npm install");
        assert_eq!(result.insights.len(), 2);
    }

    #[tokio::test]
    async fn per_file_failures_do_not_fail_the_job() {
        let repo = fixture();
        let model = Arc::new(FakeModel {
            fail_security: true,
            ..FakeModel::default()
        });
        let analyzer = Arc::new(analyzer(model, repo.path()));
        let job = analyzer
            .spawn(JobRequest::new(RepoSource::Path(repo.path().to_path_buf())))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        assert!(result.vulnerabilities.is_empty());
        assert_eq!(result.security_grade.letter, "A+");
    }

    #[tokio::test]
    async fn repeated_analysis_is_served_from_cache() {
        let repo = fixture();
        let model = Arc::new(FakeModel::default());
        let analyzer = analyzer(model.clone(), repo.path());
        let request = JobRequest::new(RepoSource::Path(repo.path().to_path_buf()));

        analyzer.execute(&mut AnalysisJob::new(), &request).await.unwrap();
        let first = model.count("security vulnerabilities");
        analyzer.execute(&mut AnalysisJob::new(), &request).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(model.count("security vulnerabilities"), first);
    }

    #[tokio::test]
    async fn empty_repository_fails_the_job() {
        let repo = TempDir::new().unwrap();
        fs::write(repo.path().join("logo.png"), [0u8, 1, 2, 3]).unwrap();
        let analyzer = analyzer(Arc::new(FakeModel::default()), repo.path());

        let mut job = AnalysisJob::new();
        let request = JobRequest::new(RepoSource::Path(repo.path().to_path_buf()));
        analyzer.execute(&mut job, &request).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(job.result.is_none());
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn job_cannot_be_executed_twice() {
        let repo = fixture();
        let analyzer = analyzer(Arc::new(FakeModel::default()), repo.path());
        let request = JobRequest::new(RepoSource::Path(repo.path().to_path_buf()));
        let mut job = AnalysisJob::new();
        analyzer.execute(&mut job, &request).await.unwrap();
        assert!(analyzer.execute(&mut job, &request).await.is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn analyzes_ingested_repository() {
        let out = TempDir::new().unwrap();
        let rule = "=".repeat(48);
        fs::write(out.path().join("svc_summary.txt"), "summary").unwrap();
        fs::write(out.path().join("svc_tree.txt"), "svc/").unwrap();
        fs::write(
            out.path().join("svc_content.txt"),
            format!("{rule}\nFile: app.py\n{rule}\nimport os\nprint(os.getcwd())\n"),
        )
        .unwrap();
        let analyzer = analyzer(Arc::new(FakeModel::default()), out.path());

        let mut job = AnalysisJob::new();
        let request = JobRequest::new(RepoSource::Ingested("svc".to_string()));
        analyzer.execute(&mut job, &request).await.unwrap();
        let result = job.result.unwrap();
        assert_eq!(result.repository, "svc");
        assert_eq!(result.key_files[0].path, "app.py");
        assert_eq!(result.commit, None);

        let mut missing = AnalysisJob::new();
        let request = JobRequest::new(RepoSource::Ingested("ghost".to_string()));
        analyzer.execute(&mut missing, &request).await.unwrap();
        assert_eq!(missing.status, JobStatus::Failed);
    }

    #[test]
    fn fallbacks_are_built_from_stats() {
        let files = vec![FileEntry {
            path: "main.go".to_string(),
            content: "package main\n".to_string(),
            size: 13,
            language: Some("Go".to_string()),
        }];
        let stats = calculate_stats(&files, &ComplexityThresholds::default());
        let docs = fallback_documentation(&stats, &[]);
        assert!(docs.overview.contains("1 files"));
        assert!(docs.overview.contains("Go (100%)"));
        let insights = fallback_insights(&stats, &[], &[]);
        assert!(insights[0].starts_with("Primary language is Go"));
        assert!(insights.iter().all(|i| i.len() >= 10));
    }

    #[test]
    fn cache_key_is_stable_sha256() {
        let key = cache_key(AnalysisFocus::Security, "src/main.rs", "fn main() {}\n");
        assert_eq!(
            key,
            "codeinsight:analysis:security:0a2452c8dc7b5a4c98209675b8edf1d7624b7736b06ada6528d0a89371b91017"
        );
        assert_ne!(
            key,
            cache_key(AnalysisFocus::Quality, "src/main.rs", "fn main() {}\n")
        );
        assert_ne!(key, cache_key(AnalysisFocus::Security, "src/main.rs", "fn main() {}"));
        // 分隔符讓路徑與內容的邊界不會互相混淆
        assert_ne!(
            cache_key(AnalysisFocus::Security, "ab", "c"),
            cache_key(AnalysisFocus::Security, "a", "bc")
        );
    }
}
