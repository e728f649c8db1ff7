use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use codeinsight::collector::FilterConfig;
use codeinsight::config::{self, Config};
use codeinsight::ingest::{derive_repo_id, IngestRunner, IngestStore};
use codeinsight::markdown;
use codeinsight::models::JobStatus;
use codeinsight::pipeline::{Analyzer, JobRequest, RepoSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "一個收集倉庫原始碼、交由 LLM 分析並評分安全性與品質的命令列工具")]
struct Args {
    /// 要分析的本機專案路徑
    #[arg(short, long, default_value = ".")]
    path: String,
    /// 要 clone 並分析的 Git URL（優先於 --path）
    #[arg(long)]
    url: Option<String>,
    /// clone 時使用的分支
    #[arg(short, long)]
    branch: Option<String>,
    /// 包含 node_modules
    #[arg(long)]
    include_node_modules: bool,
    /// 包含測試檔案
    #[arg(long)]
    include_tests: bool,
    /// 包含文件（docs 目錄與 .md 檔案）
    #[arg(long)]
    include_docs: bool,
    /// 單一檔案大小上限（MB）
    #[arg(long)]
    max_file_size: Option<String>,
    /// OpenAI（或其他 GPT 服務）端點
    #[arg(long)]
    api_url: Option<String>,
    /// OpenAI API 金鑰或 GPT 令牌
    #[arg(long)]
    api_key: Option<String>,
    /// GPT 模型名稱
    #[arg(long)]
    model: Option<String>,
    /// 僅輸出 JSON 格式（無 markdown）
    #[arg(long)]
    json: bool,
    /// 輸出檔案路徑（預設：analysis_report.{json|md}）
    #[arg(short, long)]
    output: Option<String>,
    /// 日誌級別 (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 初始化專案配置
    Init,
    /// 配置設定
    Config {
        /// 使用全局配置
        #[arg(short, long)]
        global: bool,
    },
    /// 列出或產生 ingestion 工具的輸出
    Ingest {
        /// 倉庫路徑或 Git URL
        #[arg(short, long)]
        repo: Option<String>,
        /// 輸出檔名使用的倉庫 id（預設由路徑或 URL 推導）
        #[arg(long)]
        id: Option<String>,
        /// 執行 ingestion 工具後再分析
        #[arg(long)]
        run: bool,
        /// 分析最近處理過的倉庫
        #[arg(long, conflicts_with_all = ["repo", "id", "run"])]
        latest: bool,
    },
    /// 從 JSON 生成 Markdown 報告
    GenerateMd {
        /// JSON 報告路徑
        #[arg(short, long)]
        report: String,
        /// 輸出的 Markdown 檔案路徑
        #[arg(short, long)]
        output: Option<String>,
    },
}

impl Args {
    fn filters(&self, config: &Config) -> FilterConfig {
        let filters = FilterConfig {
            include_node_modules: self.include_node_modules,
            include_tests: self.include_tests,
            include_docs: self.include_docs,
            binary_threshold: config.thresholds.binary_ratio,
            ..FilterConfig::default()
        };
        match &self.max_file_size {
            Some(size) => filters.with_max_file_size_mb(size),
            None => filters,
        }
    }

    /// 命令行參數優先於配置文件
    fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        config
    }

    fn output_path(&self, config: &Config) -> String {
        if let Some(path) = self.output.clone().or_else(|| config.output.clone()) {
            path
        } else if self.json {
            "analysis_report.json".to_string()
        } else {
            "analysis_report.md".to_string()
        }
    }
}

async fn run_job(args: &Args, config: &Config, request: JobRequest) -> Result<()> {
    if config.api_key.is_empty() {
        warn!("API key 為空，分析請求可能會失敗");
    }
    let analyzer = Arc::new(Analyzer::from_config(config));
    let job = analyzer.spawn(request).await?;

    match job.status {
        JobStatus::Completed => {}
        status => {
            let reason = job.error.unwrap_or_else(|| "未知錯誤".to_string());
            error!(job = %job.id, %status, "分析工作未完成：{}", reason);
            return Err(anyhow!("分析失敗：{}", reason));
        }
    }
    let result = job
        .result
        .ok_or_else(|| anyhow!("分析工作沒有產生結果"))?;

    let output_path = args.output_path(config);
    if args.json || output_path.ends_with(".json") {
        let json_report = serde_json::to_string_pretty(&result)?;
        std::fs::write(&output_path, &json_report)?;
        info!("分析完成！JSON 報告已寫入 {}", output_path);
    } else {
        markdown::generate_markdown_report(&result, &output_path).await?;
        info!("分析完成！Markdown 報告已寫入 {}", output_path);
    }
    info!(
        "安全性：{}（{}），程式碼品質：{}（{}）",
        result.security_grade.letter,
        result.security_grade.score,
        result.quality_grade.letter,
        result.quality_grade.score
    );
    Ok(())
}

async fn ingest(
    args: &Args,
    config: &Config,
    repo: Option<&str>,
    id: Option<&str>,
    run: bool,
    latest: bool,
) -> Result<()> {
    let store = IngestStore::new(config.ingest_dir());
    if latest {
        let id = store
            .latest_repository()?
            .ok_or_else(|| anyhow!("{} 中沒有已處理的倉庫", store.dir().display()))?;
        info!(id = %id, "分析最近處理的倉庫");
        return analyze_ingested(args, config, id).await;
    }
    let Some(repo) = repo else {
        let ids = store.list_repositories()?;
        if ids.is_empty() {
            println!("{} 中沒有已處理的倉庫", store.dir().display());
        }
        for id in ids {
            println!("{}", id);
        }
        return Ok(());
    };

    let id = id.map_or_else(|| derive_repo_id(repo), str::to_string);
    if run {
        let runner = IngestRunner::new(config.ingest_command.clone(), store);
        let ingested = runner.run(repo, Some(&id)).await?;
        info!(
            id = %ingested.id,
            content_bytes = ingested.content.len(),
            "ingestion 完成"
        );
    }
    analyze_ingested(args, config, id).await
}

async fn analyze_ingested(args: &Args, config: &Config, id: String) -> Result<()> {
    let request = JobRequest {
        source: RepoSource::Ingested(id),
        branch: args.branch.clone(),
        filters: args.filters(config),
    };
    run_job(args, config, request).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 設置日誌級別
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let project_path = PathBuf::from(&args.path);
    if args.url.is_none() && !project_path.exists() {
        error!("指定的路徑不存在：{}", project_path.display());
        return Err(anyhow!("指定的路徑不存在：{}", project_path.display()));
    }
    // 配置從目前工作目錄讀取，分析本機路徑時則從該路徑讀取
    let config_dir = if args.url.is_some() {
        Path::new(".")
    } else {
        project_path.as_path()
    };

    match &args.command {
        Some(Commands::Init) => {
            config::init_project(&project_path)?;
        }
        Some(Commands::Config { global }) => {
            config::configure_interactive(&project_path, *global).await?;
        }
        Some(Commands::Ingest {
            repo,
            id,
            run,
            latest,
        }) => {
            let config = args.apply_overrides(config::get_effective_config(config_dir)?);
            ingest(&args, &config, repo.as_deref(), id.as_deref(), *run, *latest).await?;
        }
        Some(Commands::GenerateMd { report, output }) => {
            markdown::generate_md_from_json(report, output.as_deref()).await?;
        }
        None => {
            let config = args.apply_overrides(config::get_effective_config(config_dir)?);
            let source = match &args.url {
                Some(url) => RepoSource::Url(url.clone()),
                None => RepoSource::Path(project_path.clone()),
            };
            info!("開始分析：{:?}", source);
            let request = JobRequest {
                source,
                branch: args.branch.clone(),
                filters: args.filters(&config),
            };
            run_job(&args, &config, request).await?;
        }
    }

    Ok(())
}
