use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::JobError;

/// 收集後的單一檔案，建立後不再修改
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,

    pub content: String,

    pub size: u64,

    pub language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplexityLevel::Low => write!(f, "Low"),
            ComplexityLevel::Medium => write!(f, "Medium"),
            ComplexityLevel::High => write!(f, "High"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RepositoryStats {
    pub total_files: usize,

    pub total_lines: usize,

    pub blank_lines: usize,

    pub comment_lines: usize,

    pub code_lines: usize,

    /// 語言 -> 行數百分比（四捨五入）
    pub languages: BTreeMap<String, u32>,

    pub average_lines_per_file: f64,

    pub average_complexity: f64,

    pub complexity: ComplexityLevel,
}

impl RepositoryStats {
    /// 佔比最高的語言
    pub fn primary_language(&self) -> Option<(&str, u32)> {
        self.languages
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(name, share)| (name.as_str(), *share))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KeyFileScore {
    pub path: String,

    pub score: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeyFileSummary {
    pub path: String,

    pub score: i64,

    pub language: Option<String>,

    pub lines: usize,

    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueType {
    Error,
    Warning,
    Improvement,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    Vulnerability { severity: Severity },
    QualityIssue { issue_type: IssueType },
}

/// 由回應解析器產生的發現項目
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Finding {
    #[serde(flatten)]
    pub kind: FindingKind,

    pub title: String,

    pub description: String,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub line: Option<u32>,
}

impl Finding {
    pub fn severity(&self) -> Option<Severity> {
        match self.kind {
            FindingKind::Vulnerability { severity } => Some(severity),
            FindingKind::QualityIssue { .. } => None,
        }
    }

    pub fn issue_type(&self) -> Option<IssueType> {
        match self.kind {
            FindingKind::QualityIssue { issue_type } => Some(issue_type),
            FindingKind::Vulnerability { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DocumentationSections {
    pub overview: String,

    pub architecture: String,

    pub setup: String,

    pub deployment: String,
}

impl DocumentationSections {
    pub fn is_empty(&self) -> bool {
        self.overview.is_empty()
            && self.architecture.is_empty()
            && self.setup.is_empty()
            && self.deployment.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Grade {
    pub score: i64,

    pub letter: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisResult {
    pub repository: String,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub commit: Option<String>,

    pub stats: RepositoryStats,

    pub key_files: Vec<KeyFileSummary>,

    pub vulnerabilities: Vec<Finding>,

    pub quality_issues: Vec<Finding>,

    pub insights: Vec<String>,

    pub documentation: DocumentationSections,

    pub security_grade: Grade,

    pub quality_grade: Grade,

    pub complexity: ComplexityLevel,

    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 一次分析工作。狀態只能 pending -> processing -> completed | failed
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisJob {
    pub id: Uuid,

    pub status: JobStatus,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result: Option<AnalysisResult>,

    #[serde(default)]
    pub error: Option<String>,
}

impl Default for AnalysisJob {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisJob {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !allowed {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, result: AnalysisResult) -> Result<(), JobError> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.result = None;
        self.error = Some(error.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_moves_through_happy_path() {
        let mut job = AnalysisJob::new();
        assert_eq!(job.status, JobStatus::Pending);
        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        job.fail("clone failed").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error.as_deref(), Some("clone failed"));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = AnalysisJob::new();
        job.start().unwrap();
        job.fail("boom").unwrap();
        assert!(job.start().is_err());
        assert!(job.fail("again").is_err());
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_job_cannot_complete_directly() {
        let mut job = AnalysisJob::new();
        let err = job.fail("nope").unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn finding_serializes_with_kind_tag() {
        let finding = Finding {
            kind: FindingKind::Vulnerability {
                severity: Severity::High,
            },
            title: "SQL injection".to_string(),
            description: String::new(),
            file: Some("src/db.js".to_string()),
            line: Some(12),
        };
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["kind"], "vulnerability");
        assert_eq!(json["severity"], "High");
        let back: Finding = serde_json::from_value(json).unwrap();
        assert_eq!(back, finding);
    }
}
