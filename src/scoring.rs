use crate::models::{Finding, Grade, IssueType, Severity};

pub const PERFECT_SCORE: i64 = 100;

/// 安全與品質共用的等級表：每個等級的最低分，由高到低
const LADDER: &[(i64, &str)] = &[
    (97, "A+"),
    (93, "A"),
    (90, "A-"),
    (87, "B+"),
    (83, "B"),
    (80, "B-"),
    (77, "C+"),
    (73, "C"),
    (70, "C-"),
    (67, "D+"),
    (63, "D"),
    (60, "D-"),
];

pub fn letter_for(score: i64) -> &'static str {
    LADDER
        .iter()
        .find(|(min, _)| score >= *min)
        .map(|(_, letter)| *letter)
        .unwrap_or("F")
}

fn grade(score: i64) -> Grade {
    Grade {
        score,
        letter: letter_for(score).to_string(),
    }
}

fn severity_penalty(severity: Severity) -> i64 {
    match severity {
        Severity::High => 30,
        Severity::Medium => 10,
        Severity::Low => 3,
    }
}

fn issue_penalty(issue_type: IssueType) -> i64 {
    match issue_type {
        IssueType::Error => 15,
        IssueType::Warning => 5,
        IssueType::Improvement => 1,
    }
}

pub fn security_grade(vulnerabilities: &[Finding]) -> Grade {
    let penalty: i64 = vulnerabilities
        .iter()
        .filter_map(Finding::severity)
        .map(severity_penalty)
        .sum();
    grade(PERFECT_SCORE - penalty)
}

pub fn quality_grade(issues: &[Finding]) -> Grade {
    let penalty: i64 = issues
        .iter()
        .filter_map(Finding::issue_type)
        .map(issue_penalty)
        .sum();
    grade(PERFECT_SCORE - penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FindingKind;

    fn vuln(severity: Severity) -> Finding {
        Finding {
            kind: FindingKind::Vulnerability { severity },
            title: "t".to_string(),
            description: String::new(),
            file: None,
            line: None,
        }
    }

    fn issue(issue_type: IssueType) -> Finding {
        Finding {
            kind: FindingKind::QualityIssue { issue_type },
            title: "t".to_string(),
            description: String::new(),
            file: None,
            line: None,
        }
    }

    #[test]
    fn no_findings_is_a_plus() {
        assert_eq!(security_grade(&[]).letter, "A+");
        assert_eq!(quality_grade(&[]).letter, "A+");
    }

    #[test]
    fn ladder_boundaries() {
        assert_eq!(letter_for(97), "A+");
        assert_eq!(letter_for(96), "A");
        assert_eq!(letter_for(90), "A-");
        assert_eq!(letter_for(89), "B+");
        assert_eq!(letter_for(80), "B-");
        assert_eq!(letter_for(73), "C");
        assert_eq!(letter_for(60), "D-");
        assert_eq!(letter_for(59), "F");
        assert_eq!(letter_for(-200), "F");
    }

    #[test]
    fn penalties_per_kind() {
        let g = security_grade(&[vuln(Severity::High), vuln(Severity::Low)]);
        assert_eq!(g.score, 67);
        assert_eq!(g.letter, "D+");

        let g = quality_grade(&[
            issue(IssueType::Error),
            issue(IssueType::Warning),
            issue(IssueType::Improvement),
        ]);
        assert_eq!(g.score, 79);
        assert_eq!(g.letter, "C+");
    }

    #[test]
    fn grade_never_improves_with_more_severe_findings() {
        let mut findings = vec![vuln(Severity::Medium), vuln(Severity::Low)];
        let mut previous = security_grade(&findings).score;
        for _ in 0..6 {
            findings.push(vuln(Severity::High));
            let score = security_grade(&findings).score;
            assert!(score <= previous);
            previous = score;
        }

        let mut issues = vec![issue(IssueType::Warning)];
        let mut previous = quality_grade(&issues).score;
        for _ in 0..10 {
            issues.push(issue(IssueType::Error));
            let score = quality_grade(&issues).score;
            assert!(score <= previous);
            previous = score;
        }
    }

    #[test]
    fn quality_findings_do_not_affect_security() {
        assert_eq!(security_grade(&[issue(IssueType::Error)]).score, 100);
    }
}
