//! Structured RPC test results (`[RPC-TEST-RESULT] {json}` lines).

use std::collections::BTreeMap;

use logscope_core::formatting::format_count;
use logscope_core::models::{EventRecord, Verdict};
use logscope_report::{Section, Table};

use super::{AnalysisRequest, Findings};
use crate::extractor::ExtractedLog;
use crate::registry::{FieldSpec, PatternRegistry, PatternRule, PayloadFormat};

pub const MARKER: &str = "[RPC-TEST-RESULT]";

const RULE: &str = "rpc-result";
const CRITERIA_PREFIX: &str = "ValidationCriteria.";

pub fn registry() -> PatternRegistry {
    PatternRegistry::new().with(
        PatternRule::payload(RULE, MARKER, PayloadFormat::Json).fields([
            FieldSpec::string("TestClass"),
            FieldSpec::string("TestName"),
            FieldSpec::string("Result"),
            FieldSpec::string("ExecutingMachine"),
        ]),
    )
}

// ── Test results ──────────────────────────────────────────────────────────────

/// One expected/actual pair from `ValidationCriteria`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Criterion {
    name: String,
    expected: String,
    actual: String,
}

impl Criterion {
    fn matches(&self) -> bool {
        self.expected == self.actual
    }
}

/// One execution of one test on one machine.
#[derive(Debug, Clone)]
struct TestResult {
    test_class: String,
    test_name: String,
    result: String,
    machine: String,
    correlation_id: String,
    error_message: Option<String>,
    expected_behavior: Option<String>,
    criteria: Vec<Criterion>,
}

impl TestResult {
    fn from_record(record: &EventRecord) -> Self {
        let text = |name: &str, default: &str| {
            record
                .get(name)
                .map(ToString::to_string)
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            test_class: text("TestClass", "Unknown"),
            test_name: text("TestName", "Unknown"),
            result: text("Result", "UNKNOWN"),
            machine: text("ExecutingMachine", "Unknown"),
            correlation_id: text("CorrelationId", "-1"),
            error_message: record.get("ErrorMessage").map(ToString::to_string),
            expected_behavior: record
                .get("ExpectedBehavior")
                .map(ToString::to_string)
                .filter(|s| !s.is_empty()),
            criteria: criteria(record),
        }
    }

    fn is_pass(&self) -> bool {
        self.result == "PASS"
    }

    fn is_fail(&self) -> bool {
        self.result == "FAIL"
    }

    fn full_name(&self) -> String {
        format!("{}.{}", self.test_class, self.test_name)
    }
}

/// Collect `ValidationCriteria.<name>.Expected` / `.Actual` pairs; a missing
/// side reads `?`.
fn criteria(record: &EventRecord) -> Vec<Criterion> {
    let mut pairs: BTreeMap<&str, (Option<String>, Option<String>)> = BTreeMap::new();
    for (key, value) in &record.fields {
        let Some(rest) = key.strip_prefix(CRITERIA_PREFIX) else {
            continue;
        };
        if let Some(name) = rest.strip_suffix(".Expected") {
            pairs.entry(name).or_default().0 = Some(value.to_string());
        } else if let Some(name) = rest.strip_suffix(".Actual") {
            pairs.entry(name).or_default().1 = Some(value.to_string());
        }
    }
    pairs
        .into_iter()
        .map(|(name, (expected, actual))| Criterion {
            name: name.to_string(),
            expected: expected.unwrap_or_else(|| "?".to_string()),
            actual: actual.unwrap_or_else(|| "?".to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestStatus {
    Passed,
    Failed,
    Mixed,
}

fn status(results: &[TestResult]) -> TestStatus {
    if results.iter().any(TestResult::is_fail) {
        TestStatus::Failed
    } else if results.iter().all(TestResult::is_pass) {
        TestStatus::Passed
    } else {
        TestStatus::Mixed
    }
}

// ── Analysis ──────────────────────────────────────────────────────────────────

pub fn analyze(log: &ExtractedLog, _request: &AnalysisRequest) -> Findings {
    let results: Vec<TestResult> = log.of_kind(RULE).map(TestResult::from_record).collect();
    if results.is_empty() {
        let mut findings = Findings::new(Verdict::Skip, "No test results found");
        findings.push(Section::new("Summary").paragraph(format!(
            "No {} entries found in the logs.",
            MARKER
        )));
        return findings;
    }

    let mut by_test: BTreeMap<String, Vec<TestResult>> = BTreeMap::new();
    for result in &results {
        by_test.entry(result.full_name()).or_default().push(result.clone());
    }

    let statuses: Vec<TestStatus> = by_test.values().map(|r| status(r)).collect();
    let passed_tests = statuses.iter().filter(|s| **s == TestStatus::Passed).count();
    let failed_tests = statuses.iter().filter(|s| **s == TestStatus::Failed).count();
    let mixed_tests = statuses.len() - passed_tests - failed_tests;
    let passed_runs = results.iter().filter(|r| r.is_pass()).count();
    let failed_runs = results.iter().filter(|r| r.is_fail()).count();

    let mut findings = if failed_tests > 0 {
        Findings::new(Verdict::Fail, format!("{} test(s) failed", failed_tests))
    } else {
        Findings::new(Verdict::Pass, "All tests passed")
    };

    let count = |n: usize| format_count(n as u64);
    findings.push(
        Section::new("Summary")
            .fact("Unique tests", count(by_test.len()))
            .fact("Passed", count(passed_tests))
            .fact("Failed", count(failed_tests))
            .fact("Mixed results", count(mixed_tests))
            .fact("Executions", count(results.len()))
            .fact("Passed executions", count(passed_runs))
            .fact("Failed executions", count(failed_runs)),
    );

    if failed_tests > 0 {
        let mut section = Section::new("Failed Tests");
        for (name, runs) in &by_test {
            let failures: Vec<&TestResult> = runs.iter().filter(|r| r.is_fail()).collect();
            if failures.is_empty() {
                continue;
            }
            section = section.paragraph(name.clone());
            for failure in failures {
                let mut items = vec![
                    format!("Machine: {}", failure.machine),
                    format!("Correlation ID: {}", failure.correlation_id),
                ];
                if let Some(error) = &failure.error_message {
                    items.push(format!("Error: {}", error));
                }
                items.extend(
                    failure
                        .criteria
                        .iter()
                        .filter(|c| !c.matches())
                        .map(|c| format!("{}: Expected {}, Got {}", c.name, c.expected, c.actual)),
                );
                section = section.list(items);
            }
        }
        findings.push(section);
    }

    for (name, runs) in &by_test {
        let label = match status(runs) {
            TestStatus::Passed => "PASS",
            TestStatus::Failed => "FAIL",
            TestStatus::Mixed => "MIXED",
        };
        let mut ordered: Vec<&TestResult> = runs.iter().collect();
        ordered.sort_by(|a, b| a.machine.cmp(&b.machine));

        let mut table = Table::new(["Machine", "Status", "Correlation ID", "Validation"]);
        for run in ordered {
            let validation: Vec<String> = run
                .criteria
                .iter()
                .map(|c| {
                    let mark = if c.matches() { "ok" } else { "MISMATCH" };
                    format!("{}: {}/{} {}", c.name, c.expected, c.actual, mark)
                })
                .collect();
            table.push_row([
                run.machine.clone(),
                run.result.clone(),
                run.correlation_id.clone(),
                validation.join("; "),
            ]);
        }

        let mut section = Section::new(format!("[{}] {}", label, name)).table(table);
        if let Some(behavior) = runs.first().and_then(|r| r.expected_behavior.as_ref()) {
            section = section.fact("Expected behavior", behavior.clone());
        }
        findings.push(section);
    }

    findings
}

// ── Tests ──────────────────────────────────────────────────────────────────────
