// Result Reporter
// Renders a result set as JUnit XML, TAP, or terminal text

use crate::execution::checks::{CheckResult, CheckStatus, SubCheckResult};
use crate::results::aggregate::ResultSet;

use std::fmt;
use std::time::Duration;

/// Output format for result reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// JUnit XML, one testsuite per group
    JUnit,
    /// TAP version 13
    Tap,
    Terminal,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Tap => write!(f, "tap"),
            ReportFormat::Terminal => write!(f, "terminal"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "tap" => Ok(ReportFormat::Tap),
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: junit, tap, terminal",
                s
            )),
        }
    }
}

/// Formats a `ResultSet` for CI systems and humans
pub struct ResultReporter;

impl ResultReporter {
    pub fn report(results: &ResultSet, format: ReportFormat) -> String {
        match format {
            ReportFormat::JUnit => Self::to_junit_xml(results),
            ReportFormat::Tap => Self::to_tap(results),
            ReportFormat::Terminal => Self::to_terminal(results),
        }
    }

    pub fn to_junit_xml(results: &ResultSet) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuites tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
            results.len(),
            results.failed(),
            total_duration(results.iter().map(|(_, _, r)| r)).as_secs_f64()
        ));

        for group in results.group_names() {
            let Some(entries) = results.group(group) else {
                continue;
            };
            let failed = entries.values().filter(|r| !r.success()).count();
            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
                xml_escape(group),
                entries.len(),
                failed,
                total_duration(entries.values()).as_secs_f64()
            ));

            for (name, result) in entries {
                xml.push_str(&format!(
                    "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
                    xml_escape(group),
                    xml_escape(name),
                    result.duration.as_secs_f64()
                ));

                if result.success() {
                    xml.push_str(" />\n");
                    continue;
                }

                xml.push_str(">\n");
                let kind = match result.status {
                    CheckStatus::TimedOut => "timeout",
                    _ => "failure",
                };
                xml.push_str(&format!(
                    "      <failure type=\"{}\" message=\"{}\">\n",
                    kind,
                    xml_escape(&failure_message(result))
                ));
                for step in failed_steps(result) {
                    xml.push_str(&format!(
                        "        {} [{}]: {}\n",
                        step.check,
                        step.status,
                        xml_escape(&step.commands.join(" && "))
                    ));
                }
                xml.push_str("      </failure>\n");
                xml.push_str("    </testcase>\n");
            }

            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    pub fn to_tap(results: &ResultSet) -> String {
        let mut tap = String::new();
        tap.push_str("TAP version 13\n");
        tap.push_str(&format!("1..{}\n", results.len()));

        for (i, (group, name, result)) in results.iter().enumerate() {
            let number = i + 1;
            if result.success() {
                tap.push_str(&format!("ok {} - {}/{}\n", number, group, name));
                continue;
            }

            tap.push_str(&format!("not ok {} - {}/{}\n", number, group, name));
            tap.push_str("  ---\n");
            tap.push_str(&format!("  status: {}\n", result.status));
            tap.push_str(&format!("  duration_ms: {}\n", result.duration.as_millis()));
            tap.push_str(&format!("  message: \"{}\"\n", failure_message(result)));

            let failed: Vec<_> = failed_steps(result).collect();
            if !failed.is_empty() {
                tap.push_str("  steps:\n");
                for step in failed {
                    tap.push_str(&format!("    - check: {}\n", step.check));
                    tap.push_str(&format!("      status: {}\n", step.status));
                    if let Some(code) = step.exit_code {
                        tap.push_str(&format!("      exit_code: {}\n", code));
                    }
                }
            }
            tap.push_str("  ...\n");
        }

        tap.push_str(&format!(
            "# tests {}\n# pass {}\n# fail {}\n# duration {:.3}s\n",
            results.len(),
            results.len() - results.failed(),
            results.failed(),
            total_duration(results.iter().map(|(_, _, r)| r)).as_secs_f64()
        ));

        tap
    }

    pub fn to_terminal(results: &ResultSet) -> String {
        let mut out = String::new();

        for group in results.group_names() {
            let Some(entries) = results.group(group) else {
                continue;
            };
            out.push_str(&format!("\nChange: {}\n", group));
            out.push_str(&"=".repeat(60));
            out.push('\n');

            for (name, result) in entries {
                let (symbol, status) = match result.status {
                    CheckStatus::Passed | CheckStatus::Skipped => ("+", "PASS"),
                    CheckStatus::Failed => ("x", "FAIL"),
                    CheckStatus::TimedOut => ("!", "TIME"),
                };
                out.push_str(&format!(
                    "  [{}] {} ({:.2}s) {}\n",
                    symbol,
                    status,
                    result.duration.as_secs_f64(),
                    name,
                ));

                if let Some(cause) = &result.cause {
                    out.push_str(&format!("       artifact: {}\n", cause));
                }
                for step in failed_steps(result) {
                    out.push_str(&format!("       {}: {}\n", step.check, step.status));
                }
            }
        }

        out.push_str(&"-".repeat(60));
        out.push('\n');

        let duration = total_duration(results.iter().map(|(_, _, r)| r));
        let status_line = if results.success() {
            format!("  All {} entries passed ({:.2}s)", results.len(), duration.as_secs_f64())
        } else {
            format!(
                "  {} of {} entries failed ({:.2}s)",
                results.failed(),
                results.len(),
                duration.as_secs_f64()
            )
        };
        out.push_str(&status_line);
        out.push('\n');

        out
    }
}

fn total_duration<'a>(results: impl Iterator<Item = &'a CheckResult>) -> Duration {
    results.map(|r| r.duration).sum()
}

fn failed_steps(result: &CheckResult) -> impl Iterator<Item = &SubCheckResult> {
    result
        .steps
        .iter()
        .filter(|s| matches!(s.status, CheckStatus::Failed | CheckStatus::TimedOut))
}

fn failure_message(result: &CheckResult) -> String {
    if let Some(cause) = &result.cause {
        return format!("artifact preparation failed: {}", cause);
    }
    let failed: Vec<&str> = failed_steps(result).map(|s| s.check.as_str()).collect();
    match failed.as_slice() {
        [] => format!("entry {}", result.status),
        checks => format!("{} {}", checks.join(", "), result.status),
    }
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
