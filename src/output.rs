//! The JSON object printed when the process exits.

use serde::Serialize;

use crate::{error::PruneError, orchestrator::RunReport};

pub const CANCELLED_MESSAGE: &str = "run cancelled before all repositories were processed";

#[derive(Debug, Serialize)]
pub struct ProgramOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

impl ProgramOutput {
    /// The configuration could not be loaded; nothing ran.
    pub fn from_config_error(err: &anyhow::Error) -> Self {
        Self {
            success: false,
            error_message: Some(format!("{err:#}")),
            report: None,
        }
    }

    /// Non-fatal failures are listed in `error_message` even when the run
    /// still counts as a success.
    pub fn from_run(result: Result<RunReport, PruneError>, strict: bool) -> Self {
        match result {
            Ok(report) => {
                let error_message = if report.cancelled {
                    Some(CANCELLED_MESSAGE.to_string())
                } else if report.has_errors() {
                    Some(
                        report
                            .failures
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; "),
                    )
                } else {
                    None
                };

                Self {
                    success: report.succeeded(strict),
                    error_message,
                    report: Some(report),
                }
            }
            Err(err) => Self {
                success: false,
                error_message: Some(err.to_string()),
                report: None,
            },
        }
    }
}
