//! Mailer trait (§1 "out of scope... email formatting and SMTP delivery"):
//! the collaborator the Scheduler (§4.J) hands a finished `TestReport` to
//! when `send_email` is set. Grounded in `email_utils.py`'s
//! `send_report_email(report, to_list) -> (ok, msg)` signature.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::model::TestReport;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_report(&self, report: &TestReport, recipients: &[String]) -> Result<(), EngineError>;
}

/// Used when no mailer is configured, or by tests that only care whether the
/// Scheduler *attempted* to send.
#[derive(Default)]
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_report(&self, report: &TestReport, recipients: &[String]) -> Result<(), EngineError> {
        tracing::info!(
            report_id = report.id,
            recipients = recipients.len(),
            "mailer not configured, dropping report email"
        );
        Ok(())
    }
}
