//! Turns one user message into one model-driven qualification step.
//!
//! The current step is never held in memory: every invocation replays the
//! stored history to the model and records whatever step and lead fields it
//! reports. A lead is written only once an email is known, and completion is
//! sticky.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, StoreError};
use crate::llm::{ChatTurn, LanguageModel};
use crate::prompting::RESUME_SESSION_PROMPT;
use crate::realtime::Notifier;
use crate::store::{LeadStore, MessageStore};
use crate::types::{
    BotResponse, ErrorNotice, ExtractedLead, ExtractionResult, Lead, LeadUpsert, MessageEvent,
    ProcessMessageJob, ServerEvent, StepId,
};

pub const RESTART_KEYWORD: &str = "RESTART";

pub const SESSION_COMPLETED_NOTICE: &str =
    "Thank you for chatting with us! Type RESTART if you would like to begin a new session.";
pub const MALFORMED_REPLY_NOTICE: &str =
    "An error occurred while processing your information, please try again. ERROR: CPRD001";
pub const MISSING_STEP_NOTICE: &str =
    "An error occurred while processing your information ERROR: CFSIDX";
pub const EXISTING_SESSION_NOTICE: &str =
    "We found an existing session. Would you like to continue where you left off?";
pub const DATABASE_ERROR_NOTICE: &str =
    "An error occurred while processing your information. ERROR: DBERR";
pub const LEAD_NOT_SAVED_NOTICE: &str =
    "An error occurred while processing your information. ERROR: CFOULD";
pub const MESSAGE_NOT_SAVED_NOTICE: &str =
    "An error occurred while processing your information: UTCMH";
pub const INTERNAL_ERROR_NOTICE: &str =
    "An error occurred while processing your information. ERROR: ISRQF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("model reply is not a JSON object")]
    Malformed,
    #[error("model reply has no valid step_id")]
    MissingStep,
}

/// Parse the model's reply into an extraction result.
///
/// Accepts the object bare, wrapped in a code fence, or surrounded by stray
/// text. An unknown `step_id` counts as missing.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, ExtractionError> {
    let trimmed = raw.trim();
    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if !stripped.is_empty() {
            candidates.push(stripped.to_string());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    let parsed = candidates
        .iter()
        .find_map(|candidate| {
            serde_json::from_str::<Value>(candidate)
                .ok()
                .filter(Value::is_object)
        })
        .ok_or(ExtractionError::Malformed)?;

    let step_id = parsed
        .get("step_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .and_then(|step| step.parse::<StepId>().ok())
        .ok_or(ExtractionError::MissingStep)?;

    let lead = match parsed.get("lead") {
        None | Some(Value::Null) => ExtractedLead::default(),
        Some(value) => serde_json::from_value::<ExtractedLead>(value.clone())
            .map_err(|_| ExtractionError::Malformed)?,
    };

    let bot_message = parsed
        .get("botMessage")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(ExtractionResult {
        step_id,
        lead,
        bot_message,
    })
}

/// How one qualification job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The session already finished qualifying; the model was not called.
    AlreadyCompleted,
    /// The user asked to restart; the model was not called.
    Restarted,
    /// The model replied and the reply was stored and sent.
    Replied { lead: Option<Lead> },
    /// A fixed notice was sent instead of a reply.
    Rejected { code: &'static str },
}

pub struct QualificationHandler {
    messages: Arc<dyn MessageStore>,
    leads: Arc<dyn LeadStore>,
    model: Arc<dyn LanguageModel>,
    notifier: Arc<dyn Notifier>,
    system_prompt: String,
    history_limit: i64,
}

impl QualificationHandler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        leads: Arc<dyn LeadStore>,
        model: Arc<dyn LanguageModel>,
        notifier: Arc<dyn Notifier>,
        system_prompt: String,
        history_limit: i64,
    ) -> Self {
        Self {
            messages,
            leads,
            model,
            notifier,
            system_prompt,
            history_limit,
        }
    }

    /// Run one job. Pipeline failures become a notice on the originating
    /// socket; only a failure to deliver that notice is returned.
    pub async fn handle(&self, job: &ProcessMessageJob) -> Result<Outcome, AppError> {
        match self.process(job).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(session_id = %job.session_id, error = %err, "error processing message");
                self.send_error(
                    job,
                    ErrorNotice::new(INTERNAL_ERROR_NOTICE, Some(job.session_id.as_str())).restart(),
                )
                .await?;
                Ok(Outcome::Rejected { code: "ISRQF" })
            }
        }
    }

    async fn process(&self, job: &ProcessMessageJob) -> Result<Outcome, AppError> {
        let session_id = job.session_id.as_str();

        if self.leads.is_completed(session_id).await? {
            self.send_error(job, ErrorNotice::new(SESSION_COMPLETED_NOTICE, Some(session_id)))
                .await?;
            return Ok(Outcome::AlreadyCompleted);
        }

        if job.message.trim().eq_ignore_ascii_case(RESTART_KEYWORD) {
            self.send_error(
                job,
                ErrorNotice::new(SESSION_COMPLETED_NOTICE, Some(session_id)).restart(),
            )
            .await?;
            return Ok(Outcome::Restarted);
        }

        let turns = self.build_turns(job).await?;
        debug!(session_id, turns = turns.len(), "invoking language model");
        let raw = self.model.complete(&turns).await?;

        let extraction = match parse_extraction(&raw) {
            Ok(extraction) => extraction,
            Err(ExtractionError::Malformed) => {
                warn!(session_id, "model returned malformed JSON");
                self.notifier
                    .notify(
                        &job.socket_id,
                        ServerEvent::BotResponse(BotResponse::new(
                            session_id,
                            MALFORMED_REPLY_NOTICE,
                        )),
                    )
                    .await?;
                return Ok(Outcome::Rejected { code: "CPRD001" });
            }
            Err(ExtractionError::MissingStep) => {
                warn!(session_id, "model reply is missing step_id");
                self.send_error(job, ErrorNotice::new(MISSING_STEP_NOTICE, Some(session_id)))
                    .await?;
                return Ok(Outcome::Rejected { code: "CFSIDX" });
            }
        };

        let lead = if extraction.lead.email.trim().is_empty() {
            None
        } else {
            match self.record_lead(job, &extraction).await? {
                Ok(lead) => Some(lead),
                Err(code) => return Ok(Outcome::Rejected { code }),
            }
        };

        if let Err(err) = self
            .messages
            .append(session_id, &extraction.bot_message, MessageEvent::BotResponse)
            .await
        {
            error!(session_id, error = %err, "failed to store bot message");
            self.send_error(job, ErrorNotice::new(MESSAGE_NOT_SAVED_NOTICE, Some(session_id)))
                .await?;
            return Ok(Outcome::Rejected { code: "UTCMH" });
        }

        self.notifier
            .notify(
                &job.socket_id,
                ServerEvent::BotResponse(BotResponse::new(session_id, &extraction.bot_message)),
            )
            .await?;
        info!(session_id, step = %extraction.step_id, lead = lead.is_some(), "qualification step sent");
        Ok(Outcome::Replied { lead })
    }

    /// Stored turns (most recent first-to-last), an optional resume prompt,
    /// then the new user message.
    async fn build_turns(&self, job: &ProcessMessageJob) -> Result<Vec<ChatTurn>, AppError> {
        let history = self
            .messages
            .recent(&job.session_id, self.history_limit)
            .await?;

        let mut turns = Vec::with_capacity(history.len() + 3);
        turns.push(ChatTurn::system(&self.system_prompt));
        turns.extend(history.into_iter().map(|message| match message.event {
            MessageEvent::BotResponse => ChatTurn::assistant(message.content),
            MessageEvent::UserPrompt => ChatTurn::user(message.content),
        }));
        if job.resumed_session {
            turns.push(ChatTurn::assistant(RESUME_SESSION_PROMPT));
        }
        turns.push(ChatTurn::user(&job.message));
        Ok(turns)
    }

    /// Upsert the session's lead. The inner `Err` carries the support code
    /// of the notice already sent.
    async fn record_lead(
        &self,
        job: &ProcessMessageJob,
        extraction: &ExtractionResult,
    ) -> Result<Result<Lead, &'static str>, AppError> {
        let session_id = job.session_id.as_str();
        let upsert = LeadUpsert {
            session_id: session_id.to_string(),
            email: extraction.lead.email.trim().to_string(),
            company_name: extraction.lead.company_name.clone(),
            company_info: extraction.lead.company_info.clone(),
            relevance_tag: extraction.lead.relevance_tag(),
            step: extraction.step_id,
            chat_completed: extraction.step_id == StepId::Done,
        };

        // Only feeds the regression warning, so a failed read does not block the write.
        let previous_step = match self.leads.find_by_session(session_id).await {
            Ok(lead) => lead.and_then(|lead| lead.step),
            Err(err) => {
                warn!(session_id, error = %err, "could not read the current lead step");
                None
            }
        };
        if let Some(previous) = previous_step.filter(|previous| extraction.step_id < *previous) {
            warn!(
                session_id,
                from = %previous,
                to = %extraction.step_id,
                "qualification step moved backwards"
            );
        }

        match self.leads.upsert(&upsert).await {
            Ok(Some(lead)) => Ok(Ok(lead)),
            Ok(None) => {
                error!(session_id, "lead upsert returned no document");
                self.send_error(job, ErrorNotice::new(LEAD_NOT_SAVED_NOTICE, Some(session_id)))
                    .await?;
                Ok(Err("CFOULD"))
            }
            Err(StoreError::Conflict { constraint }) => {
                warn!(session_id, constraint, "lead email already belongs to another session");
                self.send_error(
                    job,
                    ErrorNotice::new(EXISTING_SESSION_NOTICE, Some(session_id))
                        .update_session()
                        .restart(),
                )
                .await?;
                Ok(Err("DUPLICATE"))
            }
            Err(err) => {
                error!(session_id, error = %err, "lead upsert failed");
                self.send_error(job, ErrorNotice::new(DATABASE_ERROR_NOTICE, Some(session_id)))
                    .await?;
                Ok(Err("DBERR"))
            }
        }
    }

    async fn send_error(&self, job: &ProcessMessageJob, notice: ErrorNotice) -> Result<(), AppError> {
        self.notifier
            .notify(&job.socket_id, ServerEvent::Error(notice))
            .await
    }
}
