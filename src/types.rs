use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEvent {
    UserPrompt,
    BotResponse,
}

impl MessageEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageEvent::UserPrompt => "user_prompt",
            MessageEvent::BotResponse => "bot_response",
        }
    }
}

impl FromStr for MessageEvent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user_prompt" => Ok(MessageEvent::UserPrompt),
            "bot_response" => Ok(MessageEvent::BotResponse),
            other => Err(format!("unknown message event `{other}`")),
        }
    }
}

/// One stored chat turn. Append-only; ordered by `created_at` within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub event: MessageEvent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevanceTag {
    #[serde(rename = "Not relevant")]
    NotRelevant,
    #[serde(rename = "Weak lead")]
    WeakLead,
    #[serde(rename = "Hot lead")]
    HotLead,
    #[serde(rename = "Very big potential customer")]
    VeryBigPotentialCustomer,
}

impl RelevanceTag {
    pub const ALL: [RelevanceTag; 4] = [
        RelevanceTag::NotRelevant,
        RelevanceTag::WeakLead,
        RelevanceTag::HotLead,
        RelevanceTag::VeryBigPotentialCustomer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RelevanceTag::NotRelevant => "Not relevant",
            RelevanceTag::WeakLead => "Weak lead",
            RelevanceTag::HotLead => "Hot lead",
            RelevanceTag::VeryBigPotentialCustomer => "Very big potential customer",
        }
    }
}

impl FromStr for RelevanceTag {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RelevanceTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == value)
            .ok_or_else(|| format!("unknown relevance tag `{value}`"))
    }
}

/// Qualification step asserted by the model on each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepId {
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "companyName")]
    CompanyName,
    #[serde(rename = "companyInfo")]
    CompanyInfo,
    #[serde(rename = "done")]
    Done,
}

impl StepId {
    pub const ALL: [StepId; 4] = [
        StepId::Email,
        StepId::CompanyName,
        StepId::CompanyInfo,
        StepId::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::Email => "email",
            StepId::CompanyName => "companyName",
            StepId::CompanyInfo => "companyInfo",
            StepId::Done => "done",
        }
    }
}

impl FromStr for StepId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|step| step.as_str() == value)
            .ok_or_else(|| format!("unknown step `{value}`"))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub session_id: String,
    pub email: String,
    pub company_name: String,
    pub company_info: String,
    pub relevance_tag: Option<RelevanceTag>,
    pub step: Option<StepId>,
    pub chat_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written by one create-or-update of the lead for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadUpsert {
    pub session_id: String,
    pub email: String,
    pub company_name: String,
    pub company_info: String,
    pub relevance_tag: Option<RelevanceTag>,
    pub step: StepId,
    pub chat_completed: bool,
}

/// Lead fields as the model reports them. Missing values are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedLead {
    pub email: String,
    pub company_name: String,
    pub company_info: String,
    relevance_tag: Option<String>,
}

impl ExtractedLead {
    pub fn relevance_tag(&self) -> Option<RelevanceTag> {
        self.relevance_tag
            .as_deref()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .and_then(|tag| tag.parse().ok())
    }
}

/// The structured reply the model must produce each turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub step_id: StepId,
    pub lead: ExtractedLead,
    pub bot_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: i64,
    pub total_pages: i64,
    pub total_leads: i64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl Pagination {
    pub fn new(page: i64, page_size: i64, total_leads: i64) -> Self {
        let page_size = page_size.max(1);
        let total_pages = total_leads.saturating_add(page_size - 1) / page_size;
        Self {
            current_page: page,
            total_pages,
            total_leads,
            has_next_page: page.saturating_mul(page_size) < total_leads,
            has_prev_page: page > 1,
        }
    }

    /// Rows to skip for a 1-based `page`. Saturates instead of overflowing on
    /// absurd page numbers, which then simply yield an empty page.
    pub fn offset(page: i64, page_size: i64) -> i64 {
        (page.max(1) - 1).saturating_mul(page_size.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadPage {
    pub data: Vec<Lead>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotResponse {
    pub message: String,
    pub event: MessageEvent,
    pub session_id: String,
}

impl BotResponse {
    pub fn new(session_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            event: MessageEvent::BotResponse,
            session_id: session_id.to_string(),
        }
    }
}

/// Reply to a fetch request: `{message, event, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketResponse<T> {
    pub message: String,
    pub event: String,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub disconnected: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub update_session: bool,
    pub session_id: Option<String>,
}

fn empty_object() -> Value {
    json!({})
}

impl ErrorNotice {
    pub fn new(message: impl Into<String>, session_id: Option<&str>) -> Self {
        Self {
            message: message.into(),
            data: empty_object(),
            restart: false,
            disconnected: false,
            update_session: false,
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn restart(mut self) -> Self {
        self.restart = true;
        self
    }

    pub fn update_session(mut self) -> Self {
        self.update_session = true;
        self
    }
}

/// Every frame sent to a client: `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Initialize {
        #[serde(rename = "messageHistory")]
        message_history: Vec<Message>,
    },
    BotResponse(BotResponse),
    FetchedMessages(SocketResponse<Vec<Message>>),
    FetchedLeads(SocketResponse<LeadPage>),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Initialize { .. } => "initialize",
            ServerEvent::BotResponse(_) => "bot_response",
            ServerEvent::FetchedMessages(_) => "fetched_messages",
            ServerEvent::FetchedLeads(_) => "fetched_leads",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "PROCESS_MESSAGE")]
    ProcessMessage,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::ProcessMessage => "PROCESS_MESSAGE",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PROCESS_MESSAGE" => Ok(JobType::ProcessMessage),
            other => Err(format!("unknown job type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessageJob {
    pub message: String,
    pub socket_id: String,
    pub session_id: String,
    #[serde(default)]
    pub resumed_session: bool,
}

/// Payload of a queued job, tagged by its `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobData {
    #[serde(rename = "PROCESS_MESSAGE")]
    ProcessMessage(ProcessMessageJob),
}

impl JobData {
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::ProcessMessage(_) => JobType::ProcessMessage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub data: JobData,
    /// Lower runs first; defaults to 2 when absent.
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(data: JobData) -> Self {
        Self {
            data,
            priority: None,
            delay: None,
        }
    }
}
