//! In-memory doubles for the store, queue, model and notifier seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::{AppError, StoreError};
use crate::llm::{ChatTurn, LanguageModel};
use crate::queue::{
    JobDisposition, JobQueue, QueuedJob, RetryPolicy, DEFAULT_PRIORITY, LEASE_EXPIRED,
};
use crate::realtime::Notifier;
use crate::store::{LeadStore, MessageStore};
use crate::types::{Lead, LeadUpsert, Message, MessageEvent, NewJob, Pagination, ServerEvent};

#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
    leads: Mutex<Vec<Lead>>,
    next_id: AtomicI64,
    pub fail_user_appends: AtomicBool,
    pub fail_bot_appends: AtomicBool,
    pub fail_lead_writes: AtomicBool,
    pub fail_lead_reads: AtomicBool,
    pub drop_upserts: AtomicBool,
}

impl MemoryStore {
    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.leads.lock().unwrap().clone()
    }

    pub fn lead(&self, session_id: &str) -> Option<Lead> {
        self.leads()
            .into_iter()
            .find(|lead| lead.session_id == session_id)
    }

    pub fn insert_lead(&self, lead: Lead) {
        self.leads.lock().unwrap().push(lead);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        session_id: &str,
        content: &str,
        event: MessageEvent,
    ) -> Result<Message, StoreError> {
        let failing = match event {
            MessageEvent::UserPrompt => &self.fail_user_appends,
            MessageEvent::BotResponse => &self.fail_bot_appends,
        };
        if failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("message store offline".to_string()));
        }
        let now = Utc::now();
        let message = Message {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            session_id: session_id.to_string(),
            content: content.to_string(),
            event,
            created_at: now,
            updated_at: now,
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn recent(&self, session_id: &str, limit: i64) -> Result<Vec<Message>, StoreError> {
        let all = self.messages(session_id);
        let skip = all.len().saturating_sub(limit.max(0) as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn history_newest_first(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut all = self.messages(session_id);
        all.reverse();
        Ok(all)
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn is_completed(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.lead(session_id).is_some_and(|lead| lead.chat_completed))
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<Lead>, StoreError> {
        if self.fail_lead_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lead store offline".to_string()));
        }
        Ok(self.lead(session_id))
    }

    async fn upsert(&self, upsert: &LeadUpsert) -> Result<Option<Lead>, StoreError> {
        if self.fail_lead_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lead store offline".to_string()));
        }
        if self.drop_upserts.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut leads = self.leads.lock().unwrap();
        if leads
            .iter()
            .any(|lead| lead.email == upsert.email && lead.session_id != upsert.session_id)
        {
            return Err(StoreError::Conflict {
                constraint: "leads_email_key".to_string(),
            });
        }

        let now = Utc::now();
        if let Some(lead) = leads
            .iter_mut()
            .find(|lead| lead.session_id == upsert.session_id)
        {
            lead.email = upsert.email.clone();
            lead.company_name = upsert.company_name.clone();
            lead.company_info = upsert.company_info.clone();
            lead.relevance_tag = upsert.relevance_tag;
            lead.step = Some(upsert.step);
            lead.chat_completed = lead.chat_completed || upsert.chat_completed;
            lead.updated_at = now;
            return Ok(Some(lead.clone()));
        }

        let lead = Lead {
            id: format!("lead-{}", leads.len() + 1),
            session_id: upsert.session_id.clone(),
            email: upsert.email.clone(),
            company_name: upsert.company_name.clone(),
            company_info: upsert.company_info.clone(),
            relevance_tag: upsert.relevance_tag,
            step: Some(upsert.step),
            chat_completed: upsert.chat_completed,
            created_at: now,
            updated_at: now,
        };
        leads.push(lead.clone());
        Ok(Some(lead))
    }

    async fn page(&self, page: i64, page_size: i64) -> Result<(Vec<Lead>, i64), StoreError> {
        let mut leads = self.leads();
        leads.reverse();
        let total = leads.len() as i64;
        let offset = usize::try_from(Pagination::offset(page, page_size)).unwrap_or(usize::MAX);
        let data = leads
            .into_iter()
            .skip(offset)
            .take(page_size.max(0) as usize)
            .collect();
        Ok((data, total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryJobStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

#[derive(Debug, Clone)]
struct MemoryJob {
    id: i64,
    job_type: String,
    payload: Value,
    priority: i32,
    available_at: Instant,
    status: MemoryJobStatus,
    attempts: i32,
    max_attempts: i32,
    locked_until: Option<Instant>,
    last_error: Option<String>,
}

impl MemoryJob {
    fn lease_expired(&self, now: Instant) -> bool {
        self.status == MemoryJobStatus::Processing
            && self.locked_until.is_some_and(|until| until <= now)
    }
}

pub struct MemoryQueue {
    jobs: Mutex<Vec<MemoryJob>>,
    policy: RetryPolicy,
    lease: Duration,
    unavailable: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(60_000),
        })
    }
}

impl MemoryQueue {
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            policy,
            lease: Duration::from_secs(30),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a raw row, bypassing the typed payload.
    pub fn push_raw(&self, job_type: &str, payload: Value) -> i64 {
        let mut jobs = self.jobs.lock().unwrap();
        let id = jobs.len() as i64 + 1;
        jobs.push(MemoryJob {
            id,
            job_type: job_type.to_string(),
            payload,
            priority: DEFAULT_PRIORITY,
            available_at: Instant::now(),
            status: MemoryJobStatus::Pending,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            locked_until: None,
            last_error: None,
        });
        id
    }

    pub fn status(&self, job_id: i64) -> Option<MemoryJobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id == job_id)
            .map(|job| job.status)
    }

    pub fn last_error(&self, job_id: i64) -> Option<String> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id == job_id)
            .and_then(|job| job.last_error.clone())
    }

    /// Let every outstanding lease run out, as if the worker holding it died.
    pub fn expire_leases(&self) {
        let now = Instant::now();
        for job in self.jobs.lock().unwrap().iter_mut() {
            if job.status == MemoryJobStatus::Processing {
                job.locked_until = Some(now);
            }
        }
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.payload.clone())
            .collect()
    }

    /// Make every pending job claimable now, skipping backoff delays.
    pub fn release_all(&self) {
        let now = Instant::now();
        for job in self.jobs.lock().unwrap().iter_mut() {
            job.available_at = now;
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: NewJob) -> Result<i64, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store(StoreError::Unavailable(
                "queue offline".to_string(),
            )));
        }
        let payload = serde_json::to_value(&job.data)?;
        let mut jobs = self.jobs.lock().unwrap();
        let id = jobs.len() as i64 + 1;
        jobs.push(MemoryJob {
            id,
            job_type: job.data.job_type().as_str().to_string(),
            payload,
            priority: job.priority.unwrap_or(DEFAULT_PRIORITY),
            available_at: Instant::now() + job.delay.unwrap_or_default(),
            status: MemoryJobStatus::Pending,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            locked_until: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<QueuedJob>, AppError> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut() {
            if job.lease_expired(now) && job.attempts >= job.max_attempts {
                job.status = MemoryJobStatus::Dead;
                job.locked_until = None;
                job.last_error = Some(LEASE_EXPIRED.to_string());
            }
        }
        let next = jobs
            .iter_mut()
            .filter(|job| {
                (job.status == MemoryJobStatus::Pending && job.available_at <= now)
                    || job.lease_expired(now)
            })
            .min_by_key(|job| (job.priority, job.id));
        let lease = self.lease;
        Ok(next.map(|job| {
            job.status = MemoryJobStatus::Processing;
            job.attempts += 1;
            job.locked_until = Some(now + lease);
            QueuedJob {
                id: job.id,
                job_type: job.job_type.clone(),
                payload: job.payload.clone(),
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            }
        }))
    }

    async fn complete(&self, job_id: i64) -> Result<(), AppError> {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|job| job.id == job_id) {
            job.status = MemoryJobStatus::Completed;
            job.locked_until = None;
        }
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<JobDisposition, AppError> {
        let disposition = self.policy.disposition(job.attempts, job.max_attempts);
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(stored) = jobs.iter_mut().find(|stored| stored.id == job.id) {
            stored.locked_until = None;
            stored.last_error = Some(reason.to_string());
            match disposition {
                JobDisposition::Retry { after } => {
                    stored.status = MemoryJobStatus::Pending;
                    stored.available_at = Instant::now() + after;
                }
                JobDisposition::DeadLetter => stored.status = MemoryJobStatus::Dead,
            }
        }
        Ok(disposition)
    }

    async fn bury(&self, job_id: i64, reason: &str) -> Result<(), AppError> {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|job| job.id == job_id) {
            job.status = MemoryJobStatus::Dead;
            job.locked_until = None;
            job.last_error = Some(reason.to_string());
        }
        Ok(())
    }
}

/// Replays canned replies in order and records every prompt it was given.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedModel {
    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(Ok(reply.to_string()));
    }

    pub fn push_failure(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<Vec<ChatTurn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(turns.to_vec());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(AppError::provider(message)),
            None => Err(AppError::provider("no scripted reply left")),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, ServerEvent)>>,
    pub offline: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, ServerEvent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.sent().into_iter().map(|(_, event)| event).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, socket_id: &str, event: ServerEvent) -> Result<(), AppError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Notify("notifier offline".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((socket_id.to_string(), event));
        Ok(())
    }
}
