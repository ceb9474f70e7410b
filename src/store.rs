//! Conversation log and lead persistence.
//!
//! Both stores are traits so the qualification pipeline can run against
//! Postgres in production and against in-memory doubles in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{Lead, LeadUpsert, Message, MessageEvent, Pagination};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one turn to the session log.
    async fn append(
        &self,
        session_id: &str,
        content: &str,
        event: MessageEvent,
    ) -> Result<Message, StoreError>;

    /// The most recent `limit` turns of a session, oldest first.
    async fn recent(&self, session_id: &str, limit: i64) -> Result<Vec<Message>, StoreError>;

    /// Every turn of a session, newest first.
    async fn history_newest_first(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn is_completed(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn find_by_session(&self, session_id: &str) -> Result<Option<Lead>, StoreError>;

    /// Create or update the lead of `upsert.session_id`.
    ///
    /// An email already owned by another session is a
    /// [`StoreError::Conflict`]. Completion is sticky: once set it is never
    /// cleared by a later upsert.
    async fn upsert(&self, upsert: &LeadUpsert) -> Result<Option<Lead>, StoreError>;

    /// One page of leads, newest first, plus the total lead count.
    async fn page(&self, page: i64, page_size: i64) -> Result<(Vec<Lead>, i64), StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "id, session_id, content, event, created_at, updated_at";
const LEAD_COLUMNS: &str = "id, session_id, email, company_name, company_info, relevance_tag, \
     step, chat_completed, created_at, updated_at";

fn decode_event(raw: &str) -> Result<MessageEvent, StoreError> {
    raw.parse()
        .map_err(|err: String| StoreError::Database(sqlx::Error::Decode(err.into())))
}

fn parse_message_row(row: &PgRow) -> Result<Message, StoreError> {
    let event: String = row.try_get("event")?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        content: row.try_get("content")?,
        event: decode_event(&event)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn parse_lead_row(row: &PgRow) -> Result<Lead, StoreError> {
    Ok(Lead {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        email: row.try_get("email")?,
        company_name: row.try_get("company_name")?,
        company_info: row.try_get("company_info")?,
        relevance_tag: row
            .try_get::<Option<String>, _>("relevance_tag")?
            .and_then(|tag| tag.parse().ok()),
        step: row
            .try_get::<Option<String>, _>("step")?
            .and_then(|step| step.parse().ok()),
        chat_completed: row.try_get("chat_completed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(
        &self,
        session_id: &str,
        content: &str,
        event: MessageEvent,
    ) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages (session_id, content, event) VALUES ($1, $2, $3) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(session_id)
        .bind(content)
        .bind(event.as_str())
        .fetch_one(&self.pool)
        .await?;
        parse_message_row(&row)
    }

    async fn recent(&self, session_id: &str, limit: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2 \
             ) recent ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn history_newest_first(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn is_completed(&self, session_id: &str) -> Result<bool, StoreError> {
        let completed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM leads WHERE session_id = $1 AND chat_completed)",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(completed)
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_lead_row).transpose()
    }

    async fn upsert(&self, upsert: &LeadUpsert) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO leads (
                id, session_id, email, company_name, company_info, relevance_tag, step, chat_completed
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (session_id) DO UPDATE SET
                email = EXCLUDED.email,
                company_name = EXCLUDED.company_name,
                company_info = EXCLUDED.company_info,
                relevance_tag = EXCLUDED.relevance_tag,
                step = EXCLUDED.step,
                chat_completed = leads.chat_completed OR EXCLUDED.chat_completed,
                updated_at = now()
            RETURNING {LEAD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&upsert.session_id)
        .bind(&upsert.email)
        .bind(&upsert.company_name)
        .bind(&upsert.company_info)
        .bind(upsert.relevance_tag.map(|tag| tag.as_str()))
        .bind(upsert.step.as_str())
        .bind(upsert.chat_completed)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_lead_row).transpose()
    }

    async fn page(&self, page: i64, page_size: i64) -> Result<(Vec<Lead>, i64), StoreError> {
        let offset = Pagination::offset(page, page_size);
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM leads")
            .fetch_one(&self.pool)
            .await?;
        let leads = rows.iter().map(parse_lead_row).collect::<Result<Vec<_>, _>>()?;
        Ok((leads, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_columns_are_decode_errors() {
        assert_eq!(decode_event("bot_response").unwrap(), MessageEvent::BotResponse);
        let err = decode_event("typing").unwrap_err();
        assert!(matches!(err, StoreError::Database(sqlx::Error::Decode(_))));
    }

    mod postgres {
        use chrono::{Duration, TimeZone};

        use super::*;
        use crate::types::StepId;

        fn upsert(session_id: &str, email: &str, step: StepId) -> LeadUpsert {
            LeadUpsert {
                session_id: session_id.to_string(),
                email: email.to_string(),
                company_name: "Acme".to_string(),
                company_info: String::new(),
                relevance_tag: None,
                step,
                chat_completed: step == StepId::Done,
            }
        }

        async fn backdate(pool: &PgPool, table: &str, column: &str, key: &str, minutes: i64) {
            let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes);
            sqlx::query(&format!("UPDATE {table} SET created_at = $1 WHERE {column} = $2"))
                .bind(at)
                .bind(key)
                .execute(pool)
                .await
                .unwrap();
        }

        #[sqlx::test(migrations = "./migrations")]
        #[ignore = "requires a Postgres DATABASE_URL"]
        async fn messages_are_ordered_by_creation_time(pool: PgPool) {
            let store = PgStore::new(pool.clone());
            for (content, minute) in [("late", 30), ("early", 10), ("middle", 20)] {
                store
                    .append("s1", content, MessageEvent::UserPrompt)
                    .await
                    .unwrap();
                backdate(&pool, "messages", "content", content, minute).await;
            }
            store
                .append("other", "elsewhere", MessageEvent::BotResponse)
                .await
                .unwrap();

            let contents = |messages: Vec<Message>| -> Vec<String> {
                messages.into_iter().map(|message| message.content).collect()
            };
            assert_eq!(
                contents(store.recent("s1", 10).await.unwrap()),
                vec!["early", "middle", "late"]
            );
            assert_eq!(
                contents(store.recent("s1", 2).await.unwrap()),
                vec!["middle", "late"]
            );
            assert_eq!(
                contents(store.history_newest_first("s1").await.unwrap()),
                vec!["late", "middle", "early"]
            );
        }

        #[sqlx::test(migrations = "./migrations")]
        #[ignore = "requires a Postgres DATABASE_URL"]
        async fn upsert_updates_one_lead_and_keeps_completion(pool: PgPool) {
            let store = PgStore::new(pool);
            let created = store
                .upsert(&upsert("s1", "a@acme.com", StepId::CompanyName))
                .await
                .unwrap()
                .unwrap();
            assert!(!store.is_completed("s1").await.unwrap());

            store
                .upsert(&upsert("s1", "a@acme.com", StepId::Done))
                .await
                .unwrap();
            assert!(store.is_completed("s1").await.unwrap());

            let reopened = store
                .upsert(&upsert("s1", "a@acme.com", StepId::CompanyInfo))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reopened.id, created.id);
            assert_eq!(reopened.step, Some(StepId::CompanyInfo));
            assert!(reopened.chat_completed);

            let found = store.find_by_session("s1").await.unwrap().unwrap();
            assert_eq!(found.id, created.id);
            assert!(store.find_by_session("missing").await.unwrap().is_none());
        }

        #[sqlx::test(migrations = "./migrations")]
        #[ignore = "requires a Postgres DATABASE_URL"]
        async fn email_owned_by_another_session_conflicts(pool: PgPool) {
            let store = PgStore::new(pool);
            store
                .upsert(&upsert("s1", "a@acme.com", StepId::CompanyName))
                .await
                .unwrap();

            let err = store
                .upsert(&upsert("s2", "a@acme.com", StepId::CompanyName))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                StoreError::Conflict { ref constraint } if constraint == "leads_email_key"
            ));
            assert!(store.find_by_session("s2").await.unwrap().is_none());
        }

        #[sqlx::test(migrations = "./migrations")]
        #[ignore = "requires a Postgres DATABASE_URL"]
        async fn leads_are_paged_newest_first(pool: PgPool) {
            let store = PgStore::new(pool.clone());
            for n in 1..=3 {
                let session_id = format!("s{n}");
                store
                    .upsert(&upsert(&session_id, &format!("lead{n}@acme.com"), StepId::Email))
                    .await
                    .unwrap();
                backdate(&pool, "leads", "session_id", &session_id, n).await;
            }

            let (first, total) = store.page(1, 2).await.unwrap();
            assert_eq!(total, 3);
            let sessions: Vec<&str> = first.iter().map(|lead| lead.session_id.as_str()).collect();
            assert_eq!(sessions, vec!["s3", "s2"]);

            let (second, _) = store.page(2, 2).await.unwrap();
            assert_eq!(second.len(), 1);
            assert_eq!(second[0].session_id, "s1");

            let (beyond, total) = store.page(i64::MAX, 2).await.unwrap();
            assert!(beyond.is_empty());
            assert_eq!(total, 3);
        }
    }
}
