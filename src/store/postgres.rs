use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Postgres, QueryBuilder, Row,
};
use tracing::info;

use super::SessionStore;
use crate::error::StoreError;
use crate::types::{
    Contact, ContactPatch, DashboardStats, LeadFields, MessageRole, OriginCount, Stage,
    StoredMessage,
};

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("postgres store ready, migrations applied");
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }
}

fn contact_from_row(row: &PgRow) -> Result<Contact, StoreError> {
    let id: String = row.get("id");
    let stage_raw: String = row.get("stage");
    let stage = Stage::parse(&stage_raw).ok_or_else(|| StoreError::Corrupt {
        contact_id: id.clone(),
        detail: format!("unknown stage {stage_raw}"),
    })?;
    let Json(data_cache) = row
        .try_get::<Json<LeadFields>, _>("data_cache")
        .map_err(|err| StoreError::Corrupt {
            contact_id: id.clone(),
            detail: format!("data_cache: {err}"),
        })?;

    Ok(Contact {
        id,
        name: row.get("name"),
        email: row.get("email"),
        tax_id: row.get("tax_id"),
        origin: row.get("origin"),
        source: row.get("source"),
        campaign: row.get("campaign"),
        product: row.get("product"),
        quantity: row.get("quantity"),
        deadline: row.get("deadline"),
        stage,
        data_cache,
        session_id: row.get("session_id"),
        tax_id_attempts: row.get("tax_id_attempts"),
        lockout_until: row.get("lockout_until"),
        last_interaction_at: row.get("last_interaction_at"),
        score: row.get("score"),
        temperature: row.get("temperature"),
        moderation_flagged: row.get("moderation_flagged"),
        total_messages: row.get("total_messages"),
        audio_received: row.get("audio_received"),
        catalog_sent: row.get("catalog_sent"),
        legal_name: row.get("legal_name"),
        trade_name: row.get("trade_name"),
        activity_code: row.get("activity_code"),
        activity_description: row.get("activity_description"),
        company_size: row.get("company_size"),
        city: row.get("city"),
        state: row.get("state"),
        icp_qualified: row.get("icp_qualified"),
        disqualification_reason: row.get("disqualification_reason"),
        crm_deal_id: row.get("crm_deal_id"),
        crm_synced_at: row.get("crm_synced_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &PgRow) -> Result<StoredMessage, StoreError> {
    let contact_id: String = row.get("contact_id");
    let role_raw: String = row.get("role");
    let role = MessageRole::parse(&role_raw).ok_or_else(|| StoreError::Corrupt {
        contact_id: contact_id.clone(),
        detail: format!("unknown message role {role_raw}"),
    })?;
    Ok(StoredMessage {
        contact_id,
        session_id: row.get("session_id"),
        role,
        content: row.get("content"),
        created_at: row.get("created_at"),
    })
}

fn push_set<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, value: T)
where
    T: 'a + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres> + Send,
{
    qb.push(", ").push(column).push(" = ").push_bind(value);
}

#[async_trait]
impl SessionStore for PgStore {
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query("SELECT * FROM contacts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn create_contact(&self, id: &str, initial: LeadFields) -> Result<Contact, StoreError> {
        sqlx::query(
            "INSERT INTO contacts (id, stage, data_cache) VALUES ($1, 'new', $2) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(Json(initial))
        .execute(&self.db)
        .await?;

        self.get_contact(id)
            .await?
            .ok_or_else(|| StoreError::ContactNotFound(id.to_string()))
    }

    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE contacts SET updated_at = NOW()");

        if let Some(v) = patch.name {
            push_set(&mut qb, "name", v);
        }
        if let Some(v) = patch.email {
            push_set(&mut qb, "email", v);
        }
        if let Some(v) = patch.tax_id {
            push_set(&mut qb, "tax_id", v);
        }
        if let Some(v) = patch.origin {
            push_set(&mut qb, "origin", v);
        }
        if let Some(v) = patch.source {
            push_set(&mut qb, "source", v);
        }
        if let Some(v) = patch.campaign {
            push_set(&mut qb, "campaign", v);
        }
        if let Some(v) = patch.product {
            push_set(&mut qb, "product", v);
        }
        if let Some(v) = patch.quantity {
            push_set(&mut qb, "quantity", v);
        }
        if let Some(v) = patch.deadline {
            push_set(&mut qb, "deadline", v);
        }
        if let Some(v) = patch.stage {
            push_set(&mut qb, "stage", v.as_str());
        }
        if let Some(v) = patch.data_cache {
            push_set(&mut qb, "data_cache", Json(v));
        }
        if let Some(v) = patch.session_id {
            push_set(&mut qb, "session_id", v);
        }
        if let Some(v) = patch.tax_id_attempts {
            push_set(&mut qb, "tax_id_attempts", v);
        }
        if let Some(v) = patch.lockout_until {
            push_set(&mut qb, "lockout_until", v);
        }
        if let Some(v) = patch.last_interaction_at {
            push_set(&mut qb, "last_interaction_at", v);
        }
        if let Some(v) = patch.score {
            push_set(&mut qb, "score", v);
        }
        if let Some(v) = patch.temperature {
            push_set(&mut qb, "temperature", v);
        }
        if let Some(v) = patch.moderation_flagged {
            push_set(&mut qb, "moderation_flagged", v);
        }
        if let Some(v) = patch.audio_received {
            push_set(&mut qb, "audio_received", v);
        }
        if let Some(v) = patch.catalog_sent {
            push_set(&mut qb, "catalog_sent", v);
        }
        if let Some(company) = patch.company {
            push_set(&mut qb, "legal_name", company.legal_name);
            push_set(&mut qb, "trade_name", company.trade_name);
            push_set(&mut qb, "activity_code", company.activity_code);
            push_set(&mut qb, "activity_description", company.activity_description);
            push_set(&mut qb, "company_size", company.company_size);
            push_set(&mut qb, "city", company.city);
            push_set(&mut qb, "state", company.state);
        }
        if let Some(v) = patch.icp_qualified {
            push_set(&mut qb, "icp_qualified", v);
        }
        if let Some(v) = patch.disqualification_reason {
            push_set(&mut qb, "disqualification_reason", v);
        }
        if let Some(v) = patch.crm_deal_id {
            push_set(&mut qb, "crm_deal_id", v);
        }
        if let Some(v) = patch.crm_synced_at {
            push_set(&mut qb, "crm_synced_at", v);
        }

        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(" RETURNING *");

        let row = qb.build().fetch_optional(&self.db).await?;
        match row {
            Some(row) => contact_from_row(&row),
            None => Err(StoreError::ContactNotFound(id.to_string())),
        }
    }

    async fn delete_contact(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM contacts WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_message(
        &self,
        contact_id: &str,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let row = sqlx::query(
            "INSERT INTO messages (contact_id, session_id, role, content) VALUES ($1, $2, $3, $4) \
             RETURNING contact_id, session_id, role, content, created_at",
        )
        .bind(contact_id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .fetch_one(&self.db)
        .await?;

        if role == MessageRole::User {
            sqlx::query("UPDATE contacts SET total_messages = total_messages + 1 WHERE id = $1")
                .bind(contact_id)
                .execute(&self.db)
                .await?;
        }
        message_from_row(&row)
    }

    async fn get_history(
        &self,
        contact_id: &str,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM ( \
                SELECT id, contact_id, session_id, role, content, created_at FROM messages \
                WHERE contact_id = $1 AND session_id = $2 \
                ORDER BY created_at DESC, id DESC LIMIT $3 \
             ) recent ORDER BY created_at ASC, id ASC",
        )
        .bind(contact_id)
        .bind(session_id)
        .bind(limit.max(0))
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE stage = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE icp_qualified = TRUE) AS qualified, \
                    COUNT(*) FILTER (WHERE icp_qualified = FALSE OR stage = 'disqualified') AS disqualified \
             FROM contacts",
        )
        .fetch_one(&self.db)
        .await?;

        let origin_rows = sqlx::query(
            "SELECT COALESCE(NULLIF(TRIM(origin), ''), 'Desconhecido') AS name, COUNT(*) AS count \
             FROM contacts GROUP BY 1 ORDER BY count DESC, name ASC",
        )
        .fetch_all(&self.db)
        .await?;
        let by_origin = origin_rows
            .iter()
            .map(|row| OriginCount {
                name: row.get("name"),
                count: row.get("count"),
            })
            .collect();

        Ok(DashboardStats::from_counts(
            totals.get("total"),
            totals.get("completed"),
            totals.get("qualified"),
            totals.get("disqualified"),
            by_origin,
        ))
    }
}
