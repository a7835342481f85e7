use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::pagination::{clamp_limit, parse_offset};
use crate::store::{from_millis, now, to_millis, Store, StoreError};

use super::models::{
    CreateEventCallbackRequest, EventCallback, EventCallbackPage, EventCallbackQuery,
    EventCallbackResult, EventCallbackResultPage, EventCallbackResultQuery, EventCallbackStatus,
    UpdateEventCallbackRequest,
};

const CALLBACK_COLUMNS: &str =
    "SELECT id, conversation_id, processor_json, event_kind, status, created_at, updated_at FROM event_callbacks";
const RESULT_COLUMNS: &str =
    "SELECT id, event_callback_id, event_id, conversation_id, status, detail, created_at FROM event_callback_results";

fn parse_uuid(column: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|err| StoreError::decode(column, err))
}

fn callback_from_row(row: &SqliteRow) -> Result<EventCallback, StoreError> {
    let id: String = row.try_get("id")?;
    let conversation_id: Option<String> = row.try_get("conversation_id")?;
    let processor_json: String = row.try_get("processor_json")?;
    let status: String = row.try_get("status")?;
    Ok(EventCallback {
        id: parse_uuid("id", &id)?,
        conversation_id: conversation_id
            .as_deref()
            .map(|raw| parse_uuid("conversation_id", raw))
            .transpose()?,
        processor: serde_json::from_str(&processor_json)
            .map_err(|err| StoreError::decode("processor_json", err))?,
        event_kind: row.try_get("event_kind")?,
        status: status
            .parse()
            .map_err(|err: String| StoreError::decode("status", err))?,
        created_at: from_millis("created_at", row.try_get("created_at")?)?,
        updated_at: from_millis("updated_at", row.try_get("updated_at")?)?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<EventCallbackResult, StoreError> {
    let id: String = row.try_get("id")?;
    let event_callback_id: String = row.try_get("event_callback_id")?;
    let event_id: String = row.try_get("event_id")?;
    let conversation_id: String = row.try_get("conversation_id")?;
    let status: String = row.try_get("status")?;
    Ok(EventCallbackResult {
        id: parse_uuid("id", &id)?,
        event_callback_id: parse_uuid("event_callback_id", &event_callback_id)?,
        event_id: parse_uuid("event_id", &event_id)?,
        conversation_id: parse_uuid("conversation_id", &conversation_id)?,
        status: status
            .parse()
            .map_err(|err: String| StoreError::decode("status", err))?,
        detail: row.try_get("detail")?,
        created_at: from_millis("created_at", row.try_get("created_at")?)?,
    })
}

/// Appends `LIMIT`/`OFFSET` fetching one extra row, so the caller can tell
/// whether another page exists.
fn push_page(builder: &mut QueryBuilder<'_, Sqlite>, offset: usize, limit: usize) {
    builder
        .push(" LIMIT ")
        .push_bind(limit as i64 + 1)
        .push(" OFFSET ")
        .push_bind(offset as i64);
}

fn split_page<T>(mut rows: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, Option<String>) {
    let next_page_id = if rows.len() > limit {
        rows.truncate(limit);
        Some((offset + limit).to_string())
    } else {
        None
    };
    (rows, next_page_id)
}

/// Event callbacks and their results.
#[derive(Debug, Clone)]
pub struct CallbackStore {
    store: Store,
}

impl CallbackStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_event_callback(
        &self,
        request: CreateEventCallbackRequest,
    ) -> Result<EventCallback, StoreError> {
        let created_at = now();
        let callback = EventCallback {
            id: Uuid::new_v4(),
            conversation_id: request.conversation_id,
            processor: request.processor,
            event_kind: request.event_kind,
            status: EventCallbackStatus::Active,
            created_at,
            updated_at: created_at,
        };
        let processor_json = serde_json::to_string(&callback.processor)
            .map_err(|err| StoreError::decode("processor_json", err))?;
        sqlx::query(
            r#"INSERT INTO event_callbacks (
                id, conversation_id, processor_json, event_kind, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(callback.id.to_string())
        .bind(callback.conversation_id.map(|id| id.to_string()))
        .bind(processor_json)
        .bind(&callback.event_kind)
        .bind(callback.status.as_str())
        .bind(to_millis(callback.created_at))
        .bind(to_millis(callback.updated_at))
        .execute(self.store.pool())
        .await?;
        Ok(callback)
    }

    pub async fn get_event_callback(&self, id: Uuid) -> Result<Option<EventCallback>, StoreError> {
        let row = sqlx::query(&format!("{CALLBACK_COLUMNS} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(callback_from_row).transpose()
    }

    pub async fn batch_get_event_callbacks(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<Option<EventCallback>>, StoreError> {
        let mut callbacks = Vec::with_capacity(ids.len());
        for id in ids {
            callbacks.push(self.get_event_callback(*id).await?);
        }
        Ok(callbacks)
    }

    /// Applies the fields present in `request`. `None` when the callback does
    /// not exist.
    pub async fn update_event_callback(
        &self,
        id: Uuid,
        request: UpdateEventCallbackRequest,
    ) -> Result<Option<EventCallback>, StoreError> {
        let Some(mut callback) = self.get_event_callback(id).await? else {
            return Ok(None);
        };
        if let Some(processor) = request.processor {
            callback.processor = processor;
        }
        if let Some(event_kind) = request.event_kind {
            callback.event_kind = Some(event_kind).filter(|kind| !kind.is_empty());
        }
        if let Some(status) = request.status {
            callback.status = status;
        }
        callback.updated_at = now();

        let processor_json = serde_json::to_string(&callback.processor)
            .map_err(|err| StoreError::decode("processor_json", err))?;
        sqlx::query(
            r#"UPDATE event_callbacks
               SET processor_json = ?2, event_kind = ?3, status = ?4, updated_at = ?5
               WHERE id = ?1"#,
        )
        .bind(id.to_string())
        .bind(processor_json)
        .bind(&callback.event_kind)
        .bind(callback.status.as_str())
        .bind(to_millis(callback.updated_at))
        .execute(self.store.pool())
        .await?;
        Ok(Some(callback))
    }

    pub async fn delete_event_callback(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM event_callbacks WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Oldest first, offset cursor.
    pub async fn search_event_callbacks(
        &self,
        query: &EventCallbackQuery,
    ) -> Result<EventCallbackPage, StoreError> {
        let offset = parse_offset(query.page_id.as_deref());
        let limit = clamp_limit(query.limit);

        let mut builder = QueryBuilder::<Sqlite>::new(CALLBACK_COLUMNS);
        builder.push(" WHERE 1 = 1");
        if let Some(conversation_id) = query.conversation_id {
            builder
                .push(" AND conversation_id = ")
                .push_bind(conversation_id.to_string());
        }
        if let Some(event_kind) = &query.event_kind {
            builder.push(" AND event_kind = ").push_bind(event_kind.clone());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at ASC, rowid ASC");
        push_page(&mut builder, offset, limit);

        let rows = builder.build().fetch_all(self.store.pool()).await?;
        let callbacks = rows
            .iter()
            .map(callback_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let (items, next_page_id) = split_page(callbacks, offset, limit);
        Ok(EventCallbackPage {
            items,
            next_page_id,
        })
    }

    /// Active callbacks that apply to an event of `kind` in `conversation_id`.
    pub async fn matching_callbacks(
        &self,
        conversation_id: Uuid,
        kind: &str,
    ) -> Result<Vec<EventCallback>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"{CALLBACK_COLUMNS}
               WHERE status = ?1
                 AND (conversation_id IS NULL OR conversation_id = ?2)
                 AND (event_kind IS NULL OR event_kind = ?3)
               ORDER BY created_at ASC, rowid ASC"#
        ))
        .bind(EventCallbackStatus::Active.as_str())
        .bind(conversation_id.to_string())
        .bind(kind)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(callback_from_row).collect()
    }

    pub async fn insert_result(&self, result: &EventCallbackResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO event_callback_results (
                id, event_callback_id, event_id, conversation_id, status, detail, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(result.id.to_string())
        .bind(result.event_callback_id.to_string())
        .bind(result.event_id.to_string())
        .bind(result.conversation_id.to_string())
        .bind(result.status.as_str())
        .bind(&result.detail)
        .bind(to_millis(result.created_at))
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get_event_callback_result(
        &self,
        id: Uuid,
    ) -> Result<Option<EventCallbackResult>, StoreError> {
        let row = sqlx::query(&format!("{RESULT_COLUMNS} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    pub async fn batch_get_event_callback_results(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<Option<EventCallbackResult>>, StoreError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.get_event_callback_result(*id).await?);
        }
        Ok(results)
    }

    pub async fn search_event_callback_results(
        &self,
        query: &EventCallbackResultQuery,
    ) -> Result<EventCallbackResultPage, StoreError> {
        let offset = parse_offset(query.page_id.as_deref());
        let limit = clamp_limit(query.limit);

        let mut builder = QueryBuilder::<Sqlite>::new(RESULT_COLUMNS);
        builder.push(" WHERE 1 = 1");
        if let Some(event_callback_id) = query.event_callback_id {
            builder
                .push(" AND event_callback_id = ")
                .push_bind(event_callback_id.to_string());
        }
        if let Some(event_id) = query.event_id {
            builder.push(" AND event_id = ").push_bind(event_id.to_string());
        }
        if let Some(conversation_id) = query.conversation_id {
            builder
                .push(" AND conversation_id = ")
                .push_bind(conversation_id.to_string());
        }
        builder.push(query.sort_order.order_by());
        push_page(&mut builder, offset, limit);

        let rows = builder.build().fetch_all(self.store.pool()).await?;
        let results = rows
            .iter()
            .map(result_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let (items, next_page_id) = split_page(results, offset, limit);
        Ok(EventCallbackResultPage {
            items,
            next_page_id,
        })
    }

    pub async fn delete_event_callback_result(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM event_callback_results WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
