//! PgReactionRepository: one transaction per batch.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use notereact_common::{
    parse_id, BulkApplyOutcome, NoteCounts, NotesMap, ReactionError, ReactionKind, Result,
};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::plan::{BatchPlan, ReactionKey, ValidatedBatch};
use crate::repository::ReactionRepository;

#[derive(Clone)]
pub struct PgReactionRepository {
    pool: PgPool,
}

impl PgReactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ReactionError::Database(e.into()))?;
        Ok(())
    }
}

fn parse_stored_kind(raw: &str) -> Result<ReactionKind> {
    raw.parse()
        .map_err(|e| ReactionError::Other(anyhow::anyhow!("stored reaction: {e}")))
}

/// Read stored counters, skipping keys that are not a known kind or whose
/// value is not an integer. A bad key must not fail every batch that
/// touches the note.
fn decode_counts(note_id: Uuid, value: Value) -> NoteCounts {
    let Value::Object(map) = value else {
        warn!(%note_id, "Stored reaction counts are not an object");
        return NoteCounts::new();
    };
    let mut counts = NoteCounts::new();
    for (name, count) in map {
        match (name.parse::<ReactionKind>(), count.as_i64()) {
            (Ok(kind), Some(count)) => counts.add(kind, count),
            _ => warn!(%note_id, key = %name, value = %count, "Ignoring stored counter"),
        }
    }
    counts
}

#[async_trait]
impl ReactionRepository for PgReactionRepository {
    async fn bulk_apply(&self, notes: &NotesMap) -> Result<BulkApplyOutcome> {
        let batch = ValidatedBatch::parse(notes)?;
        if batch.is_empty() {
            return Ok(BulkApplyOutcome::default());
        }

        let (note_col, user_col): (Vec<Uuid>, Vec<Uuid>) = batch
            .keys()
            .into_iter()
            .map(|k| (k.note_id, k.user_id))
            .unzip();

        let mut tx = self.pool.begin().await?;

        // 1. Current state for exactly the pairs in the batch, locked.
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            r#"
            SELECT r.note_id, r.user_id, r.kind
            FROM note_reactions r
            JOIN UNNEST($1::uuid[], $2::uuid[]) AS p(note_id, user_id)
              ON r.note_id = p.note_id AND r.user_id = p.user_id
            ORDER BY r.note_id, r.user_id
            FOR UPDATE OF r
            "#,
        )
        .bind(&note_col)
        .bind(&user_col)
        .fetch_all(&mut *tx)
        .await?;

        let mut existing = HashMap::with_capacity(rows.len());
        for (note_id, user_id, kind) in rows {
            existing.insert(ReactionKey { note_id, user_id }, parse_stored_kind(&kind)?);
        }

        // 2. Diff.
        let plan = BatchPlan::build(&batch, &existing);

        // 3. Row writes.
        if !plan.upserts.is_empty() {
            let mut notes_col = Vec::with_capacity(plan.upserts.len());
            let mut users_col = Vec::with_capacity(plan.upserts.len());
            let mut kinds_col = Vec::with_capacity(plan.upserts.len());
            for (key, kind) in &plan.upserts {
                notes_col.push(key.note_id);
                users_col.push(key.user_id);
                kinds_col.push(kind.as_str().to_string());
            }

            sqlx::query(
                r#"
                INSERT INTO note_reactions (note_id, user_id, kind)
                SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[])
                ON CONFLICT (note_id, user_id)
                DO UPDATE SET kind = EXCLUDED.kind, updated_at = now()
                "#,
            )
            .bind(&notes_col)
            .bind(&users_col)
            .bind(&kinds_col)
            .execute(&mut *tx)
            .await?;
        }

        if !plan.deletes.is_empty() {
            let (notes_col, users_col): (Vec<Uuid>, Vec<Uuid>) =
                plan.deletes.iter().map(|k| (k.note_id, k.user_id)).unzip();

            sqlx::query(
                r#"
                DELETE FROM note_reactions r
                USING UNNEST($1::uuid[], $2::uuid[]) AS d(note_id, user_id)
                WHERE r.note_id = d.note_id AND r.user_id = d.user_id
                "#,
            )
            .bind(&notes_col)
            .bind(&users_col)
            .execute(&mut *tx)
            .await?;
        }

        // 4. Signed increments on the note counters.
        let mut delta_notes = Vec::new();
        let mut delta_values = Vec::new();
        for (note_id, delta) in plan.nonzero_deltas() {
            delta_notes.push(*note_id);
            delta_values.push(serde_json::to_value(delta)?);
        }

        if !delta_notes.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO notes (id, reaction_counts)
                SELECT id, delta FROM UNNEST($1::uuid[], $2::jsonb[]) AS d(id, delta)
                ON CONFLICT (id)
                DO UPDATE SET reaction_counts = jsonb_add_counts(notes.reaction_counts, EXCLUDED.reaction_counts)
                "#,
            )
            .bind(&delta_notes)
            .bind(&delta_values)
            .execute(&mut *tx)
            .await?;
        }

        // 5. Post-increment totals, read inside the same transaction.
        let totals_rows = sqlx::query_as::<_, (Uuid, Json<Value>)>(
            "SELECT id, reaction_counts FROM notes WHERE id = ANY($1)",
        )
        .bind(batch.note_ids())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let totals: HashMap<Uuid, NoteCounts> = totals_rows
            .into_iter()
            .map(|(id, Json(counts))| (id, decode_counts(id, counts)))
            .collect();

        let mut outcome = BulkApplyOutcome {
            note_deltas: BTreeMap::new(),
            note_totals: BTreeMap::new(),
        };
        for (note_id, delta) in plan.deltas {
            let Some(raw) = batch.raw_note_id(&note_id) else {
                continue;
            };
            // Notes that never held counters get no totals, matching note_counts.
            if let Some(total) = totals.get(&note_id).filter(|t| !t.is_empty()) {
                outcome.note_totals.insert(raw.to_string(), total.clone());
            }
            outcome.note_deltas.insert(raw.to_string(), delta);
        }

        debug!(
            notes = outcome.note_totals.len(),
            upserts = plan.upserts.len(),
            deletes = plan.deletes.len(),
            "Applied reaction batch"
        );
        Ok(outcome)
    }

    async fn note_counts(&self, note_id: &str) -> Result<Option<NoteCounts>> {
        let id = parse_id("noteId", note_id)?;
        let row = sqlx::query_as::<_, (Json<Value>,)>(
            "SELECT reaction_counts FROM notes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(Json(counts),)| decode_counts(id, counts))
            .filter(|counts| !counts.is_empty()))
    }

    async fn user_reaction(&self, note_id: &str, user_id: &str) -> Result<Option<ReactionKind>> {
        let note = parse_id("noteId", note_id)?;
        let user = parse_id("userId", user_id)?;
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT kind FROM note_reactions WHERE note_id = $1 AND user_id = $2",
        )
        .bind(note)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(kind,)| parse_stored_kind(&kind)).transpose()
    }
}
