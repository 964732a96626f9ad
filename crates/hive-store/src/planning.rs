use crate::codec::{get_json, get_opt_ts, get_parsed, get_ts, get_uuid, now, ts};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use hive_core::{HiveError, HiveResult, NewPlanningRequest, PlanningRequest, PlanningStatus};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PLANNING_COLUMNS: &str = "id, description, priority, requestor, context, status, \
     assigned_agent, failure_reason, created_at, assigned_at, completed_at";

/// How many pending requests one claim attempt considers.
const CLAIM_CANDIDATES: i64 = 16;

fn planning_from_row(row: &Row<'_>) -> rusqlite::Result<PlanningRequest> {
    Ok(PlanningRequest {
        id: get_uuid(row, 0)?,
        description: row.get(1)?,
        priority: row.get(2)?,
        requestor: row.get(3)?,
        context: get_json(row, 4)?,
        status: get_parsed(row, 5)?,
        assigned_agent: row.get(6)?,
        failure_reason: row.get(7)?,
        created_at: get_ts(row, 8)?,
        assigned_at: get_opt_ts(row, 9)?,
        completed_at: get_opt_ts(row, 10)?,
    })
}

pub(crate) fn load_planning_request(
    conn: &Connection,
    id: Uuid,
) -> HiveResult<Option<PlanningRequest>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PLANNING_COLUMNS} FROM planning_queue WHERE id = ?1"
    ))?;
    Ok(stmt
        .query_row(params![id.to_string()], planning_from_row)
        .optional()?)
}

pub(crate) fn require_planning_request(conn: &Connection, id: Uuid) -> HiveResult<PlanningRequest> {
    load_planning_request(conn, id)?
        .ok_or_else(|| HiveError::NotFound(format!("planning request {id}")))
}

/// Error unless `request` is currently held by `agent`.
pub(crate) fn ensure_held_by(request: &PlanningRequest, agent: &str) -> HiveResult<()> {
    if request.status != PlanningStatus::Assigned
        || request.assigned_agent.as_deref() != Some(agent)
    {
        return Err(HiveError::InvalidTransition(format!(
            "planning request {} is {} (agent {:?}), not assigned to '{agent}'",
            request.id, request.status, request.assigned_agent
        )));
    }
    Ok(())
}

fn claim_next_planning_tx(conn: &mut Connection, agent: &str) -> HiveResult<Option<PlanningRequest>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidates: Vec<String> = {
        let mut stmt = tx.prepare_cached(
            "SELECT id FROM planning_queue WHERE status = 'pending' \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![CLAIM_CANDIDATES], |row| row.get::<_, String>(0))?;
        let ids = rows.collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };

    let now = ts(now());
    for id in candidates {
        let changed = tx.execute(
            "UPDATE planning_queue SET status = 'assigned', assigned_agent = ?1, assigned_at = ?2 \
             WHERE id = ?3 AND status = 'pending'",
            params![agent, now, id],
        )?;
        if changed == 0 {
            debug!(request_id = %id, "Planning request claimed concurrently");
            continue;
        }
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {PLANNING_COLUMNS} FROM planning_queue WHERE id = ?1"
        ))?;
        let request = stmt.query_row(params![id], planning_from_row)?;
        drop(stmt);
        tx.commit()?;
        info!(request_id = %request.id, agent, "Planning request assigned");
        return Ok(Some(request));
    }

    tx.commit()?;
    Ok(None)
}

fn fail_planning_tx(
    conn: &mut Connection,
    id: Uuid,
    agent: &str,
    reason: &str,
) -> HiveResult<PlanningRequest> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let request = require_planning_request(&tx, id)?;
    ensure_held_by(&request, agent)?;
    tx.execute(
        "UPDATE planning_queue SET status = 'failed', failure_reason = ?1, completed_at = ?2 \
         WHERE id = ?3 AND status = 'assigned'",
        params![reason, ts(now()), id.to_string()],
    )?;
    let failed = require_planning_request(&tx, id)?;
    tx.commit()?;
    Ok(failed)
}

fn reclaim_expired_tx(conn: &mut Connection, cutoff: DateTime<Utc>) -> HiveResult<Vec<Uuid>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let expired = {
        let mut stmt = tx.prepare_cached(
            "SELECT id FROM planning_queue WHERE status = 'assigned' AND assigned_at < ?1 \
             ORDER BY assigned_at ASC",
        )?;
        let rows = stmt.query_map(params![ts(cutoff)], |row| get_uuid(row, 0))?;
        rows.collect::<rusqlite::Result<Vec<Uuid>>>()?
    };
    let mut reclaimed = Vec::with_capacity(expired.len());
    for id in expired {
        let changed = tx.execute(
            "UPDATE planning_queue SET status = 'pending', assigned_agent = NULL, assigned_at = NULL \
             WHERE id = ?1 AND status = 'assigned' AND assigned_at < ?2",
            params![id.to_string(), ts(cutoff)],
        )?;
        if changed == 1 {
            reclaimed.push(id);
        }
    }
    tx.commit()?;
    Ok(reclaimed)
}

impl TaskStore {
    /// Queue a planning request in `pending`.
    pub async fn submit_planning_request(
        &self,
        new: NewPlanningRequest,
    ) -> HiveResult<PlanningRequest> {
        let request = PlanningRequest {
            id: Uuid::new_v4(),
            description: new.description,
            priority: new.priority,
            requestor: new.requestor,
            context: new.context,
            status: PlanningStatus::Pending,
            assigned_agent: None,
            failure_reason: None,
            created_at: now(),
            assigned_at: None,
            completed_at: None,
        };
        let request = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO planning_queue (id, description, priority, requestor, context, status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        request.id.to_string(),
                        request.description,
                        request.priority,
                        request.requestor,
                        serde_json::to_string(&request.context)?,
                        request.status.as_str(),
                        ts(request.created_at),
                    ],
                )?;
                Ok(request)
            })
            .await?;
        info!(
            request_id = %request.id,
            priority = request.priority,
            requestor = %request.requestor,
            "Planning request submitted"
        );
        Ok(request)
    }

    /// Look up a planning request by id.
    pub async fn get_planning_request(&self, id: Uuid) -> HiveResult<Option<PlanningRequest>> {
        self.with_conn(move |conn| load_planning_request(conn, id))
            .await
    }

    /// Requests in claim order, optionally restricted to one status.
    pub async fn list_planning_requests(
        &self,
        status: Option<PlanningStatus>,
        limit: usize,
    ) -> HiveResult<Vec<PlanningRequest>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PLANNING_COLUMNS} FROM planning_queue WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?2"
            ))?;
            let rows =
                stmt.query_map(params![status.map(|s| s.as_str()), limit], planning_from_row)?;
            let mut requests = Vec::new();
            for row in rows {
                requests.push(row?);
            }
            Ok(requests)
        })
        .await
    }

    /// Claim the highest-priority, oldest pending request for `agent`.
    pub async fn claim_next_planning_request(
        &self,
        agent: &str,
    ) -> HiveResult<Option<PlanningRequest>> {
        let agent = agent.to_string();
        self.with_conn(move |conn| claim_next_planning_tx(conn, &agent))
            .await
    }

    /// Give up on a request the agent holds.
    pub async fn fail_planning_request(
        &self,
        id: Uuid,
        agent: &str,
        reason: &str,
    ) -> HiveResult<PlanningRequest> {
        let (owned_agent, owned_reason) = (agent.to_string(), reason.to_string());
        let request = self
            .with_conn(move |conn| fail_planning_tx(conn, id, &owned_agent, &owned_reason))
            .await?;
        warn!(request_id = %id, agent, reason, "Planning request failed");
        Ok(request)
    }

    /// Return requests assigned before `cutoff` to `pending`, so a planner
    /// that died or gave up mid-request does not strand them.
    pub async fn reclaim_expired_planning_requests(
        &self,
        cutoff: DateTime<Utc>,
    ) -> HiveResult<Vec<Uuid>> {
        let reclaimed = self
            .with_conn(move |conn| reclaim_expired_tx(conn, cutoff))
            .await?;
        for id in &reclaimed {
            warn!(request_id = %id, "Planning lease expired, request back to pending");
        }
        Ok(reclaimed)
    }

    /// Hand a request held by `agent` back to `pending` without failing it.
    ///
    /// Returns `false` when `agent` no longer holds the request.
    pub async fn release_planning_request(&self, id: Uuid, agent: &str) -> HiveResult<bool> {
        let owned_agent = agent.to_string();
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE planning_queue SET status = 'pending', assigned_agent = NULL, \
                     assigned_at = NULL WHERE id = ?1 AND status = 'assigned' AND assigned_agent = ?2",
                    params![id.to_string(), owned_agent],
                )?)
            })
            .await?;
        if changed == 1 {
            info!(request_id = %id, agent, "Planning request released");
        }
        Ok(changed == 1)
    }
}
