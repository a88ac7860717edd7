//! Workflow Storage
//!
//! SQLite implementation of `WorkflowRepository`.

use rusqlite::{params, params_from_iter, OptionalExtension, ToSql};

use super::database::{json_column, json_param, now_timestamp, parse_column, Database};
use super::repository::{StepSeed, WorkflowRepository};
use crate::models::workflow::{
    NewWorkflow, StepStatus, StepUpdate, Workflow, WorkflowStatus, WorkflowStep,
};
use crate::utils::error::{AppError, AppResult};

const WORKFLOW_COLUMNS: &str = "id, project_id, feature_request, pause_behavior, status,
     clarification_agent_id, skip_clarification, version, created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "id, workflow_id, step_number, step_type, status, output_text,
     output_structured, error_message, duration_ms, started_at, completed_at,
     output_edited_at, version, created_at, updated_at";

impl WorkflowRepository for Database {
    fn create_workflow(
        &self,
        input: &NewWorkflow,
        steps: &[StepSeed],
    ) -> AppResult<(Workflow, Vec<WorkflowStep>)> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();

        tx.execute(
            "INSERT INTO workflows (project_id, feature_request, pause_behavior, status,
                 clarification_agent_id, skip_clarification, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                input.project_id,
                input.feature_request,
                input.pause_behavior.as_str(),
                WorkflowStatus::Created.as_str(),
                input.clarification_agent_id,
                input.skip_clarification,
                now,
            ],
        )?;
        let workflow_id = tx.last_insert_rowid();

        for (index, seed) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_steps (workflow_id, step_number, step_type, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    workflow_id,
                    (index + 1) as i64,
                    seed.step_type.as_str(),
                    seed.status.as_str(),
                    now,
                ],
            )?;
        }

        let workflow = query_workflow(&tx, workflow_id)?
            .ok_or_else(|| AppError::database("Inserted workflow vanished"))?;
        let steps = query_steps(&tx, workflow_id, None)?;
        tx.commit()?;

        Ok((workflow, steps))
    }

    fn find_workflow(&self, id: i64) -> AppResult<Option<Workflow>> {
        let conn = self.get_connection()?;
        query_workflow(&conn, id)
    }

    fn list_workflows(&self, project_id: i64) -> AppResult<Vec<Workflow>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workflows WHERE project_id = ?1 ORDER BY id",
            WORKFLOW_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id], row_to_workflow)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn update_workflow_status(
        &self,
        id: i64,
        expected_version: i64,
        status: WorkflowStatus,
    ) -> AppResult<Workflow> {
        let conn = self.get_connection()?;
        let changed = set_workflow_status(&conn, id, Some(expected_version), status)?;
        if changed == 0 {
            return Err(stale_or_missing(&conn, "workflows", "Workflow", id));
        }
        query_workflow(&conn, id)?.ok_or_else(|| AppError::not_found(format!("Workflow {}", id)))
    }

    fn delete_workflow(&self, id: i64) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let deleted = conn.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn find_step(&self, id: i64) -> AppResult<Option<WorkflowStep>> {
        let conn = self.get_connection()?;
        query_step(&conn, id)
    }

    fn list_steps(
        &self,
        workflow_id: i64,
        status: Option<StepStatus>,
    ) -> AppResult<Vec<WorkflowStep>> {
        let conn = self.get_connection()?;
        query_steps(&conn, workflow_id, status)
    }

    fn update_step(
        &self,
        id: i64,
        expected_version: i64,
        update: &StepUpdate,
    ) -> AppResult<WorkflowStep> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(text) = &update.output_text {
            sets.push("output_text = ?");
            values.push(Box::new(text.clone()));
        }
        if let Some(structured) = &update.output_structured {
            sets.push("output_structured = ?");
            values.push(Box::new(json_param(structured)?));
        }
        if let Some(error) = &update.error_message {
            sets.push("error_message = ?");
            values.push(Box::new(error.clone()));
        }
        if let Some(duration) = update.duration_ms {
            sets.push("duration_ms = ?");
            values.push(Box::new(duration));
        }
        if let Some(started) = &update.started_at {
            sets.push("started_at = ?");
            values.push(Box::new(started.clone()));
        }
        if let Some(completed) = &update.completed_at {
            sets.push("completed_at = ?");
            values.push(Box::new(completed.clone()));
        }
        if let Some(edited) = &update.output_edited_at {
            sets.push("output_edited_at = ?");
            values.push(Box::new(edited.clone()));
        }
        sets.push("version = version + 1");
        sets.push("updated_at = ?");
        values.push(Box::new(now));
        values.push(Box::new(id));
        values.push(Box::new(expected_version));

        let sql = format!(
            "UPDATE workflow_steps SET {} WHERE id = ? AND version = ?",
            sets.join(", ")
        );
        let changed = tx.execute(&sql, params_from_iter(values.iter()))?;
        if changed == 0 {
            return Err(stale_or_missing(&tx, "workflow_steps", "Step", id));
        }

        let step = query_step(&tx, id)?
            .ok_or_else(|| AppError::not_found(format!("Step {}", id)))?;

        if let Some(status) = update.workflow_status {
            let changed =
                set_workflow_status(&tx, step.workflow_id, update.workflow_version, status)?;
            if changed == 0 {
                return Err(stale_or_missing(&tx, "workflows", "Workflow", step.workflow_id));
            }
        }

        tx.commit()?;
        Ok(step)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn query_workflow(conn: &rusqlite::Connection, id: i64) -> AppResult<Option<Workflow>> {
    conn.query_row(
        &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
        params![id],
        row_to_workflow,
    )
    .optional()
    .map_err(AppError::from)
}

fn query_step(conn: &rusqlite::Connection, id: i64) -> AppResult<Option<WorkflowStep>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM workflow_steps WHERE id = ?1", STEP_COLUMNS),
        params![id],
        row_to_step,
    );

    match result {
        Ok(step) => Ok(Some(step)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn query_steps(
    conn: &rusqlite::Connection,
    workflow_id: i64,
    status: Option<StepStatus>,
) -> AppResult<Vec<WorkflowStep>> {
    let steps = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM workflow_steps WHERE workflow_id = ?1 AND status = ?2
                 ORDER BY step_number",
                STEP_COLUMNS
            ))?;
            let rows = stmt.query_map(params![workflow_id, status.as_str()], row_to_step)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_number",
                STEP_COLUMNS
            ))?;
            let rows = stmt.query_map(params![workflow_id], row_to_step)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(steps)
}

/// Set a workflow's status, optionally guarded by its version.
fn set_workflow_status(
    conn: &rusqlite::Connection,
    id: i64,
    expected_version: Option<i64>,
    status: WorkflowStatus,
) -> AppResult<usize> {
    let now = now_timestamp();
    let completed_at = if status.is_terminal() {
        Some(now.clone())
    } else {
        None
    };

    let changed = match expected_version {
        Some(version) => conn.execute(
            "UPDATE workflows
             SET status = ?1, completed_at = COALESCE(?2, completed_at),
                 version = version + 1, updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            params![status.as_str(), completed_at, now, id, version],
        )?,
        None => conn.execute(
            "UPDATE workflows
             SET status = ?1, completed_at = COALESCE(?2, completed_at),
                 version = version + 1, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), completed_at, now, id],
        )?,
    };
    Ok(changed)
}

/// Distinguish a stale version from a missing row after a zero-row update.
fn stale_or_missing(conn: &rusqlite::Connection, table: &str, label: &str, id: i64) -> AppError {
    let exists = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", table),
            params![id],
            |_| Ok(()),
        )
        .optional();

    match exists {
        Ok(Some(())) => AppError::concurrent_modification(format!(
            "{} {} was modified by another writer",
            label, id
        )),
        Ok(None) => AppError::not_found(format!("{} {}", label, id)),
        Err(e) => e.into(),
    }
}

fn row_to_workflow(row: &rusqlite::Row) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        feature_request: row.get(2)?,
        pause_behavior: parse_column(row, 3)?,
        status: parse_column(row, 4)?,
        clarification_agent_id: row.get(5)?,
        skip_clarification: row.get(6)?,
        version: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<WorkflowStep> {
    Ok(WorkflowStep {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        step_number: row.get(2)?,
        step_type: parse_column(row, 3)?,
        status: parse_column(row, 4)?,
        output_text: row.get(5)?,
        output_structured: json_column(row, 6)?,
        error_message: row.get(7)?,
        duration_ms: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        output_edited_at: row.get(11)?,
        version: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
