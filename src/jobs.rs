use crate::authz::sync::Synchronizer;
use crate::entities;
use crate::errors::PortcullisError;
use crate::settings::Jobs as JobsCfg;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const RELOAD_POLICIES: &str = "reload_policies";
pub const RECONCILE_POLICIES: &str = "reconcile_policies";

/// Jobs known to the scheduler and the admin trigger.
pub const JOB_NAMES: [&str; 2] = [RELOAD_POLICIES, RECONCILE_POLICIES];

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    sync: Arc<Synchronizer>,
    cfg: &JobsCfg,
) -> Result<JobScheduler, PortcullisError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| PortcullisError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for (name, schedule) in [
        (RELOAD_POLICIES, cfg.policy_reload_schedule.as_str()),
        (RECONCILE_POLICIES, cfg.reconcile_schedule.as_str()),
    ] {
        let sync = sync.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let sync = sync.clone();
            Box::pin(async move {
                info!("Running {} job", name);
                let _ = run_recorded(&sync, name).await;
            })
        })
        .map_err(|e| PortcullisError::Other(format!("Failed to create {} job: {}", name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| PortcullisError::Other(format!("Failed to add {} job: {}", name, e)))?;
    }

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| PortcullisError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", JOB_NAMES.len());

    Ok(sched)
}

/// Run one job body. Returns the number of records it touched.
async fn run_job(sync: &Synchronizer, job_name: &str) -> Result<i64, PortcullisError> {
    match job_name {
        // Retries a reload that failed or timed out during a mutation
        RELOAD_POLICIES => {
            sync.reload_now().await?;
            let stats = sync.store().stats();
            Ok((stats.policies + stats.groupings) as i64)
        }
        RECONCILE_POLICIES => {
            let (policies, groupings) = sync.rebuild_all().await?;
            Ok((policies + groupings) as i64)
        }
        _ => Err(PortcullisError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Run a job and record its execution. Failures are logged and recorded,
/// then returned.
async fn run_recorded(sync: &Synchronizer, job_name: &str) -> Result<i64, PortcullisError> {
    let db = sync.db();
    let execution_id = start_job_execution(db, job_name).await.ok();

    let result = run_job(sync, job_name).await;
    match &result {
        Ok(count) => {
            info!("Job {} completed: {} records", job_name, count);
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, true, None, Some(*count)).await;
            }
        }
        Err(e) => {
            error!("Job {} failed: {}", job_name, e);
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, false, Some(e.to_string()), None).await;
            }
        }
    }
    result
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, PortcullisError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), PortcullisError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (useful for admin API)
pub async fn trigger_job_manually(
    sync: &Synchronizer,
    job_name: &str,
) -> Result<i64, PortcullisError> {
    if !JOB_NAMES.contains(&job_name) {
        return Err(PortcullisError::Other(format!("Unknown job name: {}", job_name)));
    }
    info!("Manually triggering job: {}", job_name);
    run_recorded(sync, job_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::authz::store::PolicyStore;
    use crate::settings::Settings;
    use crate::storage::test_support::TestDb;

    async fn synchronizer(test_db: &TestDb) -> Synchronizer {
        let db = test_db.connection().clone();
        let store = Arc::new(PolicyStore::load(db.clone()).await.unwrap());
        let sync = Synchronizer::new(db, store, AuditSink::disabled(), &Settings::default());
        sync.bootstrap().await.unwrap();
        sync
    }

    #[tokio::test]
    async fn test_trigger_records_execution() {
        let test_db = TestDb::new().await;
        let sync = synchronizer(&test_db).await;

        let count = trigger_job_manually(&sync, RECONCILE_POLICIES).await.unwrap();
        // seven wildcard triples plus the super-admin membership
        assert_eq!(count, 8);

        let executions = entities::job_execution::Entity::find()
            .all(test_db.connection())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].job_name, RECONCILE_POLICIES);
        assert_eq!(executions[0].success, Some(1));
        assert_eq!(executions[0].records_processed, Some(8));
    }

    #[tokio::test]
    async fn test_reload_job() {
        let test_db = TestDb::new().await;
        let sync = synchronizer(&test_db).await;
        assert_eq!(trigger_job_manually(&sync, RELOAD_POLICIES).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        let test_db = TestDb::new().await;
        let sync = synchronizer(&test_db).await;

        assert!(trigger_job_manually(&sync, "cleanup_expired_sessions").await.is_err());
        let executions = entities::job_execution::Entity::find()
            .all(test_db.connection())
            .await
            .unwrap();
        assert!(executions.is_empty());
    }
}
