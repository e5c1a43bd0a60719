//! Workflow run sequencing
//!
//! A run instantiates the template's step chain and drives it one job
//! at a time: the first step's job is created with the run, each later
//! step's job when its predecessor reaches terminal success. A failed,
//! cancelled, or skipped step job fails the run.

use crate::error::{Result, WorkflowError};
use chrono::{DateTime, Utc};
use keel_release::workflow_dispatch_context;
use keel_store::WorkspaceStore;
use keel_types::{
    Job, JobId, JobStatus, Workflow, WorkflowDispatchContext, WorkflowRun, WorkflowRunId,
    WorkflowRunStatus, WorkflowStep, WorkflowStepId,
};
use tracing::{debug, info};

/// What one advance did to a run.
#[derive(Debug)]
pub struct WorkflowAdvance {
    pub run_id: WorkflowRunId,

    /// Step job created by this advance, if any
    pub created_job: Option<JobId>,

    /// Index of the step the run is now on, when one is active
    pub step_index: Option<usize>,

    /// Run status after the advance
    pub run_status: WorkflowRunStatus,
}

/// Sequences workflow runs as chained jobs. Stateless; runs and steps
/// live in the store.
#[derive(Debug, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn new() -> Self {
        Self
    }

    /// Create a run for a workflow: materialize the step chain and
    /// start the first step's job.
    pub fn create_run(
        &self,
        store: &mut WorkspaceStore,
        run_id: WorkflowRunId,
        workflow_id: &keel_types::WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<WorkflowAdvance> {
        let workflow = store
            .workflow(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.clone()))?;
        let template = store
            .workflow_template(&workflow.template_id)
            .cloned()
            .ok_or_else(|| WorkflowError::TemplateNotFound(workflow.template_id.clone()))?;
        if template.step_templates.is_empty() {
            return Err(WorkflowError::EmptyTemplate(template.id));
        }

        store.upsert_workflow_run(WorkflowRun {
            id: run_id.clone(),
            workspace_id: store.workspace_id().clone(),
            workflow_id: workflow.id.clone(),
            status: WorkflowRunStatus::Running,
            created_at: now,
            completed_at: None,
        });

        let mut steps = Vec::new();
        for (index, step_template) in template.step_templates.iter().enumerate() {
            let step = WorkflowStep {
                id: WorkflowStepId::generate(),
                workspace_id: store.workspace_id().clone(),
                run_id: run_id.clone(),
                index,
                name: step_template.name.clone(),
                job_agent_id: step_template.job_agent_id.clone(),
                job_agent_config: step_template.job_agent_config.clone(),
                job_id: None,
            };
            store.upsert_workflow_step(step.clone());
            steps.push(step);
        }

        let created_job = self.start_step(store, &workflow, &steps[0], now);
        info!(%run_id, workflow = %workflow.id, steps = steps.len(), "workflow run created");

        Ok(WorkflowAdvance {
            run_id,
            created_job: Some(created_job),
            step_index: Some(0),
            run_status: WorkflowRunStatus::Running,
        })
    }

    /// React to a terminal update of a workflow-step job. Returns
    /// `None` when the job does not belong to a workflow step or the
    /// update does not advance the run.
    pub fn advance_on_job_update(
        &self,
        store: &mut WorkspaceStore,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Option<WorkflowAdvance> {
        let step = store.step_for_job(&job.id)?.clone();
        let mut run = store.workflow_run(&step.run_id)?.clone();
        if run.status != WorkflowRunStatus::Running {
            return None;
        }

        match job.status {
            JobStatus::Successful => {
                let steps: Vec<WorkflowStep> = store
                    .steps_for_run(&run.id)
                    .into_iter()
                    .cloned()
                    .collect();
                let next = steps.iter().find(|s| s.index == step.index + 1).cloned();
                match next {
                    Some(next_step) => {
                        let workflow = store.workflow(&run.workflow_id)?.clone();
                        let created = self.start_step(store, &workflow, &next_step, now);
                        debug!(run_id = %run.id, step = next_step.index, "workflow advanced");
                        Some(WorkflowAdvance {
                            run_id: run.id,
                            created_job: Some(created),
                            step_index: Some(next_step.index),
                            run_status: WorkflowRunStatus::Running,
                        })
                    }
                    None => {
                        run.status = WorkflowRunStatus::Completed;
                        run.completed_at = Some(now);
                        let run_id = run.id.clone();
                        store.upsert_workflow_run(run);
                        info!(%run_id, "workflow run completed");
                        Some(WorkflowAdvance {
                            run_id,
                            created_job: None,
                            step_index: None,
                            run_status: WorkflowRunStatus::Completed,
                        })
                    }
                }
            }
            JobStatus::Failure | JobStatus::Cancelled | JobStatus::Skipped => {
                run.status = WorkflowRunStatus::Failed;
                run.completed_at = Some(now);
                let run_id = run.id.clone();
                store.upsert_workflow_run(run);
                info!(%run_id, step = step.index, "workflow run failed");
                Some(WorkflowAdvance {
                    run_id,
                    created_job: None,
                    step_index: Some(step.index),
                    run_status: WorkflowRunStatus::Failed,
                })
            }
            _ => None,
        }
    }

    fn start_step(
        &self,
        store: &mut WorkspaceStore,
        workflow: &Workflow,
        step: &WorkflowStep,
        now: DateTime<Utc>,
    ) -> JobId {
        let agent = store.job_agent(&step.job_agent_id).cloned();
        let status = if agent.is_some() {
            JobStatus::Pending
        } else {
            JobStatus::InvalidJobAgent
        };

        let job = Job {
            id: JobId::generate(),
            workspace_id: store.workspace_id().clone(),
            release_id: None,
            workflow_step_id: Some(step.id.clone()),
            job_agent_id: agent.as_ref().map(|a| a.id.clone()),
            job_agent_config: step.job_agent_config.clone(),
            status,
            dispatch_context: workflow_dispatch_context(
                agent.as_ref(),
                WorkflowDispatchContext {
                    run_id: step.run_id.clone(),
                    step_id: step.id.clone(),
                    index: step.index,
                    inputs: workflow.inputs.clone(),
                },
            ),
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let job_id = job.id.clone();
        store.insert_job(job);

        let mut step = step.clone();
        step.job_id = Some(job_id.clone());
        store.upsert_workflow_step(step);

        job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{
        ConfigMap, JobAgent, WorkflowInput, WorkflowStepTemplate, WorkflowTemplate,
    };
    use serde_json::json;

    fn seeded_store() -> WorkspaceStore {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_job_agent(JobAgent::new("agent-1", "ws-1", "runner", "kubernetes"));
        store.upsert_workflow_template(WorkflowTemplate {
            id: "tmpl-1".into(),
            workspace_id: "ws-1".into(),
            name: "migrate".to_string(),
            inputs: vec![WorkflowInput {
                name: "database".to_string(),
                default_value: None,
            }],
            step_templates: vec![
                WorkflowStepTemplate {
                    name: "backup".to_string(),
                    job_agent_id: "agent-1".into(),
                    job_agent_config: ConfigMap::new(),
                },
                WorkflowStepTemplate {
                    name: "migrate".to_string(),
                    job_agent_id: "agent-1".into(),
                    job_agent_config: ConfigMap::new(),
                },
            ],
        });
        let mut inputs = std::collections::BTreeMap::new();
        inputs.insert("database".to_string(), json!("orders"));
        store.upsert_workflow(Workflow {
            id: "wf-1".into(),
            workspace_id: "ws-1".into(),
            template_id: "tmpl-1".into(),
            name: "migrate orders".to_string(),
            inputs,
        });
        store.drain_changes();
        store
    }

    fn succeed(store: &mut WorkspaceStore, job_id: &JobId) -> Job {
        let mut job = store.job(job_id).unwrap().clone();
        job.transition(JobStatus::Successful, Utc::now()).unwrap();
        store.update_job(job.clone());
        job
    }

    #[test]
    fn test_run_creates_first_step_job_only() {
        let mut store = seeded_store();
        let engine = WorkflowEngine::new();

        let advance = engine
            .create_run(&mut store, "run-1".into(), &"wf-1".into(), Utc::now())
            .unwrap();
        assert_eq!(advance.step_index, Some(0));

        let steps = store.steps_for_run(&"run-1".into());
        assert_eq!(steps.len(), 2);
        assert!(steps[0].job_id.is_some());
        assert!(steps[1].job_id.is_none());

        let job = store.job(&advance.created_job.unwrap()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let workflow_ctx = job.dispatch_context.workflow.as_ref().unwrap();
        assert_eq!(workflow_ctx.inputs["database"], json!("orders"));
        assert!(job.release_id.is_none());
    }

    #[test]
    fn test_success_chains_to_next_step_then_completes() {
        let mut store = seeded_store();
        let engine = WorkflowEngine::new();
        let first = engine
            .create_run(&mut store, "run-1".into(), &"wf-1".into(), Utc::now())
            .unwrap();

        let job = succeed(&mut store, &first.created_job.unwrap());
        let advance = engine
            .advance_on_job_update(&mut store, &job, Utc::now())
            .unwrap();
        assert_eq!(advance.step_index, Some(1));
        let second_job_id = advance.created_job.unwrap();

        let job = succeed(&mut store, &second_job_id);
        let advance = engine
            .advance_on_job_update(&mut store, &job, Utc::now())
            .unwrap();
        assert_eq!(advance.run_status, WorkflowRunStatus::Completed);
        assert!(store
            .workflow_run(&"run-1".into())
            .unwrap()
            .completed_at
            .is_some());
    }

    #[test]
    fn test_failed_step_fails_the_run() {
        let mut store = seeded_store();
        let engine = WorkflowEngine::new();
        let first = engine
            .create_run(&mut store, "run-1".into(), &"wf-1".into(), Utc::now())
            .unwrap();

        let mut job = store.job(&first.created_job.unwrap()).unwrap().clone();
        job.transition(JobStatus::Failure, Utc::now()).unwrap();
        store.update_job(job.clone());

        let advance = engine
            .advance_on_job_update(&mut store, &job, Utc::now())
            .unwrap();
        assert_eq!(advance.run_status, WorkflowRunStatus::Failed);

        // The second step never starts
        let steps = store.steps_for_run(&"run-1".into());
        assert!(steps[1].job_id.is_none());
    }

    #[test]
    fn test_release_job_updates_are_ignored() {
        let mut store = seeded_store();
        let engine = WorkflowEngine::new();

        let now = Utc::now();
        let job = Job {
            id: "job-release".into(),
            workspace_id: "ws-1".into(),
            release_id: Some("rel-1".into()),
            workflow_step_id: None,
            job_agent_id: None,
            job_agent_config: ConfigMap::new(),
            status: JobStatus::Successful,
            dispatch_context: Default::default(),
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        };
        assert!(engine.advance_on_job_update(&mut store, &job, now).is_none());
    }
}
