// Flow producer - parent/child job trees added atomically

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::{Job, JobId, JobOptions, ParentRef};
use crate::error::{AppError, Result};
use crate::port::store::{FlowNodePlan, QueueStore};
use crate::port::TimeProvider;

/// One node of a flow tree to add. Children block the parent until they
/// finish (or a per-edge failure policy lets the parent progress).
#[derive(Debug, Clone)]
pub struct FlowJob {
    pub name: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    pub fn new(name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            data: serde_json::Value::Null,
            opts: JobOptions::default(),
            children: Vec::new(),
        }
    }
}

/// Ids assigned to an added flow, mirroring the input tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowNodeIds {
    pub job_id: JobId,
    pub queue_name: String,
    pub children: Vec<FlowNodeIds>,
}

/// Builds flow trees and hands them to the store as one atomic insertion.
pub struct FlowProducer {
    store: Arc<dyn QueueStore>,
    prefix: String,
    time_provider: Arc<dyn TimeProvider>,
}

impl FlowProducer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        prefix: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            time_provider,
        }
    }

    /// Add a flow: the parent lands in `waiting-children`, each child in its
    /// own queue with a parent reference. The whole tree is one atomic write.
    pub async fn add(&self, flow: &FlowJob) -> Result<FlowNodeIds> {
        let now = self.time_provider.now_millis();
        let mut plans = Vec::new();
        let ids = self.plan_node(flow, None, &mut plans, now)?;

        self.store.add_flow(&plans).await?;
        info!(
            root_id = %ids.job_id,
            nodes = %plans.len(),
            "Flow added"
        );
        Ok(ids)
    }

    fn plan_node(
        &self,
        node: &FlowJob,
        parent: Option<&ParentRef>,
        plans: &mut Vec<FlowNodePlan>,
        now_millis: i64,
    ) -> Result<FlowNodeIds> {
        node.opts.validate(now_millis)?;
        if node.opts.repeat.is_some() {
            return Err(AppError::Internal(
                "Repeat options are not supported on flow jobs".to_string(),
            ));
        }

        let id = node
            .opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let queue_key = format!("{}:{}", self.prefix, node.queue_name);

        let mut job = Job::new(node.name.clone(), node.data.clone(), node.opts.clone(), now_millis);
        job.id = id.clone();
        if let Some(parent) = parent {
            job.parent = Some(parent.clone());
            job.parent_key = Some(parent.job_key());
        }

        // Children ids are needed before the parent plan is pushed, so the
        // parent's pending set can name them
        let self_ref = ParentRef {
            id: id.clone(),
            queue_key: queue_key.clone(),
        };
        let child_ids: Vec<(String, String)> = node
            .children
            .iter()
            .map(|child| {
                let child_id = child
                    .opts
                    .job_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let child_queue_key = format!("{}:{}", self.prefix, child.queue_name);
                (child_id, child_queue_key)
            })
            .collect();
        let pending_children: Vec<String> = child_ids
            .iter()
            .map(|(child_id, child_queue_key)| format!("{}:{}", child_queue_key, child_id))
            .collect();

        plans.push(FlowNodePlan {
            queue_name: node.queue_name.clone(),
            job,
            pending_children,
        });

        let mut children = Vec::with_capacity(node.children.len());
        for (child, (child_id, _)) in node.children.iter().zip(child_ids) {
            // Pin the id computed above so plan and pending set agree
            let mut pinned = child.clone();
            pinned.opts.job_id = Some(child_id);
            children.push(self.plan_node(&pinned, Some(&self_ref), plans, now_millis)?);
        }

        Ok(FlowNodeIds {
            job_id: id,
            queue_name: node.queue_name.clone(),
            children,
        })
    }
}
