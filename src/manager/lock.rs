//! Work assignment for the worker lease protocol.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::error;

use super::stores::{JobsStore, QueuesStore, StaticDefinitions};
use crate::schemas::{
    ComponentDefinition, LockInput, LockResponse, QueueItem, ResourceItem, ResourcesProviderItem,
};

pub struct LockContext<'a> {
    pub max_assigned_items: usize,
    pub definitions: &'a StaticDefinitions,
    pub queues: &'a dyn QueuesStore,
    pub jobs: &'a dyn JobsStore,
}

/// Builds the set of queue items leased to one worker.
///
/// Rules:
/// - re-offer items already assigned to this worker within the last 15
///   minutes, capped at `max_assigned_items` (excess assignments are
///   released),
/// - fill remaining slots from unassigned or expired items; the fill is not
///   capped when `executors` is set (filtering happens below),
/// - drop items whose definition cannot be joined (their job is marked
///   failed), whose required resources are missing from the catalog, or
///   whose executor is unknown,
/// - stamp the final set with a fresh assignment.
pub fn lock_jobs(input: &LockInput, ctx: &LockContext) -> LockResponse {
    let cutoff = Utc::now() - chrono::Duration::minutes(15);
    let selector = input.selector.as_deref();

    let mut assigned =
        ctx.queues
            .get_assigned(&input.worker_id, selector, cutoff);

    // Unassign extra items.
    for extra in assigned.iter().skip(ctx.max_assigned_items) {
        ctx.queues.update_assignment(&extra.name, None, None);
    }
    assigned.truncate(ctx.max_assigned_items);

    if assigned.len() < ctx.max_assigned_items {
        let limit = if input.executors.is_none() {
            Some(ctx.max_assigned_items - assigned.len())
        } else {
            None
        };
        let taken: Vec<String> = assigned.iter().map(|row| row.name.clone()).collect();
        assigned.extend(
            ctx.queues
                .get_unassigned(cutoff, limit, selector)
                .into_iter()
                .filter(|row| !taken.contains(&row.name)),
        );
    }

    // Join definitions and filter by requested executors.
    let mut joined: Vec<QueueItem> = Vec::new();
    for row in assigned {
        let Some(item) = ctx.definitions.queues.get(&row.name) else {
            if let Some(job_name) = &row.job_name {
                ctx.jobs
                    .set_failed(job_name, &format!("no definition for queue {}", row.name));
            }
            continue;
        };
        if let Some(executors) = &input.executors {
            if !executors.contains(&item.executor) {
                continue;
            }
        }
        joined.push(item.clone());
    }

    // Collect resources and executors; drop items with catalog gaps.
    let mut resources: BTreeMap<String, ResourceItem> = BTreeMap::new();
    let mut resources_providers: BTreeMap<String, ResourcesProviderItem> = BTreeMap::new();
    let mut executors: BTreeMap<String, ComponentDefinition> = BTreeMap::new();
    let mut items: Vec<QueueItem> = Vec::new();

    'item: for item in joined {
        let mut item_resources: Vec<ResourceItem> = Vec::new();
        let mut item_providers: Vec<ResourcesProviderItem> = Vec::new();
        for resource_type in item.pipeline.info.resources.values() {
            let pool = ctx
                .definitions
                .resources_by_type
                .get(resource_type)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let providers = ctx
                .definitions
                .resources_providers_by_type
                .get(resource_type)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if pool.is_empty() && providers.is_empty() {
                error!(
                    item = %item.name,
                    resource = %resource_type,
                    "Skipping queue item, resource missing"
                );
                continue 'item;
            }
            item_resources.extend(pool.iter().cloned());
            item_providers.extend(providers.iter().cloned());
        }

        let Some(executor) = ctx.definitions.executors.get(&item.executor) else {
            error!(
                item = %item.name,
                executor = %item.executor,
                "Skipping queue item, executor missing"
            );
            continue;
        };

        for resource in item_resources {
            resources.insert(resource.name.clone(), resource);
        }
        for provider in item_providers {
            resources_providers.insert(provider.name.clone(), provider);
        }
        executors.insert(executor.name.clone(), executor.clone());
        items.push(item);
    }

    // Refresh assignments on the final set.
    let now = Utc::now();
    for item in &items {
        ctx.queues
            .update_assignment(&item.name, Some(now), Some(&input.worker_id));
    }

    LockResponse {
        items,
        resources: resources.into_values().collect(),
        resources_providers: resources_providers.into_values().collect(),
        executors: executors.into_values().collect(),
    }
}
