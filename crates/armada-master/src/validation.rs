// Validation of framework actions
//
// Pure functions, no side effects: every check runs against the
// registry state and the offered fragment handed in by the
// coordinator. Batch task validation is sequential; the coordinator
// shrinks the offered pool after each accepted task, so later
// candidates see a smaller pool.

use thiserror::Error;

use armada_resources::{Resource, Resources};
use armada_types::{FrameworkId, OfferId, SlaveId, TaskInfo};

use crate::registry::{Framework, Registry, Slave};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid resources: {0}")]
    Resources(String),

    #[error("Task {0} is invalid: {1}")]
    Task(String, String),

    #[error("Invalid offers: {0}")]
    Offers(String),

    #[error("Invalid volume operation: {0}")]
    Volumes(String),
}

/// Vet resources a framework supplied: well-formed kinds, non-negative
/// scalars, ordered ranges, complete persistence records.
pub fn validate_resources(resources: &[Resource]) -> Result<(), ValidationError> {
    Resources::validate_all(resources).map_err(|e| ValidationError::Resources(e.to_string()))
}

/// Vet a task launch against the residual offered pool.
pub fn validate_task(
    task: &TaskInfo,
    framework: &Framework,
    slave: &Slave,
    offered: &Resources,
) -> Result<(), ValidationError> {
    let task_error = |message: String| ValidationError::Task(task.task_id.to_string(), message);

    if framework.has_live_task(&task.task_id) {
        return Err(task_error("task id is already in use".to_string()));
    }

    if task.slave_id != slave.id {
        return Err(task_error(format!(
            "task targets slave {} but the offer is for slave {}",
            task.slave_id, slave.id
        )));
    }

    match (&task.command, &task.executor) {
        (Some(_), Some(_)) => {
            return Err(task_error(
                "task carries both a command and an executor".to_string(),
            ))
        }
        (None, None) => {
            return Err(task_error(
                "task carries neither a command nor an executor".to_string(),
            ))
        }
        _ => {}
    }

    let task_resources: Vec<Resource> = task.resources.iter().cloned().collect();
    if task_resources.is_empty() {
        return Err(task_error("task uses no resources".to_string()));
    }
    validate_resources(&task_resources)?;

    // Resources charged against the offer: the task's own, plus the
    // executor's when this launch brings a new executor to the slave.
    let mut charged = task.resources.clone();
    if let Some(executor) = &task.executor {
        let executor_resources: Vec<Resource> = executor.resources.iter().cloned().collect();
        validate_resources(&executor_resources)?;

        let running = slave
            .executors
            .get(&framework.id)
            .and_then(|executors| executors.get(&executor.executor_id));
        match running {
            Some(existing) => {
                // Reusing an executor id requires an identical record.
                if existing != executor {
                    return Err(task_error(format!(
                        "executor {} is already running with a different configuration",
                        executor.executor_id
                    )));
                }
            }
            None => charged += &executor.resources,
        }
    }

    if !offered.contains(&charged) {
        return Err(task_error(format!(
            "task requires {} but only {} remains offered",
            charged, offered
        )));
    }
    Ok(())
}

/// Vet a set of accepted or declined offer ids: each must be live and
/// owned by the framework, and all must point at one slave.
pub fn validate_offers(
    offer_ids: &[OfferId],
    registry: &Registry,
    framework_id: &FrameworkId,
) -> Result<SlaveId, ValidationError> {
    if offer_ids.is_empty() {
        return Err(ValidationError::Offers("no offer ids given".to_string()));
    }

    let mut slave_id: Option<SlaveId> = None;
    for offer_id in offer_ids {
        let offer = registry
            .offer(offer_id)
            .ok_or_else(|| ValidationError::Offers(format!("offer {} is no longer valid", offer_id)))?;
        if offer.framework_id != *framework_id {
            return Err(ValidationError::Offers(format!(
                "offer {} belongs to another framework",
                offer_id
            )));
        }
        match &slave_id {
            None => slave_id = Some(offer.slave_id.clone()),
            Some(expected) if *expected != offer.slave_id => {
                return Err(ValidationError::Offers(
                    "offers span more than one slave".to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    let slave_id = slave_id.expect("at least one offer was validated");
    match registry.slave(&slave_id) {
        Some(slave) if slave.active => Ok(slave_id),
        _ => Err(ValidationError::Offers(format!(
            "slave {} behind the offers is gone",
            slave_id
        ))),
    }
}

/// Vet a Create operation: volumes are persistent disk, ids are new on
/// this slave, and the principal matches the framework's.
pub fn validate_create(
    volumes: &[Resource],
    checkpointed: &Resources,
    principal: Option<&str>,
) -> Result<(), ValidationError> {
    validate_resources(volumes).map_err(|e| ValidationError::Volumes(e.to_string()))?;

    for volume in volumes {
        let persistence = volume
            .persistence
            .as_ref()
            .ok_or_else(|| ValidationError::Volumes(format!("{} is not a persistent volume", volume)))?;

        let duplicate = checkpointed.persistent_volumes().iter().any(|existing| {
            existing
                .persistence
                .as_ref()
                .map(|p| p.id == persistence.id)
                .unwrap_or(false)
        });
        if duplicate {
            return Err(ValidationError::Volumes(format!(
                "volume id {} already exists on this slave",
                persistence.id
            )));
        }

        if let Some(reservation) = &volume.reservation {
            if principal != Some(reservation.as_str()) {
                return Err(ValidationError::Volumes(format!(
                    "volume {} is reserved for principal {} which is not the framework's",
                    persistence.id, reservation
                )));
            }
        }
    }
    Ok(())
}

/// Vet a Destroy operation: every named volume must exist in the
/// slave's checkpointed set.
pub fn validate_destroy(volumes: &[Resource], checkpointed: &Resources) -> Result<(), ValidationError> {
    for volume in volumes {
        let known = checkpointed
            .persistent_volumes()
            .iter()
            .any(|existing| existing == volume);
        if !known {
            return Err(ValidationError::Volumes(format!(
                "volume {} does not exist on this slave",
                volume
            )));
        }
    }
    Ok(())
}
