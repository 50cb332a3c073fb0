use crate::{CoreError, InstanceStatus};

/// Checks a status change against the instance lifecycle graph.
///
/// `action` only labels the error for the caller.
pub fn validate_transition(
    action: &str,
    from: InstanceStatus,
    to: InstanceStatus,
) -> Result<(), CoreError> {
    use InstanceStatus::*;

    let valid = matches!(
        (from, to),
        (Created | Failed, Installing)
            | (Installing, Installed | Failed)
            | (Installed | Stopped, Starting)
            | (Starting, Running | Failed)
            | (Running, Stopping)
            | (Stopping, Stopped | Failed)
            | (Created | Installed | Stopped | Failed, Removed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            action: action.to_string(),
            from,
            to,
        })
    }
}

/// Statuses from which `operation` may be issued.
pub fn allowed_sources(operation: crate::OperationType) -> &'static [InstanceStatus] {
    use crate::OperationType;
    match operation {
        OperationType::Install => &[InstanceStatus::Created, InstanceStatus::Failed],
        OperationType::Start => &[InstanceStatus::Installed, InstanceStatus::Stopped],
        OperationType::Stop => &[InstanceStatus::Running],
        OperationType::Remove => &[
            InstanceStatus::Created,
            InstanceStatus::Installed,
            InstanceStatus::Stopped,
            InstanceStatus::Failed,
            InstanceStatus::Running,
        ],
    }
}
