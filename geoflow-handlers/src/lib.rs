pub mod greet_reply;
pub mod hello_world;

use geoflow_core::registry::{JobRegistry, RegistryError, TaskRegistry};
use std::sync::Arc;

/// Register every built-in workflow and task handler. Called once from each
/// binary's `main`, immediately before `JobRegistry::freeze` /
/// `TaskRegistry::freeze` (spec.md section 9 — explicit registration, no
/// self-registering decorators).
pub fn register_all(
    job_registry: &mut JobRegistry,
    task_registry: &mut TaskRegistry,
) -> Result<(), RegistryError> {
    job_registry.register(Arc::new(hello_world::HelloWorldSpec))?;
    job_registry.register(Arc::new(greet_reply::GreetReplySpec))?;

    task_registry.register(Arc::new(hello_world::EchoHandler))?;
    task_registry.register(Arc::new(greet_reply::GreetHandler))?;
    task_registry.register(Arc::new(greet_reply::ReplyHandler))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoflow_core::registry::validate_cross_registry;

    #[test]
    fn built_in_handlers_satisfy_their_own_workflow_specs() {
        let mut jobs = JobRegistry::new();
        let mut tasks = TaskRegistry::new();
        register_all(&mut jobs, &mut tasks).unwrap();
        validate_cross_registry(&jobs, &tasks).unwrap();
    }
}
