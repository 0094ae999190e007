//! Workflow definitions and the registry that maps workflow types to them
//!
//! The registry is built once at startup and handed to the executor; it is
//! read-only afterwards, so there is no global lookup and no locking.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::reliability::{RetryPolicy, RetryPolicyError};
use crate::step::Step;

/// Error registering a workflow definition
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type registered twice
    #[error("workflow type already registered: {0}")]
    DuplicateWorkflowType(String),

    /// Definition without steps
    #[error("workflow {0} has no steps")]
    EmptyWorkflow(String),

    /// Two steps share a name
    #[error("workflow {workflow_type} declares step {step_name} more than once")]
    DuplicateStepName {
        workflow_type: String,
        step_name: String,
    },

    /// Condition step that would be re-checked in a busy loop
    #[error("workflow {workflow_type} step {step_name} polls with a zero interval")]
    ZeroPollInterval {
        workflow_type: String,
        step_name: String,
    },

    /// Retry policy cannot produce a valid schedule
    #[error("workflow {workflow_type} has an invalid retry policy: {source}")]
    InvalidRetryPolicy {
        workflow_type: String,
        #[source]
        source: RetryPolicyError,
    },
}

/// What the executor does when it reaches a step
#[derive(Clone)]
pub enum StepKind {
    /// Run business logic
    Task(Arc<dyn Step>),

    /// Park the instance for a fixed time, passing the input through
    Sleep(Duration),

    /// Park until the named signal is delivered; its payload becomes the output
    Signal {
        name: String,
        timeout: Option<Duration>,
    },

    /// Re-run `check` every `interval` until it returns `true`, passing the
    /// input through
    Condition {
        check: Arc<dyn Step>,
        interval: Duration,
        timeout: Option<Duration>,
    },
}

impl StepKind {
    /// Whether the step may park the instance between attempts
    pub fn is_wait(&self) -> bool {
        !matches!(self, Self::Task(_))
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(_) => f.write_str("Task"),
            Self::Sleep(duration) => f.debug_tuple("Sleep").field(duration).finish(),
            Self::Signal { name, timeout } => f
                .debug_struct("Signal")
                .field("name", name)
                .field("timeout", timeout)
                .finish(),
            Self::Condition {
                interval, timeout, ..
            } => f
                .debug_struct("Condition")
                .field("interval", interval)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

/// One named step of a workflow
pub struct StepSpec {
    name: String,
    kind: StepKind,
    retry_policy: Option<RetryPolicy>,
}

impl StepSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// Per-step override of the workflow retry policy
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Ordered list of steps plus the retry policy for a workflow type
#[derive(Debug)]
pub struct WorkflowDefinition {
    workflow_type: String,
    steps: Vec<StepSpec>,
    retry_policy: RetryPolicy,
}

impl WorkflowDefinition {
    /// Start building a definition
    ///
    /// # Example
    ///
    /// ```ignore
    /// let definition = WorkflowDefinition::builder("ship-order")
    ///     .step("reserveInventory", ReserveInventory)
    ///     .step("charge", ChargeCard::new(payments))
    ///     .await_signal("approval", "approved", Some(Duration::from_secs(86_400)))
    ///     .step("notify", step_fn(|_, input| async move { Ok(input) }))
    ///     .retry_policy(RetryPolicy::exponential().with_max_attempts(3))
    ///     .build()?;
    /// ```
    pub fn builder(workflow_type: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            workflow_type: workflow_type.into(),
            steps: Vec::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn step(&self, index: u32) -> Option<&StepSpec> {
        self.steps.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Workflow-level retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Policy governing the step at `index`
    pub fn retry_policy_for(&self, index: u32) -> &RetryPolicy {
        self.step(index)
            .and_then(StepSpec::retry_policy)
            .unwrap_or(&self.retry_policy)
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowDefinitionBuilder {
    workflow_type: String,
    steps: Vec<StepSpec>,
    retry_policy: RetryPolicy,
}

impl WorkflowDefinitionBuilder {
    /// Append a step
    pub fn step(self, name: impl Into<String>, step: impl Step) -> Self {
        self.push(name, StepKind::Task(Arc::new(step)))
    }

    /// Append a step with its own retry policy
    pub fn step_with_retry(
        mut self,
        name: impl Into<String>,
        step: impl Step,
        retry_policy: RetryPolicy,
    ) -> Self {
        self.steps.push(StepSpec {
            name: name.into(),
            kind: StepKind::Task(Arc::new(step)),
            retry_policy: Some(retry_policy),
        });
        self
    }

    /// Append a durable sleep; survives restarts because the start is recorded
    pub fn sleep(self, name: impl Into<String>, duration: Duration) -> Self {
        self.push(name, StepKind::Sleep(duration))
    }

    /// Append a step that waits for a named signal
    ///
    /// Without a timeout the instance waits until signalled or cancelled.
    pub fn await_signal(
        self,
        name: impl Into<String>,
        signal: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        self.push(
            name,
            StepKind::Signal {
                name: signal.into(),
                timeout,
            },
        )
    }

    /// Append a step that polls `check` until it returns JSON `true`
    ///
    /// A fatal error from `check` fails the instance; any other error counts
    /// as "not yet".
    pub fn await_condition(
        self,
        name: impl Into<String>,
        check: impl Step,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        self.push(
            name,
            StepKind::Condition {
                check: Arc::new(check),
                interval,
                timeout,
            },
        )
    }

    fn push(mut self, name: impl Into<String>, kind: StepKind) -> Self {
        self.steps.push(StepSpec {
            name: name.into(),
            kind,
            retry_policy: None,
        });
        self
    }

    /// Set the workflow-level retry policy
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, RegistryError> {
        if self.steps.is_empty() {
            return Err(RegistryError::EmptyWorkflow(self.workflow_type));
        }

        let mut seen = HashSet::new();
        for spec in &self.steps {
            if !seen.insert(spec.name.as_str()) {
                return Err(RegistryError::DuplicateStepName {
                    workflow_type: self.workflow_type.clone(),
                    step_name: spec.name.clone(),
                });
            }
            if let StepKind::Condition { interval, .. } = &spec.kind {
                if interval.is_zero() {
                    return Err(RegistryError::ZeroPollInterval {
                        workflow_type: self.workflow_type.clone(),
                        step_name: spec.name.clone(),
                    });
                }
            }
        }

        let policies = std::iter::once(&self.retry_policy)
            .chain(self.steps.iter().filter_map(StepSpec::retry_policy));
        for policy in policies {
            policy
                .validate()
                .map_err(|source| RegistryError::InvalidRetryPolicy {
                    workflow_type: self.workflow_type.clone(),
                    source,
                })?;
        }

        Ok(WorkflowDefinition {
            workflow_type: self.workflow_type,
            steps: self.steps,
            retry_policy: self.retry_policy,
        })
    }
}

/// Registry of workflow definitions
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkflowRegistry::new();
/// registry.register(ship_order_definition()?)?;
/// let executor = WorkflowExecutor::new(store, Arc::new(registry), clock);
/// ```
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        let workflow_type = definition.workflow_type.clone();
        if self.definitions.contains_key(&workflow_type) {
            return Err(RegistryError::DuplicateWorkflowType(workflow_type));
        }
        self.definitions.insert(workflow_type, Arc::new(definition));
        Ok(())
    }

    /// Look up a definition
    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Registered workflow types, sorted
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::step::{step_fn, StepContext, StepError};
    use std::time::Duration;

    fn echo() -> impl Step {
        step_fn(|_: StepContext, input: Payload| async move { Ok::<_, StepError>(input) })
    }

    fn ship_order() -> WorkflowDefinition {
        WorkflowDefinition::builder("ship-order")
            .step("reserveInventory", echo())
            .step_with_retry("charge", echo(), RetryPolicy::fixed(Duration::from_secs(2), 4))
            .step("notify", echo())
            .retry_policy(RetryPolicy::exponential().with_max_attempts(3))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_definition() {
        let definition = ship_order();

        assert_eq!(definition.workflow_type(), "ship-order");
        assert_eq!(definition.len(), 3);
        let names: Vec<&str> = definition.steps().iter().map(StepSpec::name).collect();
        assert_eq!(names, vec!["reserveInventory", "charge", "notify"]);
    }

    #[test]
    fn test_retry_policy_override() {
        let definition = ship_order();

        assert_eq!(definition.retry_policy_for(0).max_attempts, 3);
        assert_eq!(definition.retry_policy_for(1).max_attempts, 4);
        assert_eq!(definition.retry_policy_for(2).max_attempts, 3);
    }

    #[test]
    fn test_empty_definition_rejected() {
        let result = WorkflowDefinition::builder("noop").build();
        assert!(matches!(result, Err(RegistryError::EmptyWorkflow(t)) if t == "noop"));
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let result = WorkflowDefinition::builder("twice")
            .step("a", echo())
            .step("a", echo())
            .build();
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateStepName { step_name, .. }) if step_name == "a"
        ));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let result = WorkflowDefinition::builder("bad-policy")
            .step_with_retry("a", echo(), RetryPolicy::exponential().with_max_attempts(0))
            .build();
        assert!(matches!(
            result,
            Err(RegistryError::InvalidRetryPolicy {
                source: RetryPolicyError::NoAttempts,
                ..
            })
        ));
    }

    #[test]
    fn test_wait_steps() {
        let definition = WorkflowDefinition::builder("approval")
            .step("request", echo())
            .sleep("cooldown", Duration::from_secs(60))
            .await_signal("approval", "approved", None)
            .await_condition("settled", echo(), Duration::from_secs(5), Some(Duration::from_secs(60)))
            .build()
            .unwrap();

        assert!(!definition.step(0).unwrap().kind().is_wait());
        assert!(matches!(
            definition.step(1).unwrap().kind(),
            StepKind::Sleep(d) if *d == Duration::from_secs(60)
        ));
        assert!(matches!(
            definition.step(2).unwrap().kind(),
            StepKind::Signal { name, timeout: None } if name == "approved"
        ));
        assert!(definition.step(3).unwrap().kind().is_wait());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = WorkflowDefinition::builder("busy")
            .await_condition("spin", echo(), Duration::ZERO, None)
            .build();
        assert!(matches!(
            result,
            Err(RegistryError::ZeroPollInterval { step_name, .. }) if step_name == "spin"
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register(ship_order()).unwrap();

        assert!(registry.contains("ship-order"));
        assert!(registry.get("ship-order").is_some());
        assert!(registry.get("refund").is_none());
        assert_eq!(registry.workflow_types(), vec!["ship-order"]);
    }

    #[test]
    fn test_duplicate_workflow_type_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register(ship_order()).unwrap();

        let result = registry.register(ship_order());
        assert!(matches!(result, Err(RegistryError::DuplicateWorkflowType(_))));
        assert_eq!(registry.len(), 1);
    }
}
