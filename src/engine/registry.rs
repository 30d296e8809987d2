//! Ordered, immutable catalog of the steps that make up each phase.
//!
//! Validation happens once at construction so the engine can rely on unique
//! names and on every required artifact having an earlier producer.
use super::context::StepContext;
use super::store::Artifacts;
use super::Phase;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Artifacts a successful step hands back to the engine for merging.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StepOutput {
    pub artifacts: Artifacts,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one artifact, serialized to JSON.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("serialize artifact `{key}`"))?;
        self.artifacts.insert(key.to_string(), value);
        Ok(self)
    }
}

/// The one capability every step variant implements.
pub trait StepAction: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput>;
}

struct FnAction<F>(F);

impl<F> StepAction for FnAction<F>
where
    F: Fn(&StepContext<'_>) -> Result<StepOutput> + Send + Sync,
{
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        (self.0)(ctx)
    }
}

pub struct Step {
    name: &'static str,
    phase: Phase,
    summary: &'static str,
    reboot_after: bool,
    retriable: bool,
    requires: Vec<&'static str>,
    produces: Vec<&'static str>,
    action: Box<dyn StepAction>,
}

impl Step {
    pub fn new(phase: Phase, name: &'static str, action: impl StepAction + 'static) -> Self {
        Self {
            name,
            phase,
            summary: "",
            reboot_after: false,
            retriable: true,
            requires: Vec::new(),
            produces: Vec::new(),
            action: Box::new(action),
        }
    }

    /// Build a step from a closure.
    pub fn from_fn<F>(phase: Phase, name: &'static str, action: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<StepOutput> + Send + Sync + 'static,
    {
        Self::new(phase, name, FnAction(action))
    }

    pub fn summary(mut self, summary: &'static str) -> Self {
        self.summary = summary;
        self
    }

    /// The host must reboot before the next step of the phase may run.
    pub fn reboot_after(mut self) -> Self {
        self.reboot_after = true;
        self
    }

    /// Re-running after a failure needs manual cleanup first.
    pub fn not_retriable(mut self) -> Self {
        self.retriable = false;
        self
    }

    pub fn requires(mut self, keys: &[&'static str]) -> Self {
        self.requires.extend_from_slice(keys);
        self
    }

    pub fn produces(mut self, keys: &[&'static str]) -> Self {
        self.produces.extend_from_slice(keys);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn requires_reboot_after(&self) -> bool {
        self.reboot_after
    }

    pub fn retriable(&self) -> bool {
        self.retriable
    }

    pub fn required_artifacts(&self) -> &[&'static str] {
        &self.requires
    }

    pub fn produced_artifacts(&self) -> &[&'static str] {
        &self.produces
    }

    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        self.action.execute(ctx)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("reboot_after", &self.reboot_after)
            .field("retriable", &self.retriable)
            .field("requires", &self.requires)
            .field("produces", &self.produces)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a step for `vmprep steps --json`.
#[derive(Debug, Serialize)]
pub struct StepInfo {
    pub index: usize,
    pub name: &'static str,
    pub phase: Phase,
    pub summary: &'static str,
    pub requires_reboot_after: bool,
    pub retriable: bool,
    pub requires: Vec<&'static str>,
    pub produces: Vec<&'static str>,
}

#[derive(Debug)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    /// Build a registry, rejecting duplicate names and unsatisfiable requirements.
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        for phase in Phase::ALL {
            let mut seen = BTreeSet::new();
            let mut produced = BTreeSet::new();
            for step in steps.iter().filter(|step| step.phase == phase) {
                if !seen.insert(step.name) {
                    return Err(anyhow!("duplicate step `{}` in {phase}", step.name));
                }
                if let Some(missing) = step.requires.iter().find(|key| !produced.contains(*key)) {
                    return Err(anyhow!(
                        "step `{}` of {phase} requires artifact `{missing}` \
                         that no earlier step produces",
                        step.name
                    ));
                }
                produced.extend(step.produces.iter().copied());
            }
        }
        Ok(Self { steps })
    }

    /// Steps of `phase` in execution order.
    pub fn steps_for(&self, phase: Phase) -> Vec<&Step> {
        self.steps.iter().filter(|step| step.phase == phase).collect()
    }

    /// Ordinal of a step within its phase.
    pub fn position(&self, phase: Phase, name: &str) -> Option<usize> {
        self.steps_for(phase)
            .iter()
            .position(|step| step.name == name)
    }

    pub fn describe(&self, phase: Phase) -> Vec<StepInfo> {
        self.steps_for(phase)
            .into_iter()
            .enumerate()
            .map(|(index, step)| StepInfo {
                index,
                name: step.name,
                phase: step.phase,
                summary: step.summary,
                requires_reboot_after: step.reboot_after,
                retriable: step.retriable,
                requires: step.requires.clone(),
                produces: step.produces.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(phase: Phase, name: &'static str) -> Step {
        Step::from_fn(phase, name, |_ctx| Ok(StepOutput::new()))
    }

    #[test]
    fn steps_for_preserves_declaration_order_per_phase() {
        let registry = StepRegistry::new(vec![
            noop(Phase::HostPrep, "a"),
            noop(Phase::VmCreate, "x"),
            noop(Phase::HostPrep, "b"),
        ])
        .expect("registry");
        let names: Vec<_> = registry
            .steps_for(Phase::HostPrep)
            .iter()
            .map(|step| step.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.position(Phase::VmCreate, "x"), Some(0));
        assert_eq!(registry.position(Phase::VmCreate, "a"), None);
    }

    #[test]
    fn duplicate_names_within_a_phase_are_rejected() {
        let err = StepRegistry::new(vec![
            noop(Phase::HostPrep, "a"),
            noop(Phase::HostPrep, "a"),
        ])
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate step `a`"));
    }

    #[test]
    fn same_name_in_different_phases_is_allowed() {
        StepRegistry::new(vec![noop(Phase::HostPrep, "a"), noop(Phase::VmCreate, "a")])
            .expect("registry");
    }

    #[test]
    fn requirement_must_be_produced_earlier_in_the_same_phase() {
        let err = StepRegistry::new(vec![
            noop(Phase::VmCreate, "use").requires(&["domain"]),
            noop(Phase::VmCreate, "make").produces(&["domain"]),
        ])
        .expect_err("unsatisfied");
        assert!(err.to_string().contains("requires artifact `domain`"));

        StepRegistry::new(vec![
            noop(Phase::VmCreate, "make").produces(&["domain"]),
            noop(Phase::VmCreate, "use").requires(&["domain"]),
        ])
        .expect("ordered registry");
    }

    #[test]
    fn step_output_serializes_values() {
        let output = StepOutput::new()
            .with("domain", "Windows_VM")
            .and_then(|output| output.with("cores", [1, 2]))
            .expect("output");
        assert_eq!(output.artifacts["domain"], "Windows_VM");
        assert_eq!(output.artifacts["cores"], serde_json::json!([1, 2]));
    }
}
