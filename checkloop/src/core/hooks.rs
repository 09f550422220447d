//! Stop-hook registry consulted on every `validate` pass.
//!
//! The registry is owned by one engine instance, so independent sessions and
//! tests never observe each other's hooks.

use serde_json::Value;

use crate::core::types::{HookAction, HookDecision, ValidationResult};

/// Everything a hook may look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub task_id: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub agent_output: &'a str,
    pub validation_results: &'a [ValidationResult],
    pub completion_promises: &'a [String],
    pub consecutive_failures: u32,
    pub metadata: Option<&'a Value>,
}

/// A pure decision function.
pub trait StopHook {
    fn decide(&self, ctx: &HookContext<'_>) -> HookDecision;
}

impl<F> StopHook for F
where
    F: Fn(&HookContext<'_>) -> HookDecision,
{
    fn decide(&self, ctx: &HookContext<'_>) -> HookDecision {
        self(ctx)
    }
}

/// Which tasks a hook applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSelector {
    Any,
    Task(String),
    TaskPrefix(String),
}

impl HookSelector {
    pub fn matches(&self, task_id: &str) -> bool {
        match self {
            HookSelector::Any => true,
            HookSelector::Task(id) => id == task_id,
            HookSelector::TaskPrefix(prefix) => task_id.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

struct RegisteredHook {
    id: HookId,
    selector: HookSelector,
    hook: Box<dyn StopHook + Send + Sync>,
}

#[derive(Default)]
pub struct StopHookRegistry {
    hooks: Vec<RegisteredHook>,
    next_id: u64,
}

impl StopHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, selector: HookSelector, hook: H) -> HookId
    where
        H: StopHook + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = HookId(self.next_id);
        self.hooks.push(RegisteredHook {
            id,
            selector,
            hook: Box::new(hook),
        });
        id
    }

    /// Remove one hook. Returns false if the id was unknown.
    pub fn unregister(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|registered| registered.id != id);
        self.hooks.len() != before
    }

    pub fn clear_all(&mut self) {
        self.hooks.clear();
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run matching hooks in registration order.
    ///
    /// The first non-`continue` decision wins. If every hook continues, the last
    /// decision is returned so its `next_prompt` reaches the driver. `None` when no
    /// hook matches.
    pub fn evaluate(&self, ctx: &HookContext<'_>) -> Option<HookDecision> {
        let mut last = None;
        for registered in self
            .hooks
            .iter()
            .filter(|registered| registered.selector.matches(ctx.task_id))
        {
            let decision = registered.hook.decide(ctx);
            if decision.action != HookAction::Continue {
                return Some(decision);
            }
            last = Some(decision);
        }
        last
    }
}

impl std::fmt::Debug for StopHookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(task_id: &str) -> HookContext<'_> {
        HookContext {
            task_id,
            iteration: 1,
            max_iterations: 3,
            agent_output: "",
            validation_results: &[],
            completion_promises: &[],
            consecutive_failures: 0,
            metadata: None,
        }
    }

    #[test]
    fn empty_registry_yields_no_decision() {
        let registry = StopHookRegistry::new();
        assert_eq!(registry.evaluate(&ctx("t")), None);
    }

    #[test]
    fn first_non_continue_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = StopHookRegistry::new();
        registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::continue_with("first")
        });
        registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::blocked("second")
        });
        registry.register(HookSelector::Any, move |_: &HookContext<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            HookDecision::complete("third")
        });

        let decision = registry.evaluate(&ctx("t")).expect("decision");
        assert_eq!(decision.action, HookAction::Blocked);
        assert_eq!(decision.reason, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn all_continue_returns_last_decision_with_prompt() {
        let mut registry = StopHookRegistry::new();
        registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::continue_with("a").with_next_prompt("first prompt")
        });
        registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::continue_with("b").with_next_prompt("second prompt")
        });

        let decision = registry.evaluate(&ctx("t")).expect("decision");
        assert_eq!(decision.next_prompt.as_deref(), Some("second prompt"));
    }

    #[test]
    fn selectors_filter_hooks_by_task() {
        let mut registry = StopHookRegistry::new();
        registry.register(HookSelector::Task("other".to_string()), |_: &HookContext<'_>| {
            HookDecision::blocked("not mine")
        });
        registry.register(
            HookSelector::TaskPrefix("feat-".to_string()),
            |_: &HookContext<'_>| HookDecision::complete("prefix"),
        );

        assert_eq!(registry.evaluate(&ctx("bug-1")), None);
        let decision = registry.evaluate(&ctx("feat-1")).expect("decision");
        assert_eq!(decision.reason, "prefix");
    }

    #[test]
    fn unregister_and_clear_all() {
        let mut registry = StopHookRegistry::new();
        let id = registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::blocked("x")
        });
        registry.register(HookSelector::Any, |_: &HookContext<'_>| {
            HookDecision::blocked("y")
        });
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.len(), 1);
        registry.clear_all();
        assert!(registry.is_empty());
    }
}
