use super::Error;
use crate::jvm::Name;
use crate::patch::{MethodSignature, PatchStrategy};
use std::cmp::Reverse;

/// Strategy to apply to one method
#[derive(Debug, Clone)]
pub struct PatchRule {
    /// Human readable summary, for logs
    pub description: String,
    pub target: MethodSignature,
    pub strategy: PatchStrategy,

    /// Rules with higher priority are applied first
    pub priority: i32,
}

impl PatchRule {
    pub fn new(
        description: impl Into<String>,
        target: MethodSignature,
        strategy: impl Into<PatchStrategy>,
        priority: i32,
    ) -> PatchRule {
        PatchRule {
            description: description.into(),
            target,
            strategy: strategy.into(),
            priority,
        }
    }
}

/// Rules ordered by descending priority (ties keep registration order)
///
/// The table is immutable once built, so it can be shared freely between threads transforming
/// different classes.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<PatchRule>,
}

impl RuleTable {
    pub fn new(mut rules: Vec<PatchRule>) -> RuleTable {
        rules.sort_by_key(|rule| Reverse(rule.priority));
        RuleTable { rules }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchRule> + '_ {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules targeting methods of a class (given by binary name)
    pub fn for_class<'a>(&'a self, class_name: &'a str) -> impl Iterator<Item = &'a PatchRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.target.owner.as_str() == class_name)
    }
}

/// What happened with one rule while transforming a class
#[derive(Debug)]
pub enum RuleOutcome {
    /// The class has no method with the target signature
    NoMatch,

    /// The method was found, but the rule left it as it was
    Unchanged,

    Applied,

    /// The rule failed and the class was rolled back to before it
    Failed(Error),
}

impl RuleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RuleOutcome::Applied)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::patch::script::Stmt;
    use crate::patch::Replacement;

    fn rule(description: &str, target: &str, priority: i32) -> PatchRule {
        PatchRule::new(
            description,
            target.parse().unwrap(),
            Replacement {
                descriptor: "()V".to_owned(),
                body: vec![Stmt::Return(None)],
            },
            priority,
        )
    }

    #[test]
    fn sorted_by_descending_priority() {
        let table = RuleTable::new(vec![
            rule("a", "p/A.run()V", 0),
            rule("b", "p/A.stop()V", 10),
            rule("c", "p/B.run()V", 0),
            rule("d", "p/A.go()V", 10),
        ]);
        let order: Vec<&str> = table.iter().map(|rule| rule.description.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
        assert_eq!(table.len(), 4);

        let for_a: Vec<&str> = table
            .for_class("p/A")
            .map(|rule| rule.description.as_str())
            .collect();
        assert_eq!(for_a, vec!["b", "d", "a"]);
        assert_eq!(table.for_class("p/C").count(), 0);
    }
}
