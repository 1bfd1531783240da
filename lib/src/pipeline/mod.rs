//! Class-level driver: decide which rules apply to a class, apply them, and fall back to the
//! original bytes whenever anything goes wrong
//!
//! The [`Transformer`] never fails outright. A class it cannot parse, a rule whose strategy
//! refuses the method, or a patched class that cannot be serialized all end up with the best
//! bytes available (the input, or the class as it was after the last successful rule) and a log
//! line explaining why.

pub mod builtin;
mod errors;
mod rule;
mod settings;

pub use errors::*;
pub use rule::*;
pub use settings::*;

use crate::jvm::class_file::ClassFile;
use crate::patch::{patch_class, MethodPatch};

/// Outcome of one rule against one class
#[derive(Debug)]
pub struct RuleReport {
    pub description: String,
    pub target: String,
    pub outcome: RuleOutcome,
}

/// Output of [`Transformer::transform_with_report`]
#[derive(Debug)]
pub struct Transformed {
    pub bytes: Vec<u8>,

    /// One entry per rule targeting the class, in application order
    pub outcomes: Vec<RuleReport>,

    /// Set when the whole class was passed through untouched
    pub rejected: Option<Error>,
}

impl Transformed {
    fn untouched(bytes: &[u8], rejected: Option<Error>) -> Transformed {
        Transformed {
            bytes: bytes.to_vec(),
            outcomes: vec![],
            rejected,
        }
    }

    /// Whether any rule changed the class
    pub fn changed(&self) -> bool {
        self.outcomes.iter().any(|report| report.outcome.is_applied())
    }
}

/// Applies a table of rules to class images
///
/// A transformer is immutable and holds no per-class state, so one instance can transform many
/// classes concurrently.
#[derive(Debug, Clone)]
pub struct Transformer {
    rules: RuleTable,
    settings: Settings,
}

impl Transformer {
    pub fn new(rules: Vec<PatchRule>, settings: Settings) -> Transformer {
        Transformer {
            rules: RuleTable::new(rules),
            settings,
        }
    }

    /// Transformer preloaded with [`builtin::rules`]
    pub fn with_builtin_rules(settings: Settings) -> Transformer {
        Transformer::new(builtin::rules(), settings)
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Transform a class, given its name (dotted or binary) and its bytes
    pub fn transform(&self, class_name: &str, bytes: &[u8]) -> Vec<u8> {
        self.transform_with_report(class_name, bytes).bytes
    }

    pub fn transform_with_report(&self, class_name: &str, bytes: &[u8]) -> Transformed {
        let binary_name = class_name.replace('.', "/");
        if self.rules.for_class(&binary_name).next().is_none() {
            log::trace!("no rules for {}", binary_name);
            return Transformed::untouched(bytes, None);
        }

        let mut class = match ClassFile::parse(bytes) {
            Ok(class) => class,
            Err(err) => {
                log::error!("could not parse {}: {:?}", binary_name, err);
                return Transformed::untouched(bytes, Some(Error::MalformedInput(err)));
            }
        };
        match class.name() {
            Ok(name) if name == binary_name => (),
            Ok(name) if self.settings.strict_class_name => {
                log::warn!(
                    "{} was supplied as {}, passing it through",
                    name,
                    binary_name
                );
                return Transformed::untouched(bytes, None);
            }
            Ok(name) => log::warn!("{} was supplied as {}", name, binary_name),
            Err(err) => {
                log::error!("could not read the name of {}: {:?}", binary_name, err);
                return Transformed::untouched(bytes, Some(Error::MalformedInput(err)));
            }
        }

        let mut last_good: Vec<u8> = bytes.to_vec();
        let mut outcomes = vec![];
        for rule in self.rules.for_class(&binary_name) {
            let outcome = self.apply_rule(rule, &mut class, &mut last_good);
            match &outcome {
                RuleOutcome::NoMatch => {
                    log::debug!("{}: {} not found", rule.description, rule.target)
                }
                RuleOutcome::Unchanged => log::debug!("{}: nothing to do", rule.description),
                RuleOutcome::Applied => log::info!(
                    "{}: patched {} ({})",
                    rule.description,
                    rule.target,
                    rule.strategy.kind()
                ),
                RuleOutcome::Failed(err) => log::error!(
                    "{}: failed to patch {}, keeping the method as it was: {:?}",
                    rule.description,
                    rule.target,
                    err
                ),
            }
            outcomes.push(RuleReport {
                description: rule.description.clone(),
                target: rule.target.to_string(),
                outcome,
            });
        }

        if self.settings.log_sizes {
            log::debug!(
                "{}: {} bytes in, {} bytes out",
                binary_name,
                bytes.len(),
                last_good.len()
            );
        }
        Transformed {
            bytes: last_good,
            outcomes,
            rejected: None,
        }
    }

    /// Apply one rule, rolling the class back to its previous state unless the rule succeeds
    fn apply_rule(
        &self,
        rule: &PatchRule,
        class: &mut ClassFile,
        last_good: &mut Vec<u8>,
    ) -> RuleOutcome {
        let snapshot = class.clone();
        let result = patch_class(
            class,
            &rule.target,
            &rule.strategy,
            self.settings.max_code_length,
        );
        match result {
            Ok(MethodPatch::NotFound) => {
                *class = snapshot;
                RuleOutcome::NoMatch
            }
            Ok(MethodPatch::Unchanged) => {
                *class = snapshot;
                RuleOutcome::Unchanged
            }
            Ok(MethodPatch::Applied { .. }) => match class.to_bytes() {
                Ok(bytes) => {
                    *last_good = bytes;
                    RuleOutcome::Applied
                }
                Err(err) => {
                    *class = snapshot;
                    RuleOutcome::Failed(Error::SerializationFailure(err))
                }
            },
            Err(err) => {
                *class = snapshot;
                RuleOutcome::Failed(Error::Patch(err))
            }
        }
    }
}
