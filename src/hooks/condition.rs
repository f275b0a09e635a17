//! Activation conditions of hooks (the `when` object of a hook descriptor).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;

/// A regular expression that must match its whole input.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", source))
            .with_context(|| format!("invalid regular expression '{}'", source))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always(bool),
    /// Every `(key, value)` pair must be matched by one annotation.
    Annotations(Vec<(Pattern, Pattern)>),
    /// Any pattern must match the first argument of the container command.
    Commands(Vec<Pattern>),
    HasBindMounts(bool),
}

/// What a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub annotations: &'a BTreeMap<String, String>,
    pub argv0: Option<&'a str>,
    pub has_bind_mounts: bool,
}

impl Condition {
    pub fn matches(&self, context: &ConditionContext) -> bool {
        match self {
            Condition::Always(value) => *value,
            Condition::Annotations(pairs) => pairs.iter().all(|(key, value)| {
                context
                    .annotations
                    .iter()
                    .any(|(k, v)| key.is_match(k) && value.is_match(v))
            }),
            Condition::Commands(patterns) => context
                .argv0
                .map_or(false, |argv0| patterns.iter().any(|p| p.is_match(argv0))),
            Condition::HasBindMounts(value) => *value == context.has_bind_mounts,
        }
    }
}

/// A hook is active only when all of its conditions hold.
pub fn all_match(conditions: &[Condition], context: &ConditionContext) -> bool {
    conditions.iter().all(|c| c.matches(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn context(annotations: &BTreeMap<String, String>) -> ConditionContext {
        ConditionContext {
            annotations,
            argv0: Some("/usr/bin/mpirun"),
            has_bind_mounts: false,
        }
    }

    fn annotation_condition(pairs: &[(&str, &str)]) -> Condition {
        Condition::Annotations(
            pairs
                .iter()
                .map(|(k, v)| (Pattern::new(k).unwrap(), Pattern::new(v).unwrap()))
                .collect(),
        )
    }

    #[test]
    fn test_always() {
        let empty = BTreeMap::new();
        assert!(Condition::Always(true).matches(&context(&empty)));
        assert!(!Condition::Always(false).matches(&context(&empty)));
    }

    #[test]
    fn test_annotations_single_pair() {
        let condition = annotation_condition(&[("^com.hooks.mpi.enabled$", "^true$")]);
        let on = annotations(&[("com.hooks.mpi.enabled", "true")]);
        let off = annotations(&[("com.hooks.mpi.enabled", "false")]);
        let missing = annotations(&[("com.hooks.glibc.enabled", "true")]);
        assert!(condition.matches(&context(&on)));
        assert!(!condition.matches(&context(&off)));
        assert!(!condition.matches(&context(&missing)));
    }

    #[test]
    fn test_annotations_are_anchored() {
        let condition = annotation_condition(&[("com.hooks.mpi.type", "mpich")]);
        let prefixed = annotations(&[("com.hooks.mpi.type", "mpich-abi")]);
        let exact = annotations(&[("com.hooks.mpi.type", "mpich")]);
        assert!(!condition.matches(&context(&prefixed)));
        assert!(condition.matches(&context(&exact)));
    }

    #[test]
    fn test_annotations_all_pairs_required() {
        let condition = annotation_condition(&[
            ("com.hooks.mpi.enabled", "true"),
            ("com.hooks.mpi.type", "mpich|openmpi"),
        ]);
        let both = annotations(&[
            ("com.hooks.mpi.enabled", "true"),
            ("com.hooks.mpi.type", "openmpi"),
        ]);
        let one = annotations(&[("com.hooks.mpi.enabled", "true")]);
        assert!(condition.matches(&context(&both)));
        assert!(!condition.matches(&context(&one)));
    }

    #[test]
    fn test_annotations_key_regex() {
        let condition = annotation_condition(&[("com\\.hooks\\..*\\.enabled", "true")]);
        let any = annotations(&[("com.hooks.ssh.enabled", "true")]);
        assert!(condition.matches(&context(&any)));
    }

    #[test]
    fn test_commands() {
        let empty = BTreeMap::new();
        let condition = Condition::Commands(vec![
            Pattern::new(".*/mpirun").unwrap(),
            Pattern::new("srun").unwrap(),
        ]);
        assert!(condition.matches(&context(&empty)));

        let no_command = ConditionContext {
            argv0: None,
            ..context(&empty)
        };
        assert!(!condition.matches(&no_command));

        let other = ConditionContext {
            argv0: Some("/usr/bin/mpirun-wrapper"),
            ..context(&empty)
        };
        assert!(!condition.matches(&other));
    }

    #[test]
    fn test_has_bind_mounts() {
        let empty = BTreeMap::new();
        let with_mounts = ConditionContext {
            has_bind_mounts: true,
            ..context(&empty)
        };
        assert!(Condition::HasBindMounts(true).matches(&with_mounts));
        assert!(!Condition::HasBindMounts(true).matches(&context(&empty)));
        assert!(Condition::HasBindMounts(false).matches(&context(&empty)));
    }

    #[test]
    fn test_all_match() {
        let on = annotations(&[("com.hooks.ssh.enabled", "true")]);
        let conditions = vec![
            Condition::Always(true),
            annotation_condition(&[("com.hooks.ssh.enabled", "true")]),
        ];
        assert!(all_match(&conditions, &context(&on)));
        assert!(!all_match(&conditions, &context(&BTreeMap::new())));
        assert!(all_match(&[], &context(&on)));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Pattern::new("(unclosed").is_err());
    }
}
