//! Stage-scoped argument resolution.

use std::collections::BTreeMap;

/// The scope prefix used for stage-scoped run arguments.
pub const STAGE_SCOPE: &str = "flowlet";

/// Resolve the arguments visible to the given stage.
///
/// Precedence, lowest to highest: the stage's declared arguments, unscoped run arguments, and
/// run arguments scoped as `flowlet.{stage}.{key}`. Arguments scoped to any other stage are
/// not visible.
pub fn resolve_stage_args(stage: &str, declared: &BTreeMap<String, String>, run_args: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let scope_prefix = format!("{}.", STAGE_SCOPE);
    let stage_prefix = format!("{}{}.", scope_prefix, stage);
    let mut resolved = declared.clone();
    resolved.extend(
        run_args
            .iter()
            .filter(|(key, _)| !key.starts_with(&scope_prefix))
            .map(|(key, val)| (key.clone(), val.clone())),
    );
    resolved.extend(run_args.iter().filter_map(|(key, val)| {
        key.strip_prefix(&stage_prefix)
            .filter(|key| !key.is_empty())
            .map(|key| (key.to_string(), val.clone()))
    }));
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(items: &[(&str, &str)]) -> BTreeMap<String, String> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn scoped_args_override_unscoped_and_declared() {
        let declared = map(&[("batch", "10"), ("mode", "fast")]);
        let run_args = map(&[("batch", "20"), ("flowlet.parser.batch", "50"), ("flowlet.writer.batch", "99"), ("region", "us")]);

        let resolved = resolve_stage_args("parser", &declared, &run_args);

        assert_eq!(resolved, map(&[("batch", "50"), ("mode", "fast"), ("region", "us")]));
    }

    #[test]
    fn other_stage_scopes_are_not_visible() {
        let run_args = map(&[("flowlet.writer.batch", "99"), ("flowlet.parsers.x", "1")]);

        let resolved = resolve_stage_args("parser", &BTreeMap::new(), &run_args);

        assert!(resolved.is_empty(), "expected no visible args, got {:?}", resolved);
    }
}
