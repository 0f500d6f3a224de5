//! Field-level three-way merge over [`FieldMap`]s.

use super::policy::FieldRule;
use pawsync_protocol::{FieldMap, FieldValue};

/// Which side wins an overlapping scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tiebreak {
    Local,
    Server,
}

/// Fields both sides changed to different values.
///
/// Without a base every differing field counts as changed on both sides.
pub(crate) fn conflicting_fields(
    base: Option<&FieldMap>,
    local: &FieldMap,
    server: &FieldMap,
) -> Vec<String> {
    let mut names: Vec<&String> = local.keys().chain(server.keys()).collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .filter(|name| {
            let l = local.get(*name);
            let s = server.get(*name);
            if l == s {
                return false;
            }
            match base {
                None => true,
                Some(base) => {
                    let b = base.get(*name);
                    l != b && s != b
                }
            }
        })
        .cloned()
        .collect()
}

/// Merges `local` and `server` against `base`.
///
/// A field changed on one side only takes that side's value. A field changed
/// on both sides is unioned when both values are lists, otherwise settled by
/// the field rule or `tiebreak`.
pub(crate) fn merge_fields(
    base: Option<&FieldMap>,
    local: &FieldMap,
    server: &FieldMap,
    tiebreak: Tiebreak,
    rule_for: impl Fn(&str) -> Option<FieldRule>,
) -> FieldMap {
    let mut merged = FieldMap::new();
    let mut names: Vec<&String> = local.keys().chain(server.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let l = local.get(name);
        let s = server.get(name);
        let b = base.and_then(|b| b.get(name));

        let value = if l == s {
            l.cloned()
        } else if base.is_some() && s == b {
            l.cloned()
        } else if base.is_some() && l == b {
            s.cloned()
        } else {
            match (l, s) {
                (Some(FieldValue::Array(lv)), Some(FieldValue::Array(sv))) => {
                    Some(FieldValue::Array(union(sv, lv)))
                }
                _ => match (rule_for(name), tiebreak) {
                    (Some(FieldRule::LocalWins), _) => l.cloned(),
                    (Some(FieldRule::ServerWins), _) => s.cloned(),
                    (_, Tiebreak::Local) => l.cloned(),
                    (_, Tiebreak::Server) => s.cloned(),
                },
            }
        };

        if let Some(value) = value {
            merged.insert(name.clone(), value);
        }
    }
    merged
}

fn union(first: &[FieldValue], second: &[FieldValue]) -> Vec<FieldValue> {
    let mut out = first.to_vec();
    for v in second {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    fn list(items: &[&str]) -> FieldValue {
        FieldValue::Array(items.iter().map(|s| text(s)).collect())
    }

    #[test]
    fn one_sided_changes_are_kept() {
        let base = map(&[("a", text("0")), ("b", text("0"))]);
        let local = map(&[("a", text("L")), ("b", text("0"))]);
        let server = map(&[("a", text("0")), ("b", text("S"))]);

        assert!(conflicting_fields(Some(&base), &local, &server).is_empty());
        let merged = merge_fields(Some(&base), &local, &server, Tiebreak::Server, |_| None);
        assert_eq!(merged, map(&[("a", text("L")), ("b", text("S"))]));
    }

    #[test]
    fn overlapping_lists_union_and_scalars_use_tiebreak() {
        let base = map(&[("tags", list(&["x"])), ("n", text("0"))]);
        let local = map(&[("tags", list(&["x", "l"])), ("n", text("L"))]);
        let server = map(&[("tags", list(&["x", "s"])), ("n", text("S"))]);

        assert_eq!(
            conflicting_fields(Some(&base), &local, &server),
            vec!["n".to_string(), "tags".to_string()]
        );
        let merged = merge_fields(Some(&base), &local, &server, Tiebreak::Local, |_| None);
        assert_eq!(merged["tags"], list(&["x", "s", "l"]));
        assert_eq!(merged["n"], text("L"));

        let ruled = merge_fields(Some(&base), &local, &server, Tiebreak::Local, |f| {
            (f == "n").then_some(FieldRule::ServerWins)
        });
        assert_eq!(ruled["n"], text("S"));
    }

    #[test]
    fn no_base_means_every_difference_conflicts() {
        let local = map(&[("a", text("L")), ("b", text("same"))]);
        let server = map(&[("a", text("S")), ("b", text("same"))]);
        assert_eq!(conflicting_fields(None, &local, &server), vec!["a".to_string()]);
    }
}
