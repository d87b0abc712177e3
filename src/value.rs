//! Hierarchical state values
//!
//! A [`StateValue`] is the shape of a configuration: a bare string for an
//! atomic leaf of a compound state, or a map from region/child key to the
//! value below it. An atomic region of a parallel state renders as an empty
//! branch, so `{ edit: {}, validity: "valid" }` reads as "the `edit` region
//! is active (and has no substates), the `validity` region is in `valid`".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The value of a hierarchical/parallel configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Atomic leaf of a compound state.
    Leaf(String),
    /// Nested compound or parallel value, keyed by child/region name.
    Branch(BTreeMap<String, StateValue>),
}

impl StateValue {
    pub fn leaf(name: impl Into<String>) -> Self {
        StateValue::Leaf(name.into())
    }

    /// An empty branch: the value of an atomic region inside a parallel
    /// state.
    pub fn empty() -> Self {
        StateValue::Branch(BTreeMap::new())
    }

    pub fn branch<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        StateValue::Branch(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, StateValue::Leaf(_))
    }

    /// True iff every dot-separated segment of `path` appears on the
    /// configuration branch, in order.
    pub fn matches(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match current {
                StateValue::Leaf(name) => {
                    return name == segment && segments.peek().is_none();
                }
                StateValue::Branch(children) => match children.get(segment) {
                    Some(child) => current = child,
                    None => return false,
                },
            }
        }
        true
    }

    /// Depth-first enumeration of every ancestor path in the configuration:
    /// `"one"` yields `["one"]`; `{two: {deep: "foo"}}` yields
    /// `["two", "two.deep", "two.deep.foo"]`.
    pub fn to_strings(&self) -> Vec<String> {
        fn walk(value: &StateValue, prefix: Option<&str>, out: &mut Vec<String>) {
            match value {
                StateValue::Leaf(name) => {
                    out.push(join(prefix, name));
                }
                StateValue::Branch(children) => {
                    for (key, child) in children {
                        let path = join(prefix, key);
                        out.push(path.clone());
                        walk(child, Some(&path), out);
                    }
                }
            }
        }
        fn join(prefix: Option<&str>, key: &str) -> String {
            match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key.to_string(),
            }
        }
        let mut out = Vec::new();
        walk(self, None, &mut out);
        out
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Leaf(name) => f.write_str(name),
            StateValue::Branch(children) => {
                f.write_str("{")?;
                for (i, (key, child)) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {child}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(name: &str) -> Self {
        StateValue::Leaf(name.to_string())
    }
}

impl From<String> for StateValue {
    fn from(name: String) -> Self {
        StateValue::Leaf(name)
    }
}

impl From<BTreeMap<String, StateValue>> for StateValue {
    fn from(children: BTreeMap<String, StateValue>) -> Self {
        StateValue::Branch(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deep() -> StateValue {
        StateValue::branch([("two", StateValue::branch([("deep", "foo")]))])
    }

    #[test]
    fn matches_walks_the_branch_in_order() {
        let value = deep();
        assert!(value.matches("two"));
        assert!(value.matches("two.deep"));
        assert!(value.matches("two.deep.foo"));
        assert!(!value.matches("two.foo"));
        assert!(!value.matches("deep"));
        assert!(!value.matches("two.deep.foo.extra"));
    }

    #[test]
    fn matches_atomic_leaf() {
        let value = StateValue::leaf("one");
        assert!(value.matches("one"));
        assert!(!value.matches("one.two"));
        assert!(!value.matches("two"));
    }

    #[test]
    fn to_strings_enumerates_ancestor_chain() {
        assert_eq!(StateValue::leaf("one").to_strings(), vec!["one"]);
        assert_eq!(
            deep().to_strings(),
            vec!["two", "two.deep", "two.deep.foo"]
        );
    }

    #[test]
    fn parallel_regions_enumerate_depth_first() {
        let value = StateValue::branch([
            ("edit", StateValue::empty()),
            ("validity", StateValue::leaf("valid")),
        ]);
        assert_eq!(value.to_strings(), vec!["edit", "validity", "validity.valid"]);
        assert!(value.matches("validity.valid"));
        assert!(value.matches("edit"));
    }

    #[test]
    fn serializes_untagged() {
        let value = deep();
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({ "two": { "deep": "foo" } }));
        let back: StateValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }
}
