use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::Chars;

use serde_json::Value;

use crate::Document;

/// Field holding the store-assigned document id.
pub const ID_FIELD: &str = "id";

/// Whether `id` has the shape of a store-assigned id.
pub fn is_valid_id(id: &str) -> bool {
    uuid::Uuid::try_parse(id).is_ok()
}

/// Field sorted on when a listing names no sort key.
pub const DEFAULT_SORT_FIELD: &str = "createdAt";

/// A predicate over documents, evaluated by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Matches the document with this id.
    Id(String),
    /// Matches documents whose id is one of these.
    IdIn(Vec<String>),
    /// Matches documents whose field equals the value.
    Eq(String, Value),
    /// Matches documents whose field contains (or equals) any of the values.
    ContainsAny(String, Vec<String>),
    /// Inverts the inner filter.
    Not(Box<Filter>),
    /// Matches documents satisfying every inner filter.
    And(Vec<Filter>),
}

impl Filter {
    /// Intersects two filters, flattening nested conjunctions.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) | (f, Filter::And(mut a)) => {
                a.push(f);
                Filter::And(a)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => doc.get(ID_FIELD).and_then(Value::as_str) == Some(id.as_str()),
            Filter::IdIn(ids) => doc
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .map(|id| ids.iter().any(|candidate| candidate == id))
                .unwrap_or(false),
            Filter::Eq(field, expected) => field_equals(doc.get(field), expected),
            Filter::ContainsAny(field, values) => match doc.get(field) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|item| values.iter().any(|v| v == item)),
                Some(Value::String(s)) => values.iter().any(|v| v == s),
                _ => false,
            },
            Filter::Not(inner) => !inner.matches(doc),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

// Query strings carry no type information, so a string also matches a number or
// boolean with the same textual form.
fn field_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(actual) if actual == expected => true,
        Some(actual @ (Value::Number(_) | Value::Bool(_))) => {
            matches!(expected, Value::String(s) if *s == actual.to_string())
        }
        _ => false,
    }
}

/// Single-key ordering for listings, written as `field`, `field:1` or `field:-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: DEFAULT_SORT_FIELD.to_string(),
            descending: true,
        }
    }
}

impl SortSpec {
    pub fn parse(spec: &str) -> Self {
        let (field, direction) = match spec.split_once(':') {
            Some((field, direction)) => (field.trim(), direction.trim()),
            None => (spec.trim(), "1"),
        };
        if field.is_empty() {
            return Self::default();
        }
        Self {
            field: field.to_string(),
            descending: direction == "-1",
        }
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ord = compare_values(a.get(&self.field), b.get(&self.field));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Orders two field values: missing < numbers < strings < objects < arrays < booleans.
/// Strings compare with numeric collation, so `"2"` sorts before `"10"`.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => natural_cmp(x, y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ (Value::Object(_) | Value::Array(_))), Some(y @ (Value::Object(_) | Value::Array(_))))
            if type_rank(a) == type_rank(b) =>
        {
            x.to_string().cmp(&y.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compares strings treating each run of ASCII digits as a number.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let ord = cmp_digit_runs(&take_digits(&mut left), &take_digits(&mut right));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn cmp_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_sort_parse() {
        assert_eq!(SortSpec::parse("title"), SortSpec { field: "title".into(), descending: false });
        assert_eq!(SortSpec::parse("updatedAt:-1"), SortSpec { field: "updatedAt".into(), descending: true });
        assert_eq!(SortSpec::parse("title:1"), SortSpec { field: "title".into(), descending: false });
        assert_eq!(SortSpec::parse(""), SortSpec::default());
    }

    #[test]
    fn test_numeric_collation() {
        let mut docs = vec![doc(json!({"n": "2"})), doc(json!({"n": "10"})), doc(json!({"n": "1"}))];
        let spec = SortSpec::parse("n");
        docs.sort_by(|a, b| spec.compare(a, b));
        let order: Vec<&str> = docs.iter().map(|d| d["n"].as_str().unwrap()).collect();
        assert_eq!(order, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_natural_cmp_mixed_text() {
        assert_eq!(natural_cmp("item9", "item10"), Ordering::Less);
        assert_eq!(natural_cmp("Apple", "banana"), Ordering::Less);
        assert_eq!(natural_cmp("v007", "v7"), Ordering::Less);
    }

    #[test]
    fn test_missing_field_sorts_first() {
        assert_eq!(compare_values(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(3)), Some(&json!("1"))), Ordering::Less);
    }

    #[test]
    fn test_contains_any() {
        let d = doc(json!({"aclRead": ["u1", "u2"]}));
        assert!(Filter::ContainsAny("aclRead".into(), vec!["u2".into(), "all".into()]).matches(&d));
        assert!(!Filter::ContainsAny("aclRead".into(), vec!["u3".into(), "all".into()]).matches(&d));
        assert!(!Filter::ContainsAny("aclWrite".into(), vec!["u1".into()]).matches(&d));
    }

    #[test]
    fn test_query_string_matches_number() {
        let d = doc(json!({"threshold": 10, "tag": "short"}));
        assert!(Filter::Eq("threshold".into(), json!("10")).matches(&d));
        assert!(Filter::Eq("tag".into(), json!("short")).matches(&d));
        assert!(!Filter::Eq("tag".into(), json!("long")).matches(&d));
    }

    #[test]
    fn test_id_shape() {
        assert!(is_valid_id(&uuid::Uuid::new_v4().simple().to_string()));
        assert!(!is_valid_id("507f1f77bcf86cd799439011"));
        assert!(!is_valid_id(""));
    }

    #[test]
    fn test_and_flattens() {
        let f = Filter::All.and(Filter::Id("a".into())).and(Filter::Eq("x".into(), json!(1)));
        assert_eq!(f, Filter::And(vec![Filter::Id("a".into()), Filter::Eq("x".into(), json!(1))]));
        let d = doc(json!({"id": "a", "x": 1}));
        assert!(f.matches(&d));
        assert!(!Filter::Not(Box::new(f)).matches(&d));
    }
}
