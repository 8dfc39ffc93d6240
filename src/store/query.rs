//! Queries over one collection: filters, ordering and limits

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::{Document, Record};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Neq,
    /// Greater than
    Gt,
    /// Greater than or equal to
    Gte,
    /// Less than
    Lt,
    /// Less than or equal to
    Lte,
    /// One of a list of values
    In,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
        };
        write!(f, "{}", s)
    }
}

/// Condition on one top-level field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    /// Field name
    pub field: String,
    /// Comparison operator
    pub operator: FilterOperator,
    /// Value compared against; an array for `In`
    pub value: Value,
}

impl Filter {
    /// Whether the document satisfies the condition.
    /// Documents without the field never match.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };

        match self.operator {
            FilterOperator::Eq => compare_values(actual, &self.value) == Some(Ordering::Equal),
            FilterOperator::Neq => compare_values(actual, &self.value) != Some(Ordering::Equal),
            FilterOperator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => self
                .value
                .as_array()
                .map(|candidates| {
                    candidates
                        .iter()
                        .any(|c| compare_values(actual, c) == Some(Ordering::Equal))
                })
                .unwrap_or(false),
        }
    }
}

/// A query over one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Collection name
    pub collection: String,
    /// Conditions, all of which must hold
    pub filters: Vec<Filter>,
    /// Optional ordering field and direction
    pub order_by: Option<(String, SortOrder)>,
    /// Optional maximum number of records
    pub limit: Option<usize>,
}

impl Query {
    /// Query every document of a collection, ordered by id
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Add a filter condition
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    fn condition<T: Into<Value>>(self, field: &str, operator: FilterOperator, value: T) -> Self {
        self.filter(Filter {
            field: field.to_string(),
            operator,
            value: value.into(),
        })
    }

    pub fn eq<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Eq, value)
    }

    pub fn neq<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Neq, value)
    }

    pub fn gt<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Gt, value)
    }

    pub fn gte<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Gte, value)
    }

    pub fn lt<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Lt, value)
    }

    pub fn lte<T: Into<Value>>(self, field: &str, value: T) -> Self {
        self.condition(field, FilterOperator::Lte, value)
    }

    pub fn in_values<T: Into<Value>>(self, field: &str, values: Vec<T>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.condition(field, FilterOperator::In, values)
    }

    /// Order results by a field; documents without it are left out
    pub fn order(mut self, field: &str, order: SortOrder) -> Self {
        self.order_by = Some((field.to_string(), order));
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Whether a document satisfies every filter
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, order and truncate a set of records
    pub fn apply<I>(&self, records: I) -> Vec<Record>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut matched: Vec<Record> = records
            .into_iter()
            .filter(|r| self.matches(&r.data))
            .collect();

        if let Some((field, order)) = &self.order_by {
            matched.retain(|r| r.data.contains_key(field));
            matched.sort_by(|a, b| {
                let ordering = compare_values(&a.data[field], &b.data[field])
                    .unwrap_or(Ordering::Equal);
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// PostgREST query-string encoding of the filters, order and limit
    pub(crate) fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|f| {
                let encoded = match (&f.operator, &f.value) {
                    (FilterOperator::In, Value::Array(items)) => {
                        let list: Vec<String> = items.iter().map(encode_list_item).collect();
                        format!("in.({})", list.join(","))
                    }
                    (op, value) => format!("{}.{}", op, encode_value(value)),
                };
                (f.field.clone(), encoded)
            })
            .collect();

        if let Some((field, order)) = &self.order_by {
            params.push(("order".to_string(), format!("{}.{}", field, order.as_str())));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_list_item(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => other.to_string(),
    }
}

/// Order two JSON scalars of the same kind; `None` when they are not comparable
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, data: Value) -> Record {
        Record {
            id: id.to_string(),
            version: 1,
            data: data.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn filters_compare_numbers_and_strings() {
        let doc = json!({ "userId": "u1", "points": 15 });
        let doc = doc.as_object().unwrap();

        assert!(Query::new("users").eq("userId", "u1").matches(doc));
        assert!(Query::new("users").gte("points", 15).lt("points", 20.5).matches(doc));
        assert!(!Query::new("users").gt("points", 15).matches(doc));
        assert!(Query::new("users").in_values("userId", vec!["u0", "u1"]).matches(doc));
        assert!(!Query::new("users").eq("missing", "x").matches(doc));
        assert!(!Query::new("users").eq("points", "15").matches(doc));
    }

    #[test]
    fn apply_orders_limits_and_drops_unordered_records() {
        let query = Query::new("donations")
            .order("createdAt", SortOrder::Descending)
            .limit(2);
        let result = query.apply(vec![
            record("a", json!({ "createdAt": "2024-01-01T00:00:00.000000Z" })),
            record("b", json!({ "createdAt": "2024-01-03T00:00:00.000000Z" })),
            record("c", json!({})),
            record("d", json!({ "createdAt": "2024-01-02T00:00:00.000000Z" })),
        ]);
        let ids: Vec<&str> = result.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn params_use_postgrest_syntax() {
        let params = Query::new("redeem_history")
            .eq("userId", "u1")
            .in_values("itemName", vec!["Book voucher"])
            .order("redeemedAt", SortOrder::Ascending)
            .limit(5)
            .to_params();

        assert_eq!(
            params,
            vec![
                ("userId".to_string(), "eq.u1".to_string()),
                ("itemName".to_string(), "in.(\"Book voucher\")".to_string()),
                ("order".to_string(), "redeemedAt.asc".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }
}
