/// Query engine for delta-cache.
///
/// Queries filter, project, sort, page and aggregate entities. Every adapter
/// evaluates them in-process after a full collection scan, and the network rack
/// encodes them as URL query parameters for the backend:
///
/// - `query`: JSON array of filters (AND-ed)
/// - `fields`: comma-separated projection
/// - `sort`: JSON array of sort specifications
/// - `skip` / `limit`: paging
///
/// # Example
///
/// ```ignore
/// use delta_cache::query::{Query, Filter};
///
/// let query = Query::new()
///     .filter(Filter::gt("pages", 300))
///     .project(&["title", "author"])
///     .sort_by("title", true)
///     .limit(10);
///
/// let books = client.collection("books")?.find(query).await?;
/// ```
use crate::entity::{Entity, ID_FIELD};
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;

/// A filter condition for querying data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value.
    Eq { field: String, value: JsonValue },
    /// Field not equals value.
    Ne { field: String, value: JsonValue },
    /// Field greater than value.
    Gt { field: String, value: JsonValue },
    /// Field greater than or equal to value.
    Gte { field: String, value: JsonValue },
    /// Field less than value.
    Lt { field: String, value: JsonValue },
    /// Field less than or equal to value.
    Lte { field: String, value: JsonValue },
    /// Field value is one of the listed values.
    In { field: String, values: Vec<JsonValue> },
    /// Field contains substring (for strings) or element (for arrays).
    Contains { field: String, value: JsonValue },
    /// Field exists (is not null/missing).
    Exists { field: String },
    /// Field matches regex pattern (for strings).
    Matches { field: String, pattern: String },
    /// Logical AND of multiple filters.
    And(Vec<Filter>),
    /// Logical OR of multiple filters.
    Or(Vec<Filter>),
    /// Logical NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a not-equals filter.
    pub fn ne(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than-or-equal filter.
    pub fn gte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than-or-equal filter.
    pub fn lte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a containment filter over a list of candidate values.
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Match any of the given entity ids.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::is_in(ID_FIELD, ids.into_iter().map(|id| JsonValue::String(id.into())))
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create an exists filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    /// Create a regex match filter.
    pub fn matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Combine filters with AND.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Combine filters with OR.
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Negate a filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Evaluate this filter against a JSON value.
    pub fn matches_value(&self, value: &JsonValue) -> bool {
        match self {
            Filter::Eq {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| &v == expected),
            Filter::Ne {
                field,
                value: expected,
            } => get_field(value, field).is_none_or(|v| &v != expected),
            Filter::Gt {
                field,
                value: expected,
            } => get_field(value, field)
                .is_some_and(|v| compare_json(&v, expected) == Some(Ordering::Greater)),
            Filter::Gte {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| {
                matches!(
                    compare_json(&v, expected),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Filter::Lt {
                field,
                value: expected,
            } => get_field(value, field)
                .is_some_and(|v| compare_json(&v, expected) == Some(Ordering::Less)),
            Filter::Lte {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| {
                matches!(
                    compare_json(&v, expected),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }),
            Filter::In { field, values } => {
                get_field(value, field).is_some_and(|v| values.contains(&v))
            }
            Filter::Contains {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| json_contains(&v, expected)),
            Filter::Exists { field } => get_field(value, field).is_some_and(|v| !v.is_null()),
            Filter::Matches { field, pattern } => get_field(value, field).is_some_and(|v| {
                if let Some(s) = v.as_str() {
                    regex::Regex::new(pattern).is_ok_and(|re| re.is_match(s))
                } else {
                    false
                }
            }),
            Filter::And(filters) => filters.iter().all(|f| f.matches_value(value)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches_value(value)),
            Filter::Not(filter) => !filter.matches_value(value),
        }
    }
}

/// Aggregation operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Count of matching records.
    Count,
    /// Sum of a numeric field.
    Sum { field: String },
    /// Average of a numeric field.
    Avg { field: String },
    /// Minimum value of a field.
    Min { field: String },
    /// Maximum value of a field.
    Max { field: String },
    /// Collect unique values of a field.
    Distinct { field: String },
    /// Group by a field and apply sub-aggregations.
    GroupBy {
        field: String,
        aggregations: Vec<(String, Aggregation)>,
    },
}

impl Aggregation {
    /// Create a count aggregation.
    pub fn count() -> Self {
        Self::Count
    }

    /// Create a sum aggregation.
    pub fn sum(field: impl Into<String>) -> Self {
        Self::Sum {
            field: field.into(),
        }
    }

    /// Create an average aggregation.
    pub fn avg(field: impl Into<String>) -> Self {
        Self::Avg {
            field: field.into(),
        }
    }

    /// Create a minimum aggregation.
    pub fn min(field: impl Into<String>) -> Self {
        Self::Min {
            field: field.into(),
        }
    }

    /// Create a maximum aggregation.
    pub fn max(field: impl Into<String>) -> Self {
        Self::Max {
            field: field.into(),
        }
    }

    /// Create a distinct values aggregation.
    pub fn distinct(field: impl Into<String>) -> Self {
        Self::Distinct {
            field: field.into(),
        }
    }

    /// Group by `field`, computing each named sub-aggregation per group.
    pub fn group_by(field: impl Into<String>, aggregations: Vec<(String, Aggregation)>) -> Self {
        Self::GroupBy {
            field: field.into(),
            aggregations,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending order (smallest first).
    Asc,
    /// Descending order (largest first).
    Desc,
}

/// Sort specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    /// Field to sort by.
    pub field: String,
    /// Sort order.
    pub order: SortOrder,
}

impl SortBy {
    /// Create a new sort specification.
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }

    /// Sort ascending.
    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Asc)
    }

    /// Sort descending.
    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Desc)
    }
}

/// A query against a collection.
///
/// Queries can filter, project, sort, and page results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter conditions.
    pub filters: Vec<Filter>,
    /// Fields to project (empty = all fields).
    pub projection: Vec<String>,
    /// Sort specifications.
    pub sort: Vec<SortBy>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of results to skip.
    pub offset: Option<usize>,
    /// Aggregation to perform.
    pub aggregation: Option<Aggregation>,
}

impl Query {
    /// Create a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter condition.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add multiple filter conditions (AND).
    pub fn filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Set fields to project.
    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Add a sort specification.
    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort.push(SortBy::new(
            field,
            if ascending {
                SortOrder::Asc
            } else {
                SortOrder::Desc
            },
        ));
        self
    }

    /// Set the maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the number of results to skip.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set an aggregation to perform.
    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// A copy holding only this query's filters.
    pub fn filter_only(&self) -> Query {
        Query {
            filters: self.filters.clone(),
            ..Query::default()
        }
    }

    /// Check if a value matches all filters.
    pub fn matches(&self, value: &JsonValue) -> bool {
        self.filters.iter().all(|f| f.matches_value(value))
    }

    /// Check if an entity matches all filters.
    pub fn matches_entity(&self, entity: &Entity) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        self.matches(&entity.to_json())
    }

    /// Apply projection to a value. The `id` field always survives.
    pub fn apply_projection(&self, value: &JsonValue) -> JsonValue {
        if self.projection.is_empty() {
            return value.clone();
        }

        let mut result = Map::new();
        if let Some(id) = value.get(ID_FIELD) {
            result.insert(ID_FIELD.to_string(), id.clone());
        }
        for field in &self.projection {
            if let Some(v) = get_field(value, field) {
                result.insert(field.clone(), v);
            }
        }
        JsonValue::Object(result)
    }

    /// Sort, skip, limit and project entities without re-applying filters.
    pub fn apply_window(&self, mut entities: Vec<Entity>) -> Vec<Entity> {
        sort_entities(&mut entities, &self.sort);

        let skip = self.offset.unwrap_or(0);
        let take = self.limit.unwrap_or(usize::MAX);
        entities
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|entity| self.project_entity(entity))
            .collect()
    }

    fn project_entity(&self, entity: Entity) -> Entity {
        if self.projection.is_empty() {
            return entity;
        }
        match self.apply_projection(&entity.into_json()) {
            JsonValue::Object(map) => Entity::from_map(map),
            _ => Entity::from_map(Map::new()),
        }
    }

    /// Encode as URL query parameters for the backend.
    pub fn to_query_pairs(&self) -> CacheResult<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        if !self.filters.is_empty() {
            pairs.push(("query".to_string(), serde_json::to_string(&self.filters)?));
        }
        if !self.projection.is_empty() {
            pairs.push(("fields".to_string(), self.projection.join(",")));
        }
        if !self.sort.is_empty() {
            pairs.push(("sort".to_string(), serde_json::to_string(&self.sort)?));
        }
        if let Some(offset) = self.offset {
            pairs.push(("skip".to_string(), offset.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        Ok(pairs)
    }

    /// Decode URL query parameters produced by [`Query::to_query_pairs`].
    pub fn from_query_pairs<'a, I>(pairs: I) -> CacheResult<Query>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = Query::new();
        for (key, value) in pairs {
            match key {
                "query" => query.filters = serde_json::from_str(value)?,
                "fields" => {
                    query.projection = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect()
                }
                "sort" => query.sort = serde_json::from_str(value)?,
                "skip" => query.offset = Some(parse_count(key, value)?),
                "limit" => query.limit = Some(parse_count(key, value)?),
                _ => {}
            }
        }
        Ok(query)
    }
}

fn parse_count(key: &str, value: &str) -> CacheResult<usize> {
    value
        .parse()
        .map_err(|_| CacheError::InvalidArgument(format!("{} must be a non-negative integer", key)))
}

/// Result of a query execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching entities, sorted, paged and projected.
    pub entities: Vec<Entity>,
    /// Total count before limit/offset.
    pub total_count: usize,
    /// Aggregation result (if aggregation was requested).
    pub aggregation: Option<JsonValue>,
}

/// Query executor for running queries against in-memory entities.
pub struct QueryExecutor;

impl QueryExecutor {
    /// Execute a query against a collection of entities.
    ///
    /// Aggregations run over every matching entity, before paging.
    pub fn execute<I>(query: &Query, items: I) -> CacheResult<QueryResult>
    where
        I: IntoIterator<Item = Entity>,
    {
        let matched: Vec<Entity> = items
            .into_iter()
            .filter(|entity| query.matches_entity(entity))
            .collect();

        let total_count = matched.len();

        let aggregation = query
            .aggregation
            .as_ref()
            .map(|agg| compute_aggregation(agg, &matched));

        Ok(QueryResult {
            entities: query.apply_window(matched),
            total_count,
            aggregation,
        })
    }
}

fn sort_entities(entities: &mut [Entity], sort: &[SortBy]) {
    if sort.is_empty() {
        return;
    }
    entities.sort_by(|a, b| {
        for sort_spec in sort {
            let a_val = entity_field(a, &sort_spec.field);
            let b_val = entity_field(b, &sort_spec.field);

            let cmp = match (a_val, b_val) {
                (Some(av), Some(bv)) => compare_json(&av, &bv).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };

            let cmp = match sort_spec.order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };

            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });
}

/// Get a field from an entity using dot notation.
fn entity_field(entity: &Entity, field: &str) -> Option<JsonValue> {
    match field.split_once('.') {
        Some((head, rest)) => get_field(entity.get(head)?, rest),
        None => entity.get(field).cloned(),
    }
}

/// Get a field from a JSON value using dot notation.
fn get_field(value: &JsonValue, field: &str) -> Option<JsonValue> {
    let mut current = value;
    for part in field.split('.') {
        match current {
            JsonValue::Object(map) => {
                current = map.get(part)?;
            }
            JsonValue::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

/// Compare two JSON values.
/// Returns ordering with nulls sorting before all other values.
fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        // Null sorts before everything
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Null, _) => Some(Ordering::Less),
        (_, JsonValue::Null) => Some(Ordering::Greater),

        (JsonValue::Number(a), JsonValue::Number(b)) => {
            let a_f = a.as_f64()?;
            let b_f = b.as_f64()?;
            a_f.partial_cmp(&b_f)
        }
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),

        _ => None,
    }
}

/// Check if a JSON value contains another value.
fn json_contains(container: &JsonValue, item: &JsonValue) -> bool {
    match container {
        JsonValue::String(s) => {
            if let Some(substr) = item.as_str() {
                s.contains(substr)
            } else {
                false
            }
        }
        JsonValue::Array(arr) => arr.contains(item),
        JsonValue::Object(map) => {
            if let Some(key) = item.as_str() {
                map.contains_key(key)
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Compute an aggregation over matching entities.
fn compute_aggregation(agg: &Aggregation, entities: &[Entity]) -> JsonValue {
    let field_values = |field: &str| -> Vec<JsonValue> {
        entities
            .iter()
            .filter_map(|e| entity_field(e, field))
            .collect()
    };

    match agg {
        Aggregation::Count => JsonValue::Number(entities.len().into()),
        Aggregation::Sum { field } => {
            let sum: f64 = field_values(field).iter().filter_map(|v| v.as_f64()).sum();
            serde_json::json!(sum)
        }
        Aggregation::Avg { field } => {
            let values: Vec<f64> = field_values(field)
                .iter()
                .filter_map(|v| v.as_f64())
                .collect();
            if values.is_empty() {
                JsonValue::Null
            } else {
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                serde_json::json!(avg)
            }
        }
        Aggregation::Min { field } => field_values(field)
            .into_iter()
            .min_by(|a, b| compare_json(a, b).unwrap_or(Ordering::Equal))
            .unwrap_or(JsonValue::Null),
        Aggregation::Max { field } => field_values(field)
            .into_iter()
            .max_by(|a, b| compare_json(a, b).unwrap_or(Ordering::Equal))
            .unwrap_or(JsonValue::Null),
        Aggregation::Distinct { field } => {
            let mut values: Vec<JsonValue> = Vec::new();
            for value in field_values(field) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            JsonValue::Array(values)
        }
        Aggregation::GroupBy {
            field,
            aggregations,
        } => {
            let mut groups: std::collections::BTreeMap<String, Vec<Entity>> =
                std::collections::BTreeMap::new();

            for entity in entities {
                let key = entity_field(entity, field)
                    .map(|v| match v {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "null".to_string());
                groups.entry(key).or_default().push(entity.clone());
            }

            let result: Map<String, JsonValue> = groups
                .into_iter()
                .map(|(key, group)| {
                    let mut group_result = Map::new();
                    for (name, sub_agg) in aggregations {
                        group_result.insert(name.clone(), compute_aggregation(sub_agg, &group));
                    }
                    (key, JsonValue::Object(group_result))
                })
                .collect();

            JsonValue::Object(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: JsonValue) -> Entity {
        Entity::from_json(value).unwrap()
    }

    fn books() -> Vec<Entity> {
        vec![
            entity(json!({"id": "b1", "title": "Dune", "pages": 412, "genre": "sf"})),
            entity(json!({"id": "b2", "title": "Emma", "pages": 250, "genre": "classic"})),
            entity(json!({"id": "b3", "title": "Solaris", "pages": 204, "genre": "sf"})),
            entity(json!({"id": "b4", "title": "Ulysses", "pages": 730, "genre": "classic"})),
        ]
    }

    #[test]
    fn test_filter_eq() {
        let filter = Filter::eq("name", json!("Alice"));
        assert!(filter.matches_value(&json!({"name": "Alice"})));
        assert!(!filter.matches_value(&json!({"name": "Bob"})));
    }

    #[test]
    fn test_filter_gt() {
        let filter = Filter::gt("age", json!(30));
        assert!(filter.matches_value(&json!({"age": 35})));
        assert!(!filter.matches_value(&json!({"age": 30})));
        assert!(!filter.matches_value(&json!({"age": 25})));
    }

    #[test]
    fn test_filter_in_ids() {
        let filter = Filter::ids(["b1", "b3"]);
        assert!(filter.matches_value(&json!({"id": "b1"})));
        assert!(!filter.matches_value(&json!({"id": "b2"})));
        assert!(!filter.matches_value(&json!({"title": "no id"})));
    }

    #[test]
    fn test_filter_contains_array() {
        let filter = Filter::contains("tags", json!("admin"));
        assert!(filter.matches_value(&json!({"tags": ["admin", "user"]})));
        assert!(!filter.matches_value(&json!({"tags": ["user"]})));
    }

    #[test]
    fn test_filter_or_and_nested() {
        let filter = Filter::or(vec![
            Filter::eq("user.name", json!("Alice")),
            Filter::and(vec![
                Filter::gt("age", json!(18)),
                Filter::lt("age", json!(65)),
            ]),
        ]);
        assert!(filter.matches_value(&json!({"user": {"name": "Alice"}, "age": 5})));
        assert!(filter.matches_value(&json!({"age": 30})));
        assert!(!filter.matches_value(&json!({"age": 70})));
    }

    #[test]
    fn test_projection_keeps_id() {
        let query = Query::new().project(&["title"]);
        let projected = query.apply_projection(&json!({"id": "b1", "title": "Dune", "pages": 1}));
        assert_eq!(projected, json!({"id": "b1", "title": "Dune"}));
    }

    #[test]
    fn test_query_execution() {
        let query = Query::new()
            .filter(Filter::gt("pages", json!(240)))
            .sort_by("pages", true)
            .limit(2);

        let result = QueryExecutor::execute(&query, books()).unwrap();

        assert_eq!(result.total_count, 3);
        let ids: Vec<_> = result.entities.iter().map(|e| e.id().unwrap()).collect();
        assert_eq!(ids, vec!["b2", "b1"]);
    }

    #[test]
    fn test_apply_window_ignores_filters() {
        let query = Query::new()
            .filter(Filter::eq("genre", json!("nothing matches")))
            .sort_by("title", false)
            .offset(1)
            .limit(2);

        let windowed = query.apply_window(books());
        let ids: Vec<_> = windowed.iter().map(|e| e.id().unwrap()).collect();
        assert_eq!(ids, vec!["b3", "b2"]);
    }

    #[test]
    fn test_aggregation_count_ignores_paging() {
        let query = Query::new().limit(1).aggregate(Aggregation::count());
        let result = QueryExecutor::execute(&query, books()).unwrap();
        assert_eq!(result.aggregation, Some(json!(4)));
        assert_eq!(result.entities.len(), 1);
    }

    #[test]
    fn test_aggregation_group_by() {
        let query = Query::new().aggregate(Aggregation::group_by(
            "genre",
            vec![
                ("count".to_string(), Aggregation::count()),
                ("pages".to_string(), Aggregation::sum("pages")),
            ],
        ));

        let result = QueryExecutor::execute(&query, books()).unwrap();
        assert_eq!(
            result.aggregation,
            Some(json!({
                "classic": {"count": 2, "pages": 980.0},
                "sf": {"count": 2, "pages": 616.0}
            }))
        );
    }

    #[test]
    fn test_query_pairs_decode() {
        let query = Query::new()
            .filter(Filter::ids(["a", "b"]))
            .project(&["id", "metadata"])
            .sort_by("title", true)
            .offset(5)
            .limit(10);

        let pairs = query.to_query_pairs().unwrap();
        let decoded =
            Query::from_query_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn test_query_pairs_reject_bad_limit() {
        let result = Query::from_query_pairs([("limit", "-3")]);
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }
}
