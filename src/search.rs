//! Search request/response types and their translation into tantivy queries.
//!
//! A search is a full-text `term` (tokenized the same way the searched fields
//! were indexed) combined with `where` filters. Filters never influence the
//! score; only the term does.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tantivy::query::{
    AllQuery, BooleanQuery, ConstScoreQuery, Occur, PhraseQuery, Query, RangeQuery, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, Term};

use crate::errors::IndexerError;
use crate::schema::{Document, FieldKind, TantivyFields};

const DEFAULT_LIMIT: usize = 10;

/// Body of `POST {prefix}/search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Full-text term; empty means "match everything".
    pub term: String,

    /// Restrict `term` to these string fields (all string fields when absent).
    pub properties: Option<Vec<String>>,

    /// Per-field filters, all of which must match.
    #[serde(rename = "where")]
    pub filters: BTreeMap<String, Filter>,

    #[serde(rename = "sortBy")]
    pub sort_by: Option<SortBy>,

    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            term: String::new(),
            properties: None,
            filters: BTreeMap::new(),
            sort_by: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl SearchParams {
    pub fn term(term: impl Into<String>) -> Self {
        SearchParams {
            term: term.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, filter: Filter) -> Self {
        self.filters.insert(field.into(), filter);
        self
    }

    pub fn sorted_by(mut self, property: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(SortBy {
            property: property.into(),
            order,
        });
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// A `where` clause value. Which shapes are valid depends on the field kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    /// boolean field equality
    Flag(bool),
    /// string field match (phrase when it spans several tokens)
    Text(String),
    /// string field matching any of the values
    AnyText(Vec<String>),
    /// number field range
    Range(RangeFilter),
}

/// Numeric comparison operators; every operator given must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub between: Option<(f64, f64)>,
}

impl RangeFilter {
    fn bounds(&self) -> Vec<(Bound<f64>, Bound<f64>)> {
        let mut out = Vec::new();
        if let Some(v) = self.gt {
            out.push((Bound::Excluded(v), Bound::Unbounded));
        }
        if let Some(v) = self.gte {
            out.push((Bound::Included(v), Bound::Unbounded));
        }
        if let Some(v) = self.lt {
            out.push((Bound::Unbounded, Bound::Excluded(v)));
        }
        if let Some(v) = self.lte {
            out.push((Bound::Unbounded, Bound::Included(v)));
        }
        if let Some(v) = self.eq {
            out.push((Bound::Included(v), Bound::Included(v)));
        }
        if let Some((lo, hi)) = self.between {
            out.push((Bound::Included(lo), Bound::Included(hi)));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub property: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: u64,
    pub score: f32,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elapsed {
    /// nanoseconds
    pub raw: u64,
    pub formatted: String,
}

impl From<Duration> for Elapsed {
    fn from(d: Duration) -> Self {
        // Microsecond precision is plenty for a human-readable value
        let rounded = Duration::from_micros(d.as_micros() as u64);
        Elapsed {
            raw: d.as_nanos() as u64,
            formatted: humantime::format_duration(rounded).to_string(),
        }
    }
}

/// Response of `POST {prefix}/search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Total matches before `offset`/`limit` are applied.
    pub count: usize,
    pub hits: Vec<Hit>,
    pub elapsed: Elapsed,
}

/// Translate `params` into one tantivy query.
///
/// Returns the query together with whether a scoring term took part, which
/// decides the default ordering of the hits.
pub(crate) fn build_query(
    index: &Index,
    fields: &TantivyFields,
    params: &SearchParams,
) -> Result<(Box<dyn Query>, bool), IndexerError> {
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

    let term_query = term_query(index, fields, params)?;
    let scored = term_query.is_some();
    if let Some(q) = term_query {
        clauses.push((Occur::Must, q));
    }

    for (name, filter) in &params.filters {
        let (field, kind) = fields.lookup(name)?;
        let q = filter_query(index, name, field, kind, filter)?;
        let filter: Box<dyn Query> = Box::new(ConstScoreQuery::new(q, 0.0));
        clauses.push((Occur::Must, filter));
    }

    if clauses.is_empty() {
        return Ok((Box::new(AllQuery) as Box<dyn Query>, false));
    }
    Ok((Box::new(BooleanQuery::new(clauses)) as Box<dyn Query>, scored))
}

/// Any-token match of `params.term` across the searched string fields.
fn term_query(
    index: &Index,
    fields: &TantivyFields,
    params: &SearchParams,
) -> Result<Option<Box<dyn Query>>, IndexerError> {
    if matches!(&params.properties, Some(names) if names.is_empty()) {
        return Err(IndexerError::InvalidFilter(
            "properties".into(),
            "must name at least one field".into(),
        ));
    }
    if params.term.trim().is_empty() {
        return Ok(None);
    }

    let searched: Vec<Field> = match &params.properties {
        Some(names) => names
            .iter()
            .map(|name| match fields.lookup(name)? {
                (field, FieldKind::String) => Ok(field),
                _ => Err(IndexerError::InvalidFilter(
                    name.clone(),
                    "only string properties can be searched by term".into(),
                )),
            })
            .collect::<Result<_, _>>()?,
        None => fields.text_fields(),
    };

    let mut should: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    for field in searched {
        for token in tokenize(index, field, &params.term)? {
            let term = Term::from_field_text(field, &token);
            let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
            should.push((Occur::Should, q));
        }
    }

    // A term made only of separators carries nothing to match on
    if should.is_empty() {
        return Ok(None);
    }
    Ok(Some(Box::new(BooleanQuery::new(should))))
}

fn filter_query(
    index: &Index,
    name: &str,
    field: Field,
    kind: FieldKind,
    filter: &Filter,
) -> Result<Box<dyn Query>, IndexerError> {
    let invalid = |msg: &str| IndexerError::InvalidFilter(name.to_string(), msg.to_string());

    match (kind, filter) {
        (FieldKind::Boolean, Filter::Flag(flag)) => Ok(Box::new(TermQuery::new(
            Term::from_field_bool(field, *flag),
            IndexRecordOption::Basic,
        ))),
        (FieldKind::Number, Filter::Range(range)) => {
            let bounds = range.bounds();
            if bounds.is_empty() {
                return Err(invalid("empty range"));
            }
            let clauses = bounds
                .into_iter()
                .map(|(lo, hi)| {
                    let q: Box<dyn Query> =
                        Box::new(RangeQuery::new_f64_bounds(name.to_string(), lo, hi));
                    (Occur::Must, q)
                })
                .collect();
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        (FieldKind::String, Filter::Text(text)) => text_match(index, field, text)
            .and_then(|q| q.ok_or_else(|| invalid("value has no searchable tokens"))),
        (FieldKind::String, Filter::AnyText(values)) => {
            let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for value in values {
                if let Some(q) = text_match(index, field, value)? {
                    clauses.push((Occur::Should, q));
                }
            }
            if clauses.is_empty() {
                return Err(invalid("no searchable values"));
            }
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        (kind, _) => Err(invalid(&format!(
            "filter shape does not fit a {} field",
            kind.as_str()
        ))),
    }
}

/// Single token → term query; several tokens → phrase query.
fn text_match(index: &Index, field: Field, text: &str) -> Result<Option<Box<dyn Query>>, IndexerError> {
    let mut terms: Vec<Term> = tokenize(index, field, text)?
        .iter()
        .map(|token| Term::from_field_text(field, token))
        .collect();

    Ok(match terms.len() {
        0 => None,
        1 => terms
            .pop()
            .map(|t| Box::new(TermQuery::new(t, IndexRecordOption::Basic)) as Box<dyn Query>),
        _ => Some(Box::new(PhraseQuery::new(terms)) as Box<dyn Query>),
    })
}

fn tokenize(index: &Index, field: Field, text: &str) -> Result<Vec<String>, IndexerError> {
    let mut analyzer = index.tokenizer_for_field(field)?;
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    Ok(tokens)
}
