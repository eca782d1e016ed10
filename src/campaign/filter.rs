//! Recipient filters.
//!
//! A campaign list selects contacts with a predicate tree of
//! (field, operator, value) conditions combined with `all`/`any`/`not`,
//! plus a static ID set and excluded tags.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::directory::{AttributeValue, Contact};
use crate::store::ContactId;

/// Literal compared against a contact field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Compare against a contact value. Text compares case-insensitively;
    /// numeric text is compared as a number against numeric literals.
    fn compare(&self, actual: &AttributeValue) -> Option<Ordering> {
        match (actual, self) {
            (AttributeValue::Number(a), FilterValue::Number(b)) => a.partial_cmp(b),
            (AttributeValue::Text(a), FilterValue::Number(b)) => {
                a.trim().parse::<f64>().ok()?.partial_cmp(b)
            }
            (AttributeValue::Number(a), FilterValue::Text(b)) => {
                a.partial_cmp(&b.trim().parse::<f64>().ok()?)
            }
            (AttributeValue::Text(a), FilterValue::Text(b)) => {
                Some(a.to_lowercase().cmp(&b.to_lowercase()))
            }
            (_, FilterValue::List(_)) => None,
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Inclusive range; value is a two-element list `[min, max]`
    Between,
    /// Value is a list
    In,
    NotIn,
    /// Case-insensitive substring
    Contains,
    /// Field present; value ignored
    Exists,
}

/// One (field, operator, value) test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    #[serde(default = "null_value")]
    pub value: FilterValue,
}

fn null_value() -> FilterValue {
    FilterValue::List(Vec::new())
}

/// Predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    HasTag(String),
    Condition(Condition),
}

impl Predicate {
    pub fn condition(field: impl Into<String>, op: Operator, value: FilterValue) -> Self {
        Self::Condition(Condition {
            field: field.into(),
            op,
            value,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::condition(field, Operator::Eq, FilterValue::Text(value.into()))
    }

    pub fn between(field: impl Into<String>, min: f64, max: f64) -> Self {
        Self::condition(
            field,
            Operator::Between,
            FilterValue::List(vec![FilterValue::Number(min), FilterValue::Number(max)]),
        )
    }

    pub fn one_of<S: Into<String>>(field: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self::condition(
            field,
            Operator::In,
            FilterValue::List(values.into_iter().map(|v| FilterValue::Text(v.into())).collect()),
        )
    }

    /// Evaluate against a contact.
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            Self::All(children) => children.iter().all(|p| p.matches(contact)),
            Self::Any(children) => children.iter().any(|p| p.matches(contact)),
            Self::Not(inner) => !inner.matches(contact),
            Self::HasTag(tag) => contact.tags.contains(tag),
            Self::Condition(cond) => cond.matches(contact),
        }
    }
}

impl Condition {
    fn matches(&self, contact: &Contact) -> bool {
        let actual = contact.field(&self.field);

        match self.op {
            Operator::Exists => actual.is_some(),
            // A missing field is "not equal" and "not in".
            Operator::Ne => actual.map_or(true, |a| self.value.compare(&a) != Some(Ordering::Equal)),
            Operator::NotIn => actual.map_or(true, |a| !self.in_list(&a)),
            _ => {
                let Some(actual) = actual else {
                    return false;
                };
                match self.op {
                    Operator::Eq => self.value.compare(&actual) == Some(Ordering::Equal),
                    Operator::Gt => self.value.compare(&actual) == Some(Ordering::Greater),
                    Operator::Gte => matches!(
                        self.value.compare(&actual),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Operator::Lt => self.value.compare(&actual) == Some(Ordering::Less),
                    Operator::Lte => matches!(
                        self.value.compare(&actual),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    Operator::Between => self.in_range(&actual),
                    Operator::In => self.in_list(&actual),
                    Operator::Contains => match (&actual, &self.value) {
                        (AttributeValue::Text(a), FilterValue::Text(b)) => {
                            a.to_lowercase().contains(&b.to_lowercase())
                        }
                        _ => false,
                    },
                    // handled above
                    Operator::Exists | Operator::Ne | Operator::NotIn => false,
                }
            }
        }
    }

    fn in_list(&self, actual: &AttributeValue) -> bool {
        match &self.value {
            FilterValue::List(items) => items
                .iter()
                .any(|v| v.compare(actual) == Some(Ordering::Equal)),
            single => single.compare(actual) == Some(Ordering::Equal),
        }
    }

    fn in_range(&self, actual: &AttributeValue) -> bool {
        match &self.value {
            FilterValue::List(bounds) if bounds.len() == 2 => {
                matches!(
                    bounds[0].compare(actual),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    bounds[1].compare(actual),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            _ => false,
        }
    }
}

/// Recipient selection for a campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignList {
    /// Dynamic filter over the contact pool (None selects nobody dynamically)
    #[serde(default)]
    pub filter: Option<Predicate>,
    /// Contacts added regardless of the filter
    #[serde(default)]
    pub static_contacts: Vec<ContactId>,
    /// Contacts carrying any of these tags are excluded
    #[serde(default)]
    pub excluded_tags: HashSet<String>,
}

impl CampaignList {
    pub fn filtered(filter: Predicate) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn with_static(mut self, ids: impl IntoIterator<Item = ContactId>) -> Self {
        self.static_contacts.extend(ids);
        self
    }

    pub fn excluding_tag(mut self, tag: impl Into<String>) -> Self {
        self.excluded_tags.insert(tag.into());
        self
    }
}
