//! Contact directory.
//!
//! Contacts are owned by an external CRM. This crate reads them by phone and
//! by attributes; the only write it performs is setting the opted-out flag.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ContactId;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("contact directory unavailable: {0}")]
    Unavailable(String),

    #[error("contact not found: {0}")]
    NotFound(ContactId),
}

/// Custom attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

/// Contact snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub phone: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub property_address: Option<String>,
    pub city: Option<String>,
    pub custom1: Option<String>,
    pub custom2: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub opted_out: bool,
}

impl Contact {
    pub fn new(id: u64, phone: impl Into<String>) -> Self {
        Self {
            id: ContactId::from_u64(id),
            phone: phone.into(),
            first_name: None,
            last_name: None,
            company: None,
            property_address: None,
            city: None,
            custom1: None,
            custom2: None,
            tags: HashSet::new(),
            attributes: BTreeMap::new(),
            opted_out: false,
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_first_name(mut self, first: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_property_address(mut self, address: impl Into<String>) -> Self {
        self.property_address = Some(address.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn opted_out(mut self) -> Self {
        self.opted_out = true;
        self
    }

    /// Look up a field by name for filter evaluation.
    ///
    /// Built-in fields resolve first, then custom attributes.
    pub fn field(&self, name: &str) -> Option<AttributeValue> {
        let text = |v: &Option<String>| v.clone().map(AttributeValue::Text);
        match name {
            "phone" => Some(AttributeValue::Text(self.phone.clone())),
            "first_name" => text(&self.first_name),
            "last_name" => text(&self.last_name),
            "company" => text(&self.company),
            "property_address" => text(&self.property_address),
            "city" => text(&self.city),
            "custom1" => text(&self.custom1),
            "custom2" => text(&self.custom2),
            other => self.attributes.get(other).cloned(),
        }
    }
}

/// Normalize a phone number for lookups: digits only, North American
/// numbers without the leading country code.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix('1') {
        Some(rest) if digits.len() == 11 => rest.to_string(),
        _ => digits,
    }
}

/// Contact directory.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Get a contact by ID.
    async fn get(&self, id: ContactId) -> Result<Option<Contact>, DirectoryError>;

    /// Find a contact by phone number (any formatting).
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Contact>, DirectoryError>;

    /// The contact pool that dynamic filters are evaluated against.
    async fn contacts(&self) -> Result<Vec<Contact>, DirectoryError>;

    /// Set the opted-out flag. Returns true only if the flag changed.
    async fn set_opted_out(&self, id: ContactId) -> Result<bool, DirectoryError>;
}

/// Shared directory handle.
pub type SharedDirectory = Arc<dyn ContactDirectory>;

/// In-memory contact directory.
#[derive(Default)]
pub struct MemoryDirectory {
    contacts: RwLock<HashMap<ContactId, Contact>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let dir = Self::new();
        for c in contacts {
            dir.upsert(c);
        }
        dir
    }

    pub fn upsert(&self, contact: Contact) {
        self.contacts.write().unwrap().insert(contact.id, contact);
    }

    pub fn len(&self) -> usize {
        self.contacts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContactDirectory for MemoryDirectory {
    async fn get(&self, id: ContactId) -> Result<Option<Contact>, DirectoryError> {
        Ok(self.contacts.read().unwrap().get(&id).cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Contact>, DirectoryError> {
        let wanted = normalize_phone(phone);
        if wanted.is_empty() {
            return Ok(None);
        }
        Ok(self
            .contacts
            .read()
            .unwrap()
            .values()
            .filter(|c| normalize_phone(&c.phone) == wanted)
            .min_by_key(|c| c.id)
            .cloned())
    }

    async fn contacts(&self) -> Result<Vec<Contact>, DirectoryError> {
        let mut all: Vec<_> = self.contacts.read().unwrap().values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    async fn set_opted_out(&self, id: ContactId) -> Result<bool, DirectoryError> {
        let mut contacts = self.contacts.write().unwrap();
        let contact = contacts.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        if contact.opted_out {
            return Ok(false);
        }
        contact.opted_out = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 (555) 010-2000"), "5550102000");
        assert_eq!(normalize_phone("555.010.2000"), "5550102000");
        assert_eq!(normalize_phone("+44 20 7946 0000"), "442079460000");
    }

    #[tokio::test]
    async fn test_find_by_phone_ignores_formatting() {
        let dir = MemoryDirectory::with_contacts([Contact::new(1, "+15550102000")]);
        let found = dir.find_by_phone("(555) 010-2000").await.unwrap().unwrap();
        assert_eq!(found.id, ContactId::from_u64(1));
        assert!(dir.find_by_phone("5550000000").await.unwrap().is_none());
        assert!(dir.find_by_phone("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_opted_out_changes_once() {
        let dir = MemoryDirectory::with_contacts([Contact::new(1, "+15550102000")]);
        let id = ContactId::from_u64(1);
        assert!(dir.set_opted_out(id).await.unwrap());
        assert!(!dir.set_opted_out(id).await.unwrap());
        assert!(dir.get(id).await.unwrap().unwrap().opted_out);
        assert!(matches!(
            dir.set_opted_out(ContactId::from_u64(2)).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_field_lookup() {
        let c = Contact::new(1, "+1555")
            .with_city("Austin")
            .with_attribute("lead_score", AttributeValue::Number(72.0));
        assert_eq!(c.field("city"), Some(AttributeValue::Text("Austin".into())));
        assert_eq!(c.field("lead_score"), Some(AttributeValue::Number(72.0)));
        assert_eq!(c.field("company"), None);
    }
}
