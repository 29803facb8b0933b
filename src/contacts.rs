//! Emergency contacts
//!
//! Contacts are owned by an external store; the monitor only ever reads an
//! ordered snapshot at dispatch time. Dispatch order is list order and
//! duplicates are kept.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Phone numbers accepted by the settings form
static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[\d\s\-\(\)]{10,}$").expect("phone pattern is valid"));

#[derive(Error, Debug, PartialEq)]
pub enum ContactError {
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("Contact name must not be empty")]
    EmptyName,
}

/// A single emergency contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
}

impl Contact {
    /// Create a contact, validating the phone number
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        phone: impl Into<String>,
    ) -> Result<Self, ContactError> {
        let name = name.into();
        let phone = phone.into();

        if name.trim().is_empty() {
            return Err(ContactError::EmptyName);
        }

        if !is_valid_phone(&phone) {
            return Err(ContactError::InvalidPhone(phone));
        }

        Ok(Self {
            id: id.into(),
            name,
            phone,
        })
    }

    /// Phone number reduced to digits, as handed to notification sinks
    pub fn normalized_phone(&self) -> String {
        normalize_phone(&self.phone)
    }
}

pub fn is_valid_phone(phone: &str) -> bool {
    PHONE_PATTERN.is_match(phone)
}

/// Strip everything except ASCII digits
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Read access to the configured contacts
///
/// Implementations never fail: storage problems yield an empty snapshot,
/// which the monitor treats as "no contacts configured".
pub trait ContactStore: Send + Sync {
    fn contacts(&self) -> Vec<Contact>;
}

/// Contacts held in memory, replaceable at runtime
#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: RwLock<Vec<Contact>>,
}

impl InMemoryContactStore {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self {
            contacts: RwLock::new(contacts),
        }
    }

    pub fn replace(&self, contacts: Vec<Contact>) {
        *self.contacts.write() = contacts;
    }
}

impl ContactStore for InMemoryContactStore {
    fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().clone()
    }
}

/// Persisted contact entry; `id` is optional in stored data
#[derive(Debug, Deserialize)]
struct StoredContact {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    phone: String,
}

/// Contacts persisted as a JSON array of `{ "id"?, "name", "phone" }`
///
/// The file is re-read on every snapshot so edits made by the settings
/// surface are picked up without a restart.
pub struct JsonContactStore {
    path: PathBuf,
}

impl JsonContactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write contacts in the persisted shape
    pub fn save(&self, contacts: &[Contact]) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(contacts)?;
        std::fs::write(&self.path, json)
    }

    fn load(&self) -> Vec<Contact> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Unable to read contacts from {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let stored: Vec<StoredContact> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Error parsing emergency contacts: {}", e);
                return Vec::new();
            }
        };

        let contacts: Vec<Contact> = stored
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let id = entry.id.unwrap_or_else(|| (index + 1).to_string());
                let name = if entry.name.trim().is_empty() {
                    "Emergency contact".to_string()
                } else {
                    entry.name
                };

                match Contact::new(id, name, entry.phone) {
                    Ok(contact) => Some(contact),
                    Err(e) => {
                        warn!("Skipping stored contact #{}: {}", index + 1, e);
                        None
                    }
                }
            })
            .collect();

        debug!("Loaded {} contact(s) from {}", contacts.len(), self.path.display());
        contacts
    }
}

impl ContactStore for JsonContactStore {
    fn contacts(&self) -> Vec<Contact> {
        self.load()
    }
}
