//! Name-keyed plugin registry.
//!
//! Registries are plain values owned by the caller and passed into each
//! computation; there is no process-wide instance.

use std::collections::BTreeMap;

use crate::error::{ValidationError, ValidationResult};

#[derive(Debug)]
pub struct NamedRegistry<T> {
    kind: &'static str,
    entries: BTreeMap<String, T>,
    default: Option<String>,
}

impl<T> NamedRegistry<T> {
    /// `kind` names the plugin family in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            default: None,
        }
    }

    /// The first registration becomes the default until another is chosen.
    pub fn register(&mut self, name: impl Into<String>, entry: T) -> ValidationResult<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(ValidationError::DuplicateRegistration {
                kind: self.kind,
                name,
            });
        }
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn set_default(&mut self, name: &str) -> ValidationResult<()> {
        if !self.entries.contains_key(name) {
            return Err(self.unregistered(name));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> ValidationResult<&T> {
        self.entries.get(name).ok_or_else(|| self.unregistered(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn default_entry(&self) -> ValidationResult<&T> {
        let name = self
            .default
            .as_deref()
            .ok_or(ValidationError::NoDefault { kind: self.kind })?;
        self.get(name)
    }

    /// Named entry, or the default when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> ValidationResult<&T> {
        match name {
            Some(name) => self.get(name),
            None => self.default_entry(),
        }
    }

    /// Like [`resolve`](Self::resolve) for optional plugin families: an empty
    /// registry asked for no particular name yields `None`.
    pub fn resolve_optional(&self, name: Option<&str>) -> ValidationResult<Option<&T>> {
        if name.is_none() && self.entries.is_empty() {
            return Ok(None);
        }
        self.resolve(name).map(Some)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unregistered(&self, name: &str) -> ValidationError {
        ValidationError::Unregistered {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}
