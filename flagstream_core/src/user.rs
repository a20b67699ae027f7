//! The user model against which flags are evaluated.
use std::collections::HashMap;

use crate::{Error, Result};

/// A collection of attributes that can affect flag evaluation, usually
/// corresponding to a user of your application.
///
/// `key` must uniquely identify the user in an environment; `name` is used
/// to find the user in the flag center. Both are mandatory. Custom
/// attributes are optional string pairs referenced by rule conditions and
/// dispatch keys.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagUser {
    key: String,
    name: String,
    custom: HashMap<String, String>,
}

impl FlagUser {
    /// Start building a user from its unique key. The name defaults to the
    /// key until overridden.
    pub fn builder(key: impl Into<String>) -> UserBuilder {
        let key = key.into();
        UserBuilder {
            name: key.clone(),
            key,
            custom: HashMap::new(),
        }
    }

    /// Return `true` if both mandatory attributes are present.
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty() && !self.name.is_empty()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All custom attributes set for this user.
    pub fn custom_attributes(&self) -> &HashMap<String, String> {
        &self.custom
    }

    /// Get the value of a user attribute, if present.
    ///
    /// `key`/`keyid` and `name` resolve to the built-in attributes
    /// (case-insensitively); anything else is looked up among the custom
    /// attributes, yielding the empty string when absent.
    pub fn get(&self, attribute: &str) -> &str {
        match attribute.to_ascii_lowercase().as_str() {
            "key" | "keyid" => &self.key,
            "name" => &self.name,
            _ => self
                .custom
                .get(attribute)
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

/// Chainable builder for [`FlagUser`].
///
/// ```
/// # use flagstream_core::FlagUser;
/// let user = FlagUser::builder("u-42")
///     .name("bob")
///     .custom("country", "FR")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct UserBuilder {
    key: String,
    name: String,
    custom: HashMap<String, String>,
}

impl UserBuilder {
    /// Override the user's key.
    pub fn key(mut self, value: impl Into<String>) -> Self {
        self.key = value.into();
        self
    }

    /// Override the user's name.
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Add a string-valued custom attribute.
    pub fn custom(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(attribute.into(), value.into());
        self
    }

    /// Build the user, failing if key or name ended up empty.
    pub fn build(self) -> Result<FlagUser> {
        if self.key.is_empty() || self.name.is_empty() {
            return Err(Error::UserInvalid);
        }
        Ok(FlagUser {
            key: self.key,
            name: self.name,
            custom: self.custom,
        })
    }
}
