//! Binding configuration.
//!
//! A [`Setting`] binds one local directory to one remote
//! (endpoint, bucket, prefix, credentials) target. A [`Config`] is the
//! ordered collection of bindings one process runs concurrently. Parsing
//! and persistence belong to an external loader; this module only defines
//! the shapes and the identity keys the supervisor dedups on.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application identity used for the data directory (`<dataHome>/osssync`),
/// the spill directory (`<tmp>/osssync`) and the reported filesystem name.
pub const APP_ID: &str = "osssync";

/// One local-root-to-remote-prefix binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    /// Display name.
    pub name: String,
    /// Absolute local root directory.
    pub local: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Skip any file or directory whose basename starts with a dot.
    #[serde(default)]
    pub ignore_hidden_files: bool,
    /// Propagate local removals to the remote store.
    #[serde(default)]
    pub delete: bool,
}

impl Setting {
    /// Identity of the binding: unique per configuration.
    pub fn binding_key(&self) -> String {
        format!("{} | {}", self.local, self.bucket_key())
    }

    /// Identity of the handler serving this binding's remote target.
    pub fn bucket_key(&self) -> String {
        format!("{}/{}", self.bucket, self.prefix)
    }

    /// Stable short id used for the mount point and sidecar files.
    pub fn mount_id(&self) -> String {
        format!("{:x}", md5::compute(self.binding_key().as_bytes()))
    }

    /// True when the fields a running handler depends on differ.
    ///
    /// `local` and `name` are deliberately excluded: the former is part of
    /// the binding key (a changed root is a different binding), the latter
    /// is display-only.
    pub fn has_change(&self, other: &Setting) -> bool {
        self.endpoint != other.endpoint
            || self.access_key_id != other.access_key_id
            || self.access_key_secret != other.access_key_secret
            || self.bucket != other.bucket
            || self.prefix != other.prefix
            || self.ignore_hidden_files != other.ignore_hidden_files
            || self.delete != other.delete
    }
}

/// Ordered collection of bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Vec<Setting>,
}

impl Config {
    /// Reject configurations with duplicate binding keys.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for setting in &self.settings {
            if !seen.insert(setting.binding_key()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate binding: {}",
                    setting.binding_key()
                )));
            }
        }
        Ok(())
    }
}
