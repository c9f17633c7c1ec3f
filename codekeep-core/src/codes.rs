/*!
Code entries: the per-user lists of named codes the bot keeps in the
key-value store, and the values every snapshot captures.
*/

use crate::config::DEFAULT_KEY_PREFIX;
use crate::kv::KvStore;
use crate::{CodekeepError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One named code saved by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntry {
    pub name: String,
    pub code: String,
}

impl CodeEntry {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, code: C) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

/// Store key holding the entries of `user` in `guild`
///
/// # Errors
/// Returns [`CodekeepError::InvalidKey`] for empty ids or ids containing `/`.
pub fn user_codes_key(guild: &str, user: &str) -> Result<String> {
    for (label, id) in [("guild", guild), ("user", user)] {
        if id.is_empty() || id.contains('/') {
            return Err(CodekeepError::invalid_key(format!(
                "{label} id '{id}' must be non-empty and must not contain '/'"
            )));
        }
    }
    Ok(format!("{DEFAULT_KEY_PREFIX}{guild}/{user}"))
}

/// All entries saved by `user` in `guild`, in insertion order
pub async fn list_codes(kv: &dyn KvStore, guild: &str, user: &str) -> Result<Vec<CodeEntry>> {
    let key = user_codes_key(guild, user)?;
    match kv.get(&key).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Vec::new()),
    }
}

/// Save `entry`, replacing the code of an existing entry with the same name
///
/// Returns `true` when an existing entry was replaced.
pub async fn add_code(kv: &dyn KvStore, guild: &str, user: &str, entry: CodeEntry) -> Result<bool> {
    if entry.name.trim().is_empty() {
        return Err(CodekeepError::validation("code name must not be empty"));
    }

    let key = user_codes_key(guild, user)?;
    let mut entries = list_codes(kv, guild, user).await?;
    let replaced = match entries.iter_mut().find(|existing| existing.name == entry.name) {
        Some(existing) => {
            existing.code = entry.code;
            true
        }
        None => {
            entries.push(entry);
            false
        }
    };

    kv.put(&key, serde_json::to_value(&entries)?).await?;
    debug!(key = %key, entries = entries.len(), replaced, "Saved code entry");
    Ok(replaced)
}

/// Remove the entry called `name`; returns whether one was removed
pub async fn remove_code(kv: &dyn KvStore, guild: &str, user: &str, name: &str) -> Result<bool> {
    let key = user_codes_key(guild, user)?;
    let mut entries = list_codes(kv, guild, user).await?;
    let before = entries.len();
    entries.retain(|entry| entry.name != name);
    if entries.len() == before {
        return Ok(false);
    }

    kv.put(&key, serde_json::to_value(&entries)?).await?;
    debug!(key = %key, entries = entries.len(), "Removed code entry");
    Ok(true)
}
