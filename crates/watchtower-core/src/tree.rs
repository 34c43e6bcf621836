//! Path operations on an in-memory config tree.
//!
//! These functions are pure: they never persist and never lock. The config
//! worker is the only caller and it owns the tree exclusively.

use watchtower_storage::{ConfigTree, ConfigValue};

use crate::crypto::SecretEnvelope;
use crate::error::ConfigError;
use crate::path::ConfigPath;

fn transit_conflict(path: &ConfigPath, segment: &str) -> ConfigError {
    ConfigError::PathTransitConflict {
        path: path.to_string(),
        segment: segment.to_owned(),
    }
}

/// Walk to the leaf's parent. Every transit segment must exist and be a tree.
fn descend<'t>(root: &'t ConfigTree, path: &ConfigPath) -> Result<&'t ConfigTree, ConfigError> {
    path.transit()
        .iter()
        .try_fold(root, |node, segment| match node.get(segment) {
            Some(ConfigValue::Tree(child)) => Ok(child),
            _ => Err(transit_conflict(path, segment)),
        })
}

/// Walk to the leaf's parent for writing.
///
/// With `create`, missing segments are inserted as empty trees. Without it,
/// a missing segment yields `Ok(None)`. A non-tree segment is always a
/// conflict, and since newly created trees are empty a conflict can only be
/// met before anything was inserted.
fn descend_mut<'t>(
    root: &'t mut ConfigTree,
    path: &ConfigPath,
    create: bool,
) -> Result<Option<&'t mut ConfigTree>, ConfigError> {
    let mut node = root;
    for segment in path.transit() {
        if !node.contains_key(segment) {
            if !create {
                return Ok(None);
            }
            node.insert(segment.clone(), ConfigValue::Tree(ConfigTree::new()));
        }
        node = match node.get_mut(segment) {
            Some(ConfigValue::Tree(child)) => child,
            _ => return Err(transit_conflict(path, segment)),
        };
    }
    Ok(Some(node))
}

/// Read the value at `path`.
///
/// # Errors
///
/// [`ConfigError::PathTransitConflict`] if a transit segment is missing or
/// not a tree, [`ConfigError::PathNotFound`] if the leaf is absent.
pub fn get(tree: &ConfigTree, path: &ConfigPath) -> Result<ConfigValue, ConfigError> {
    descend(tree, path)?
        .get(path.leaf())
        .cloned()
        .ok_or_else(|| ConfigError::PathNotFound {
            path: path.to_string(),
        })
}

/// Set (`Some`) or delete (`None`) the value at `path`.
///
/// Setting creates missing transit trees. Deleting under a missing transit
/// segment succeeds without creating anything.
///
/// # Errors
///
/// [`ConfigError::PathTransitConflict`] if an existing transit segment is
/// not a tree. The tree is left untouched.
pub fn put(
    tree: &mut ConfigTree,
    path: &ConfigPath,
    value: Option<ConfigValue>,
) -> Result<(), ConfigError> {
    match value {
        Some(value) => {
            if let Some(parent) = descend_mut(tree, path, true)? {
                parent.insert(path.leaf().to_owned(), value);
            }
        }
        None => {
            if let Some(parent) = descend_mut(tree, path, false)? {
                parent.remove(path.leaf());
            }
        }
    }
    Ok(())
}

/// Read the ciphertext and IV siblings of the secret at `path`.
///
/// # Errors
///
/// [`ConfigError::PathTransitConflict`] for a bad transit segment,
/// [`ConfigError::SecretPathIncomplete`] if either sibling is missing, and
/// [`ConfigError::SecretTypeMismatch`] if either is not a string.
pub fn get_secret_envelope(
    tree: &ConfigTree,
    path: &ConfigPath,
) -> Result<SecretEnvelope, ConfigError> {
    let parent = descend(tree, path)?;
    let (Some(ciphertext), Some(iv)) = (parent.get(&path.cipher_leaf()), parent.get(&path.iv_leaf()))
    else {
        return Err(ConfigError::SecretPathIncomplete {
            path: path.to_string(),
        });
    };

    match (ciphertext.as_str(), iv.as_str()) {
        (Some(ciphertext), Some(iv)) => Ok(SecretEnvelope {
            ciphertext: ciphertext.to_owned(),
            iv: iv.to_owned(),
        }),
        _ => Err(ConfigError::SecretTypeMismatch {
            path: path.to_string(),
        }),
    }
}

/// Store (`Some`) or remove (`None`) both siblings of the secret at `path`.
///
/// # Errors
///
/// [`ConfigError::PathTransitConflict`] if an existing transit segment is
/// not a tree.
pub fn put_secret_envelope(
    tree: &mut ConfigTree,
    path: &ConfigPath,
    envelope: Option<SecretEnvelope>,
) -> Result<(), ConfigError> {
    match envelope {
        Some(envelope) => {
            if let Some(parent) = descend_mut(tree, path, true)? {
                parent.insert(path.cipher_leaf(), envelope.ciphertext.into());
                parent.insert(path.iv_leaf(), envelope.iv.into());
            }
        }
        None => {
            if let Some(parent) = descend_mut(tree, path, false)? {
                parent.remove(&path.cipher_leaf());
                parent.remove(&path.iv_leaf());
            }
        }
    }
    Ok(())
}
