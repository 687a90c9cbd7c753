//! Finalizer obligations on a parent object.
//!
//! All three operations are idempotent set-membership checks on
//! `metadata.finalizers`; they never touch any other field.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Token guarding deletion of a `Minecraft` until pre-delete cleanup has run.
pub const FINALIZER: &str = "cache.example.com/finalizer";

pub fn has_obligation(meta: &ObjectMeta, token: &str) -> bool {
    meta.finalizers.as_ref().map(|f| f.iter().any(|t| t == token)).unwrap_or(false)
}

/// Returns `true` if the token was added, `false` if it was already present.
pub fn add_obligation(meta: &mut ObjectMeta, token: &str) -> bool {
    if has_obligation(meta, token) { return false; }
    meta.finalizers.get_or_insert_with(Vec::new).push(token.to_string());
    true
}

/// Returns `true` if the token was removed, `false` if it was already absent.
pub fn remove_obligation(meta: &mut ObjectMeta, token: &str) -> bool {
    let Some(list) = meta.finalizers.as_mut() else { return false };
    let before = list.len();
    list.retain(|t| t != token);
    before != list.len()
}
