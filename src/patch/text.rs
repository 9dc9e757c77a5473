//! Thin wrapper around the diff-match-patch engine used for fine-grained
//! concurrent text edits. Patches travel as standard diff-match-patch patch
//! strings; application is fuzzy, and a hunk that fails to match rejects the
//! whole operation.

use diff_match_patch_rs::{Compat, DiffMatchPatch, PatchInput};

/// Apply a diff-match-patch patch string to `source`. `None` when the patch
/// text is malformed or any hunk fails to find its context.
pub(crate) fn apply_patch_text(patch: &str, source: &str) -> Option<String> {
    let dmp = DiffMatchPatch::new();
    let patches = dmp.patch_from_text::<Compat>(patch).ok()?;
    let (applied, results) = dmp.patch_apply(&patches, source).ok()?;
    if results.iter().all(|applied_cleanly| *applied_cleanly) {
        Some(applied)
    } else {
        None
    }
}

/// Produce a patch string turning `before` into `after`.
pub(crate) fn make_patch_text(before: &str, after: &str) -> Option<String> {
    let dmp = DiffMatchPatch::new();
    let diffs = dmp.diff_main::<Compat>(before, after).ok()?;
    let patches = dmp.patch_make(PatchInput::new_diffs(&diffs)).ok()?;
    Some(dmp.patch_to_text(&patches))
}
