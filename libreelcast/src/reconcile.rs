//! Aggregate status reconciliation
//!
//! A post's status is never set by hand once publishing starts: it is derived
//! from the statuses of its platform sub-posts. Every code path that touches a
//! sub-post (publish now, retry, the scheduler, the auto-fix on read) funnels
//! through [`reconcile`], so they all agree on the same rules:
//!
//! 1. anything still `scheduled`, `queued` or `publishing` → `publishing`
//! 2. everything `canceled` → `canceled`
//! 3. everything `published` → `published`
//! 4. some `published`, the rest settled otherwise → `partially_published`
//! 5. anything else → `failed`
//!
//! A post without sub-posts has no meaningful aggregate and is reported as
//! [`ReconcileError::NoTargets`] instead of being guessed.

use crate::error::ReconcileError;
use crate::types::{PlatformPostStatus, PostStatus};

/// Compute the aggregate post status from its sub-post statuses.
///
/// Pure and order-independent: the same multiset of statuses always yields
/// the same result.
pub fn reconcile(statuses: &[PlatformPostStatus]) -> Result<PostStatus, ReconcileError> {
    if statuses.is_empty() {
        return Err(ReconcileError::NoTargets);
    }

    if statuses.iter().any(|s| s.is_pending()) {
        return Ok(PostStatus::Publishing);
    }

    if statuses.iter().all(|s| *s == PlatformPostStatus::Canceled) {
        return Ok(PostStatus::Canceled);
    }

    let published = statuses
        .iter()
        .filter(|s| **s == PlatformPostStatus::Published)
        .count();

    if published == statuses.len() {
        Ok(PostStatus::Published)
    } else if published > 0 {
        Ok(PostStatus::PartiallyPublished)
    } else {
        Ok(PostStatus::Failed)
    }
}

/// Whether a post stuck in an in-flight state should be rewritten.
///
/// Returns the corrected status when the post claims to be `publishing` or
/// `queued` but every sub-post has already settled.
pub fn stale_status_fix(
    current: PostStatus,
    statuses: &[PlatformPostStatus],
) -> Option<PostStatus> {
    if !matches!(current, PostStatus::Publishing | PostStatus::Queued) {
        return None;
    }
    if statuses.is_empty() || !statuses.iter().all(|s| s.is_terminal()) {
        return None;
    }
    match reconcile(statuses) {
        Ok(status) if status != current => Some(status),
        _ => None,
    }
}
