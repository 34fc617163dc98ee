//! Sender identity matching against allow-list entries.
//!
//! Allow-list entries come in several historical shapes and all of them
//! keep working: canonical `platform:id`, bare platform id, `@username`,
//! `id|username` compound, and bare username.

use crate::bus::SenderInfo;

/// Check one allow-list entry against a structured sender.
pub fn match_allowed(sender: &SenderInfo, allowed: &str) -> bool {
    let allowed = allowed.trim();
    if allowed.is_empty() {
        return false;
    }

    // Canonical "platform:id" form.
    if !sender.canonical_id.is_empty() && sender.canonical_id == allowed {
        return true;
    }

    // Bare platform id.
    if !sender.platform_id.is_empty() && sender.platform_id == allowed {
        return true;
    }

    // "@username" form.
    let trimmed = allowed.strip_prefix('@').unwrap_or(allowed);
    if !sender.username.is_empty() && sender.username == trimmed {
        return true;
    }

    // "id|username" compound: either half may match.
    if let Some((id_part, user_part)) = trimmed.split_once('|') {
        if !sender.platform_id.is_empty() && sender.platform_id == id_part {
            return true;
        }
        if !sender.username.is_empty() && sender.username == user_part {
            return true;
        }
    }

    false
}

/// Legacy string-only admission: decompose a possibly-compound sender id
/// and match it against a possibly-compound allow-list entry.
///
/// Kept for channels that cannot produce a structured [`SenderInfo`].
pub fn match_allowed_legacy(sender_id: &str, allowed: &str) -> bool {
    let (id_part, user_part) = match sender_id.split_once('|') {
        Some((id, user)) => (id, user),
        None => (sender_id, ""),
    };

    let trimmed = allowed.strip_prefix('@').unwrap_or(allowed);
    let (allowed_id, allowed_user) = match trimmed.split_once('|') {
        Some((id, user)) => (id, user),
        None => (trimmed, ""),
    };

    sender_id == allowed
        || id_part == allowed
        || sender_id == trimmed
        || id_part == trimmed
        || id_part == allowed_id
        || (!allowed_user.is_empty() && sender_id == allowed_user)
        || (!user_part.is_empty()
            && (user_part == allowed || user_part == trimmed || user_part == allowed_user))
}
