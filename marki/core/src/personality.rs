//! Personality catalogue
//!
//! The backend builds its prompt from a personality selector (slug). The
//! catalogue is static; only the slug travels over the wire.

use serde::Serialize;

/// A selectable personality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Personality {
    /// Wire selector
    pub slug: &'static str,
    /// Display name
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// All personalities the backend knows about
pub const PERSONALITIES: &[Personality] = &[
    Personality {
        slug: "markiai",
        name: "Marki AI",
        description: "Friendly assistant from the NYTX team, helps with programming and technology.",
    },
    Personality {
        slug: "sieumatday",
        name: "Siêu mất dạy",
        description: "Comedic character with a sarcastic, foul-mouthed style.",
    },
    Personality {
        slug: "vinhyet",
        name: "Vinh yet",
        description: "Ironic character fond of heart emoji and bold language.",
    },
];

/// Selector used for new conversations
pub const DEFAULT_PERSONALITY_SLUG: &str = "markiai";

/// Look up a personality by slug
#[must_use]
pub fn find(slug: &str) -> Option<&'static Personality> {
    PERSONALITIES.iter().find(|p| p.slug == slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_in_catalogue() {
        assert!(find(DEFAULT_PERSONALITY_SLUG).is_some());
    }

    #[test]
    fn test_unknown_slug() {
        assert!(find("nobody").is_none());
    }
}
