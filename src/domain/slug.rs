//! Slug derivation for article URLs.
//!
//! Driver and circuit names carry diacritics ("Pérez", "Nürburgring"); the
//! `slug` crate folds them to ASCII so `Pérez wins at Nürburgring` becomes
//! `perez-wins-at-nurburgring`.

use slug::slugify;
use thiserror::Error;

const MAX_SLUG_LEN: usize = 96;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug source text is empty")]
    EmptyInput,
    #[error("failed to derive slug from `{input}`")]
    Unrepresentable { input: String },
    #[error("`{slug}` is not a valid slug")]
    Malformed { slug: String },
}

/// Derive a slug from human-readable text, truncated on a word boundary.
pub fn derive_slug(input: &str) -> Result<String, SlugError> {
    if input.trim().is_empty() {
        return Err(SlugError::EmptyInput);
    }

    let candidate = slugify(input);
    if candidate.is_empty() {
        return Err(SlugError::Unrepresentable {
            input: input.to_string(),
        });
    }

    if candidate.len() <= MAX_SLUG_LEN {
        return Ok(candidate);
    }

    let cut = candidate[..MAX_SLUG_LEN]
        .rfind('-')
        .unwrap_or(MAX_SLUG_LEN);
    Ok(candidate[..cut].to_string())
}

/// Accept an editor-supplied slug only if it is already in canonical form.
pub fn ensure_canonical(slug: &str) -> Result<(), SlugError> {
    if slug.is_empty() {
        return Err(SlugError::EmptyInput);
    }
    if slugify(slug) != slug || slug.len() > MAX_SLUG_LEN {
        return Err(SlugError::Malformed {
            slug: slug.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_slug_folds_diacritics() {
        let slug = derive_slug("Pérez wins at Nürburgring").expect("slug");
        assert_eq!(slug, "perez-wins-at-nurburgring");
    }

    #[test]
    fn derive_slug_rejects_blank_input() {
        assert_eq!(derive_slug("   "), Err(SlugError::EmptyInput));
    }

    #[test]
    fn derive_slug_truncates_on_word_boundary() {
        let title = "lap ".repeat(40);
        let slug = derive_slug(&title).expect("slug");
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
        assert!(slug.ends_with("lap"));
    }

    #[test]
    fn canonical_slugs_pass_and_others_fail() {
        ensure_canonical("monaco-gp-preview").expect("canonical");
        assert!(matches!(
            ensure_canonical("Monaco GP"),
            Err(SlugError::Malformed { .. })
        ));
    }
}
