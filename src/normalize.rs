//! Text normalization for catalog name matching
//!
//! Names and aliases arrive from free-text mentions, so comparisons go
//! through a single folding function:
//! - Unicode NFKC normalization
//! - Lowercase conversion
//! - Whitespace collapsing

use unicode_normalization::UnicodeNormalization;

/// Fold a name into its case-insensitive comparison key.
///
/// ```
/// use food_catalog::normalize::fold_name;
///
/// assert_eq!(fold_name("  Spicy   Ramen "), "spicy ramen");
/// assert_eq!(fold_name("ＩＴＡＬＩＡＮ"), "italian");
/// ```
pub fn fold_name(s: &str) -> String {
    let folded: String = s.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim a display name and collapse inner whitespace, keeping case.
pub fn clean_name(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clean an alias list: trim, drop empties, drop case-insensitive duplicates.
///
/// First occurrence wins, so the caller's ordering is preserved.
pub fn clean_aliases<I, S>(aliases: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    aliases
        .into_iter()
        .map(|a| clean_name(a.as_ref()))
        .filter(|a| !a.is_empty())
        .filter(|a| seen.insert(fold_name(a)))
        .collect()
}

/// Merge `incoming` aliases after `existing`, skipping ones already present.
pub fn merge_aliases(existing: &[String], incoming: &[String]) -> Vec<String> {
    clean_aliases(existing.iter().chain(incoming.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_name_is_case_and_space_insensitive() {
        assert_eq!(fold_name("Italian"), fold_name("  ITALIAN"));
        assert_eq!(fold_name("Pad\tThai"), "pad thai");
    }

    #[test]
    fn test_clean_aliases_preserves_first_occurrence() {
        let cleaned = clean_aliases(["Hot", " hot ", "", "Fiery", "HOT"]);
        assert_eq!(cleaned, vec!["Hot".to_string(), "Fiery".to_string()]);
    }

    #[test]
    fn test_merge_aliases_appends_new_only() {
        let merged = merge_aliases(
            &["Hot".to_string()],
            &["hot".to_string(), "Spicy-hot".to_string()],
        );
        assert_eq!(merged, vec!["Hot".to_string(), "Spicy-hot".to_string()]);
    }
}
