//! Default naming for superstructure databases.
//!
//! Scenario names in published datapackages end with a four-digit year
//! ("SSP2-Base 2030"); stripping it yields the scenario family. This is a
//! naming convention of the catalog, not a format guarantee, so everything
//! that depends on it goes through this module.

use std::sync::LazyLock;

use regex::Regex;

static YEAR_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<family>.*?)[\s_\-]*(?:19|20|21)\d{2}$").unwrap());

/// Scenario name without its trailing year, or `None` when there is no
/// year suffix to strip.
pub fn scenario_family(name: &str) -> Option<&str> {
    let captures = YEAR_SUFFIX.captures(name.trim())?;
    let family = captures.name("family")?.as_str();
    if family.is_empty() { None } else { Some(family) }
}

/// Family shared by all names. Falls back to their longest common prefix
/// when the families differ.
pub fn common_family(names: &[&str]) -> Option<String> {
    let families: Vec<&str> = names
        .iter()
        .map(|name| scenario_family(name).unwrap_or(name.trim()))
        .collect();
    let first = *families.first()?;
    let mut prefix_len = first.len();
    for family in &families[1..] {
        prefix_len = first
            .char_indices()
            .zip(family.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map(|((idx, ch), _)| idx + ch.len_utf8())
            .unwrap_or(0)
            .min(prefix_len);
    }
    let prefix = first[..prefix_len]
        .trim_end_matches(|ch: char| ch.is_whitespace() || ch == '-' || ch == '_');
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

/// `"<family> - <dependency database>"`; the package name stands in for
/// the family when scenario names share nothing.
pub fn default_superstructure_name(
    dependency_db: Option<&str>,
    package_name: Option<&str>,
    scenario_names: &[&str],
) -> String {
    let family = common_family(scenario_names)
        .or_else(|| package_name.map(str::to_string))
        .unwrap_or_else(|| "scenarios".to_string());
    match dependency_db {
        Some(db) if !db.trim().is_empty() => format!("{family} - {}", db.trim()),
        _ => family,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_year_suffix() {
        assert_eq!(scenario_family("SSP2-Base 2030"), Some("SSP2-Base"));
        assert_eq!(scenario_family("remind_SSP2_2050"), Some("remind_SSP2"));
        assert_eq!(scenario_family("SSP2-Base"), None);
        assert_eq!(scenario_family("2050"), None);
    }

    #[test]
    fn common_family_across_years() {
        let names = ["SSP2-Base 2030", "SSP2-Base 2040", "SSP2-Base 2050"];
        assert_eq!(common_family(&names).as_deref(), Some("SSP2-Base"));
    }

    #[test]
    fn common_family_falls_back_to_prefix() {
        let names = ["SSP2-Base 2030", "SSP2-PkBudg1150 2030"];
        assert_eq!(common_family(&names).as_deref(), Some("SSP2"));
        assert_eq!(common_family(&["abc 2030", "xyz 2030"]), None);
        assert_eq!(common_family(&[]), None);
    }

    #[test]
    fn default_name_combines_family_and_dependency() {
        let names = ["SSP2-Base 2030", "SSP2-Base 2050"];
        assert_eq!(
            default_superstructure_name(Some("ecoinvent 3.9.1 cutoff"), Some("pkg"), &names),
            "SSP2-Base - ecoinvent 3.9.1 cutoff"
        );
        assert_eq!(
            default_superstructure_name(None, Some("pkg"), &["abc 2030", "xyz 2030"]),
            "pkg"
        );
    }
}
