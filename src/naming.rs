//! Name normalization and collision handling for remote resources.
//!
//! Remote catalogs are picky about resource names: they must be ASCII,
//! start with a letter and avoid most punctuation. Engines that manage
//! their own storage additionally retain historical names, so requesting a
//! fresh name means scanning the existing ones for numeric suffixes.

/// Characters accepted in web-facing resource names (workspaces, layers,
/// styles). Dot is allowed; spaces and anything non-ASCII are not.
fn is_web_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Characters accepted in file names derived from layer names.
fn is_file_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-')
}

/// Returns true when `name` consists of allowed web characters only and
/// starts with an ASCII letter.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.chars().all(is_web_char)
}

fn normalize(name: &str, allowed: fn(char) -> bool) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if allowed(c) { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('L');
    } else if !out.chars().next().unwrap_or('_').is_ascii_alphabetic() {
        // Prepend rather than replace so distinct names stay distinct
        out.insert(0, 'L');
    }
    out
}

/// Converts a layer name into a slug usable in URLs and remote resource
/// names. Disallowed characters become underscores; a leading non-letter
/// gets an `L` prepended.
pub fn web_slug(name: &str) -> String {
    normalize(name, is_web_char)
}

/// Converts a layer name into a slug usable as a file name stem.
pub fn file_slug(name: &str) -> String {
    normalize(name, is_file_char)
}

/// Proposes a name that does not collide with any of `existing`.
///
/// The remote engine keeps historical resource names around, so a free name
/// is found by parsing the numeric suffixes of all existing names sharing
/// the candidate prefix and proposing `candidate + (max + 1)`. The bare
/// candidate counts as suffix 0. With no collision the candidate is
/// returned unchanged.
pub fn propose_name<'a, I>(candidate: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut max_suffix: Option<u64> = None;
    for name in existing {
        if name == candidate {
            max_suffix = Some(max_suffix.unwrap_or(0).max(0));
            continue;
        }
        if let Some(rest) = name.strip_prefix(candidate) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = rest.parse::<u64>() {
                    max_suffix = Some(max_suffix.unwrap_or(0).max(n));
                }
            }
        }
    }
    match max_suffix {
        Some(n) => format!("{}{}", candidate, n + 1),
        None => candidate.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("rivers"));
        assert!(is_valid_name("a1-b2_c3.d4"));
        assert!(!is_valid_name("1rivers"));
        assert!(!is_valid_name("riv ers"));
        assert!(!is_valid_name("rivière"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn slugs_replace_and_prefix() {
        assert_eq!(web_slug("my layer"), "my_layer");
        assert_eq!(web_slug("2020 census"), "L2020_census");
        assert_eq!(file_slug("roads.main"), "roads_main");
        assert_eq!(web_slug(""), "L");
    }

    #[test]
    fn propose_name_skips_taken_suffixes() {
        let existing = ["L", "L1", "L3"];
        assert_eq!(propose_name("L", existing.iter().copied()), "L4");
    }

    #[test]
    fn propose_name_without_collision_is_unchanged() {
        let existing = ["rivers", "roads2"];
        assert_eq!(propose_name("lakes", existing.iter().copied()), "lakes");
    }

    #[test]
    fn propose_name_ignores_non_numeric_suffixes() {
        let existing = ["roads_old", "roadside"];
        assert_eq!(propose_name("roads", existing.iter().copied()), "roads");
    }
}
