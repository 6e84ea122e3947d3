//! Installer artifact selection.

use regex::Regex;

/// Pick the artifact to install among candidate file names.
///
/// Names not matching `pattern` are ignored; among the rest the
/// lexicographically greatest wins. With date-based release names this picks
/// the newest release, but it is not a version comparison.
pub fn select_artifact<'a, I>(names: I, pattern: &Regex) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().filter(|name| pattern.is_match(name)).max()
}
