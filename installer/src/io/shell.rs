//! Shell quoting for values interpolated into remote commands.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Quote `value` for a POSIX shell. Plain words are returned unchanged.
pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}
