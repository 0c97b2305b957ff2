//! Slash-delimited path expressions.
//!
//! A path such as `"database/primary/port"` addresses a value nested inside
//! a configuration mapping. A key that itself contains a slash is written
//! with the slash escaped: `"esca\/ped/key"` resolves `["esca/ped", "key"]`.

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';

/// Split a path expression into its keys.
///
/// Splits on every `/` that is not preceded by `\`, and unescapes `\/` into a
/// literal `/` inside the key. Leading, trailing and consecutive separators
/// produce empty keys. Any other backslash is kept as-is.
///
/// # Examples
///
/// ```rust
/// use distconfig::core::split_path;
///
/// assert_eq!(split_path("a/b/c"), vec!["a", "b", "c"]);
/// assert_eq!(split_path("a/b/c/"), vec!["a", "b", "c", ""]);
/// assert_eq!(split_path("/a/b"), vec!["", "a", "b"]);
/// assert_eq!(split_path(r"a\/b/c"), vec!["a/b", "c"]);
/// ```
pub fn split_path(path: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE if chars.peek() == Some(&SEPARATOR) => {
                current.push(SEPARATOR);
                chars.next();
            }
            SEPARATOR => keys.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    keys.push(current);
    keys
}

/// Join keys into a path expression, escaping slashes inside keys.
///
/// `split_path(&join_path(keys)) == keys` for every non-empty list of keys
/// that do not end with a backslash.
///
/// # Examples
///
/// ```rust
/// use distconfig::core::join_path;
///
/// assert_eq!(join_path(["esca/ped", "key"]), r"esca\/ped/key");
/// ```
pub fn join_path<I, S>(keys: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|key| key.as_ref().replace(SEPARATOR, r"\/"))
        .collect::<Vec<_>>()
        .join("/")
}
