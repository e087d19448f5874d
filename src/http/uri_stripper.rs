//! Trims a fixed prefix from a request's path before it reaches a handler.

/// Returns `path` with `prefix` removed if present, otherwise `path`
/// unchanged.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_when_prefix_present() {
        assert_eq!(strip_prefix("/function/greet", "/function"), "/greet");
    }

    #[test]
    fn leaves_unprefixed_paths_untouched() {
        assert_eq!(strip_prefix("/greet", "/function"), "/greet");
    }
}
