//! Topic normalisation and binding-key matching

/// Routing key for a topic: `:` separators become `.` so that exchange
/// wildcards such as `todo.*` apply to `todo:create`.
pub fn binding_key(topic: &str) -> String {
    topic.replace(':', ".")
}

/// Check whether a routing key matches a topic-exchange binding pattern.
///
/// Words are separated by `.`:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == routing_key || pattern == "#" {
        return true;
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_from(&pattern, &key)
}

fn matches_from(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_from(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => matches_from(rest, key_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_key() {
        assert_eq!(binding_key("todo:create"), "todo.create");
        assert_eq!(binding_key("echo.get"), "echo.get");
        assert_eq!(binding_key("a:b:c"), "a.b.c");
    }

    #[test]
    fn test_exact_and_single_word_wildcard() {
        assert!(topic_matches("signup", "signup"));
        assert!(topic_matches("echo.*", "echo.get"));
        assert!(!topic_matches("echo.*", "echo"));
        assert!(!topic_matches("echo.*", "echo.get.more"));
        assert!(!topic_matches("echo.*", "heavy"));
    }

    #[test]
    fn test_multi_word_wildcard() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("todo.#", "todo"));
        assert!(topic_matches("todo.#", "todo.create.now"));
        assert!(topic_matches("*.create.#", "todo.create"));
        assert!(!topic_matches("todo.#", "echo.get"));
    }
}
