//! Query classification for early-stop heuristics.
//!
//! Different query shapes are satisfied by different minimal context:
//! a config lookup is done once the key definition and a usage are in
//! hand, while a symbol query wants the implementation plus a usage or
//! test. Keyword heuristics are deliberate here; they are cheap,
//! deterministic, and explainable in evidence.

use serde::{Deserialize, Serialize};

use super::bundle::ContextLevel;

/// Coarse query shape driving level selection and early-stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "token")]
pub enum QueryClass {
    /// A specific symbol is named or strongly implied.
    Symbol(String),
    /// Configuration key lookup (ALL_CAPS token, dotted key, or
    /// config vocabulary).
    ConfigKey(String),
    /// API surface / route lookup.
    Route(String),
    /// Everything else.
    Conceptual,
}

impl QueryClass {
    /// Classify a query string.
    pub fn classify(query: &str) -> Self {
        let tokens: Vec<&str> = query
            .split(|c: char| c.is_whitespace() || c == ',' || c == '?' || c == '"' || c == '\'')
            .filter(|t| !t.is_empty())
            .collect();

        // Config signals outrank the rest: an ALL_CAPS or dotted token
        // is close to unambiguous.
        if let Some(token) = tokens.iter().find(|t| is_all_caps_token(t)) {
            return Self::ConfigKey((*token).to_string());
        }
        if let Some(token) = tokens.iter().find(|t| is_dotted_key(t)) {
            return Self::ConfigKey((*token).to_string());
        }
        let lower = query.to_lowercase();
        if lower.contains("config") || lower.contains("setting") || lower.contains("env var") {
            let token = tokens.last().map_or(String::new(), |t| (*t).to_string());
            return Self::ConfigKey(token);
        }

        if lower.contains("endpoint")
            || lower.contains("route")
            || lower.contains("handler")
            || lower.contains(" api")
            || lower.starts_with("api")
            || tokens.iter().any(|t| t.starts_with('/') && t.len() > 1)
        {
            let token = tokens
                .iter()
                .find(|t| t.starts_with('/'))
                .or_else(|| tokens.last())
                .map_or(String::new(), |t| (*t).to_string());
            return Self::Route(token);
        }

        if let Some(token) = tokens.iter().find(|t| is_identifier_like(t)) {
            return Self::Symbol((*token).to_string());
        }

        Self::Conceptual
    }

    /// The level assembly aims for before budget pressure degrades it.
    pub fn preferred_level(&self) -> ContextLevel {
        match self {
            // Symbol and open-ended queries want the implementation.
            Self::Symbol(_) | Self::Conceptual => ContextLevel::Implementation,
            // A key or route is answered by definitions and signatures.
            Self::ConfigKey(_) | Self::Route(_) => ContextLevel::Definition,
        }
    }
}

/// ALL_CAPS config-style token: JWT_SECRET, TIMEOUT_MS.
fn is_all_caps_token(token: &str) -> bool {
    token.len() >= 2
        && token.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
        && token.chars().any(|c| c.is_ascii_uppercase())
}

/// Dotted config key: server.port, auth.jwt.ttl.
fn is_dotted_key(token: &str) -> bool {
    token.contains('.')
        && !token.starts_with('.')
        && !token.ends_with('.')
        && token
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        && token.chars().any(|c| c == '.')
        && token.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}

/// Identifier-looking token: snake_case, CamelCase, paths, calls.
fn is_identifier_like(token: &str) -> bool {
    if token.contains("::") || token.ends_with("()") {
        return true;
    }
    if token.contains('_') && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return true;
    }
    // CamelCase or mixedCase: an uppercase letter after the first char.
    token.len() >= 3
        && token.chars().all(char::is_alphanumeric)
        && token.chars().skip(1).any(|c| c.is_ascii_uppercase())
}

/// Whether a query token plausibly names a symbol. Used to tie an
/// emitted definition back to the query: exact match, one containing
/// the other, or a shared 5-character stem ("rotation" ~ "rotate").
pub fn symbol_matches(token: &str, name: &str) -> bool {
    let token = token.to_lowercase();
    let name = name.to_lowercase();
    if token.is_empty() || name.is_empty() {
        return false;
    }
    if token == name || token.contains(&name) || name.contains(&token) {
        return true;
    }
    let stem_len = 5;
    token.len() >= stem_len && name.len() >= stem_len && token[..stem_len] == name[..stem_len]
}

/// Whether any whitespace-separated query token matches the name.
pub fn query_mentions_symbol(query: &str, name: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .any(|t| symbol_matches(t, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_config_all_caps() {
        assert_eq!(
            QueryClass::classify("JWT_SECRET default"),
            QueryClass::ConfigKey("JWT_SECRET".into())
        );
    }

    #[test]
    fn test_classify_config_dotted_key() {
        assert_eq!(
            QueryClass::classify("where is server.port set"),
            QueryClass::ConfigKey("server.port".into())
        );
    }

    #[test]
    fn test_classify_config_vocabulary() {
        assert!(matches!(
            QueryClass::classify("config for retry timeout"),
            QueryClass::ConfigKey(_)
        ));
    }

    #[test]
    fn test_classify_route() {
        assert!(matches!(
            QueryClass::classify("handler for /users/login"),
            QueryClass::Route(_)
        ));
        assert!(matches!(
            QueryClass::classify("login endpoint"),
            QueryClass::Route(_)
        ));
    }

    #[test]
    fn test_classify_symbol() {
        assert_eq!(
            QueryClass::classify("where is validate_token used"),
            QueryClass::Symbol("validate_token".into())
        );
        assert_eq!(
            QueryClass::classify("explain AuthService"),
            QueryClass::Symbol("AuthService".into())
        );
    }

    #[test]
    fn test_classify_conceptual() {
        assert_eq!(
            QueryClass::classify("refresh token rotation"),
            QueryClass::Conceptual
        );
    }

    #[test]
    fn test_preferred_levels() {
        assert_eq!(
            QueryClass::Symbol("f".into()).preferred_level(),
            ContextLevel::Implementation
        );
        assert_eq!(
            QueryClass::ConfigKey("K".into()).preferred_level(),
            ContextLevel::Definition
        );
        assert_eq!(
            QueryClass::Conceptual.preferred_level(),
            ContextLevel::Implementation
        );
    }

    #[test]
    fn test_symbol_matches_stems() {
        assert!(symbol_matches("rotation", "rotate"));
        assert!(symbol_matches("rotate", "rotate"));
        // Shared "valid" stem.
        assert!(symbol_matches("validateToken", "validate_token"));
        assert!(symbol_matches("token", "validatetoken"));
        assert!(!symbol_matches("alpha", "beta"));
    }

    #[test]
    fn test_query_mentions_symbol() {
        assert!(query_mentions_symbol("refresh token rotation", "rotate"));
        assert!(query_mentions_symbol("fix validateToken", "validateToken"));
        assert!(!query_mentions_symbol("database schema", "rotate"));
    }
}
