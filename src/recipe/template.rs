// src/recipe/template.rs

//! Deterministic template rendering
//!
//! The renderer is deliberately tiny: `{name}` placeholders substituted
//! from a key-sorted variable map, LF line endings, no autoescape, no
//! conditionals. `{{` and `}}` escape literal braces. A placeholder
//! without a matching variable is a validation error, so typos surface at
//! declaration time instead of producing broken configs.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Render `template` with `vars`. Variables are substituted in key-sorted
/// order (the map is already sorted); line endings normalize to LF.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    // Protect escaped braces before substitution.
    const OPEN: &str = "\u{1}";
    const CLOSE: &str = "\u{2}";
    let mut working = template.replace("{{", OPEN).replace("}}", CLOSE);

    if let Some(missing) = placeholder_pattern()
        .captures_iter(&working)
        .map(|captures| captures[1].to_string())
        .find(|name| !vars.contains_key(name))
    {
        return Err(Error::validation(format!(
            "Template references undefined variable `{missing}`."
        ))
        .with_hint("Provide every placeholder key used in the template."));
    }

    for (key, value) in vars {
        working = working.replace(&format!("{{{key}}}"), value);
    }
    let rendered = working
        .replace(OPEN, "{")
        .replace(CLOSE, "}")
        .replace("\r\n", "\n");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_substitution() {
        let rendered =
            render_template("network={network}\n", &vars(&[("network", "mainnet")])).unwrap();
        assert_eq!(rendered, "network=mainnet\n");
    }

    #[test]
    fn test_missing_variable_fails() {
        let err = render_template("port={port}\n", &vars(&[])).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_escaped_braces_pass_through() {
        let rendered = render_template("json={{\"key\": \"{value}\"}}", &vars(&[("value", "x")]))
            .unwrap();
        assert_eq!(rendered, "json={\"key\": \"x\"}");
    }

    #[test]
    fn test_crlf_normalizes_to_lf() {
        let rendered = render_template("a={a}\r\nb=2\r\n", &vars(&[("a", "1")])).unwrap();
        assert_eq!(rendered, "a=1\nb=2\n");
    }

    #[test]
    fn test_repeated_placeholders() {
        let rendered =
            render_template("{name} and {name}", &vars(&[("name", "tdx")])).unwrap();
        assert_eq!(rendered, "tdx and tdx");
    }
}
