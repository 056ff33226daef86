//! Package.json `exports` evaluation.
//!
//! Supports string shorthand, subpath maps, `*` patterns, fallback arrays and
//! nested condition objects. Condition objects are walked in key order and
//! the first key present in the active set wins.

use serde_json::{Map, Value};

/// Resolve `subpath` (`"."` or `"./feature"`) against an `exports` value.
///
/// Returns `Ok(None)` when `exports` defines no target for the subpath, and
/// `Err` when the map mixes subpath keys with condition keys.
pub fn resolve_exports(
    exports: &Value,
    subpath: &str,
    conditions: &[&str],
) -> Result<Option<String>, String> {
    let Some(obj) = exports.as_object() else {
        // String or array shorthand for the root export
        return Ok(if subpath == "." {
            resolve_target(exports, None, conditions)
        } else {
            None
        });
    };

    let subpath_keys = obj.keys().filter(|k| k.starts_with('.')).count();
    if subpath_keys == 0 {
        return Ok(if subpath == "." {
            resolve_target(exports, None, conditions)
        } else {
            None
        });
    }
    if subpath_keys != obj.len() {
        return Err("\"exports\" cannot mix subpath keys and condition keys".to_string());
    }

    if let Some(target) = obj.get(subpath) {
        return Ok(resolve_target(target, None, conditions));
    }

    Ok(best_pattern(obj, subpath)
        .and_then(|(target, star)| resolve_target(target, Some(&star), conditions)))
}

/// Most specific `*` pattern matching `subpath`: longest prefix, then
/// lexicographic key order.
fn best_pattern<'a>(obj: &'a Map<String, Value>, subpath: &str) -> Option<(&'a Value, String)> {
    obj.iter()
        .filter(|(key, _)| key.matches('*').count() == 1)
        .filter_map(|(key, value)| {
            let star = match_pattern(key, subpath)?;
            Some((key.as_str(), value, star))
        })
        .min_by(|a, b| {
            let a_prefix = a.0.find('*').unwrap_or(0);
            let b_prefix = b.0.find('*').unwrap_or(0);
            b_prefix
                .cmp(&a_prefix)
                .then_with(|| b.0.len().cmp(&a.0.len()))
                .then_with(|| a.0.cmp(b.0))
        })
        .map(|(_, value, star)| (value, star))
}

/// `*` substitution value when `subpath` matches `pattern`.
fn match_pattern(pattern: &str, subpath: &str) -> Option<String> {
    let star = pattern.find('*')?;
    let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
    if subpath.len() < prefix.len() + suffix.len()
        || !subpath.starts_with(prefix)
        || !subpath.ends_with(suffix)
    {
        return None;
    }
    let value = &subpath[prefix.len()..subpath.len() - suffix.len()];
    (!value.is_empty()).then(|| value.to_string())
}

fn resolve_target(target: &Value, star: Option<&str>, conditions: &[&str]) -> Option<String> {
    match target {
        Value::String(s) => validate_target(s, star),
        Value::Array(items) => items
            .iter()
            .find_map(|item| resolve_target(item, star, conditions)),
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| conditions.contains(&key.as_str()))
            .find_map(|(_, value)| resolve_target(value, star, conditions)),
        _ => None,
    }
}

/// Targets must be package-relative and must not escape the package.
fn validate_target(target: &str, star: Option<&str>) -> Option<String> {
    if !target.starts_with("./") {
        return None;
    }
    let resolved = match star {
        Some(value) => target.replace('*', value),
        None => target.to_string(),
    };
    if resolved.split('/').any(|segment| segment == ".." || segment == "node_modules") {
        return None;
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BROWSER_IMPORT: &[&str] = &["browser", "import", "default"];
    const NODE_REQUIRE: &[&str] = &["node", "require", "default"];

    #[test]
    fn test_string_shorthand() {
        let exports = json!("./dist/index.js");
        assert_eq!(
            resolve_exports(&exports, ".", BROWSER_IMPORT).unwrap(),
            Some("./dist/index.js".to_string())
        );
        assert_eq!(resolve_exports(&exports, "./x", BROWSER_IMPORT).unwrap(), None);
    }

    #[test]
    fn test_conditions_walk_in_key_order() {
        // `import` appears before `browser`, so it wins for browser imports
        let exports = json!({
            ".": {
                "import": "./esm.js",
                "browser": "./browser.js",
                "require": "./cjs.cjs",
                "default": "./fallback.js"
            }
        });
        assert_eq!(
            resolve_exports(&exports, ".", BROWSER_IMPORT).unwrap(),
            Some("./esm.js".to_string())
        );
        assert_eq!(
            resolve_exports(&exports, ".", NODE_REQUIRE).unwrap(),
            Some("./cjs.cjs".to_string())
        );
        assert_eq!(
            resolve_exports(&exports, ".", &["default"]).unwrap(),
            Some("./fallback.js".to_string())
        );
    }

    #[test]
    fn test_nested_conditions() {
        let exports = json!({
            "node": { "import": "./node.mjs", "require": "./node.cjs" },
            "default": "./browser.js"
        });
        assert_eq!(
            resolve_exports(&exports, ".", NODE_REQUIRE).unwrap(),
            Some("./node.cjs".to_string())
        );
        assert_eq!(
            resolve_exports(&exports, ".", BROWSER_IMPORT).unwrap(),
            Some("./browser.js".to_string())
        );
    }

    #[test]
    fn test_subpath_and_pattern() {
        let exports = json!({
            ".": "./index.js",
            "./utils": "./lib/utils.js",
            "./features/*": "./lib/features/*.js",
            "./features/internal/*": null
        });
        assert_eq!(
            resolve_exports(&exports, "./utils", BROWSER_IMPORT).unwrap(),
            Some("./lib/utils.js".to_string())
        );
        assert_eq!(
            resolve_exports(&exports, "./features/a", BROWSER_IMPORT).unwrap(),
            Some("./lib/features/a.js".to_string())
        );
        assert_eq!(
            resolve_exports(&exports, "./features/internal/x", BROWSER_IMPORT).unwrap(),
            None
        );
        assert_eq!(resolve_exports(&exports, "./missing", BROWSER_IMPORT).unwrap(), None);
    }

    #[test]
    fn test_array_fallback() {
        let exports = json!({ ".": ["bad-not-relative", "./ok.js"] });
        assert_eq!(
            resolve_exports(&exports, ".", BROWSER_IMPORT).unwrap(),
            Some("./ok.js".to_string())
        );
    }

    #[test]
    fn test_mixed_keys_are_invalid() {
        let exports = json!({ ".": "./a.js", "import": "./b.js" });
        assert!(resolve_exports(&exports, ".", BROWSER_IMPORT).is_err());
    }

    #[test]
    fn test_traversal_is_rejected() {
        let exports = json!({ "./*": "./*.js" });
        assert_eq!(
            resolve_exports(&exports, "./../secret", BROWSER_IMPORT).unwrap(),
            None
        );
    }
}
