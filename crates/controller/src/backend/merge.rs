use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::context::{ResolvedContext, value_as_text};

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("variable pattern is valid")
});

/// Merge `overlay` into `base`: objects merge key by key, lists
/// concatenate, any other value from `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => {
            base.extend(overlay.iter().cloned());
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Merge template fragments first to last, then the local config on top.
pub fn merge_document<'a>(
    fragments: impl IntoIterator<Item = &'a Value>,
    config: &Value,
) -> Value {
    let mut merged = Value::Object(Map::new());
    for fragment in fragments {
        deep_merge(&mut merged, fragment);
    }
    deep_merge(&mut merged, config);
    merged
}

/// Replace `{{ variable }}` occurrences in every string value. Unknown
/// variables are left as written.
pub fn substitute(value: &mut Value, context: &ResolvedContext) {
    match value {
        Value::String(text) => {
            if text.contains("{{") {
                *text = substitute_str(text, context);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, context);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, context);
            }
        }
        _ => {}
    }
}

pub fn substitute_str(text: &str, context: &ResolvedContext) -> String {
    VARIABLE
        .replace_all(text, |caps: &Captures<'_>| match context.get(&caps[1]) {
            Some(value) => value_as_text(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Drop "files" entries identical in path, mode and contents to an
/// earlier entry.
pub fn dedupe_files(document: &mut Value) {
    let Some(Value::Array(files)) = document.get_mut("files") else {
        return;
    };
    let mut seen: Vec<(Value, Value, Value)> = Vec::with_capacity(files.len());
    files.retain(|file| {
        let identity = (
            file.get("path").cloned().unwrap_or(Value::Null),
            file.get("mode").cloned().unwrap_or(Value::Null),
            file.get("contents").cloned().unwrap_or(Value::Null),
        );
        if seen.contains(&identity) {
            false
        } else {
            seen.push(identity);
            true
        }
    });
}

/// Default `general.hostname` to the device name with `:` replaced by `-`.
pub fn default_hostname(document: &mut Value, device_name: &str) {
    let Value::Object(root) = document else {
        return;
    };
    let general = root
        .entry("general")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(general) = general {
        let missing = general
            .get("hostname")
            .is_none_or(|hostname| hostname.as_str().is_some_and(str::is_empty));
        if missing {
            general.insert(
                "hostname".into(),
                Value::String(device_name.replace(':', "-")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_lists_concatenate_scalars_replace() {
        let a = json!({"general": {"timezone": "UTC", "ula": "a"}, "dns_servers": ["1.1.1.1"]});
        let b = json!({"general": {"timezone": "CET"}, "dns_servers": ["8.8.8.8"]});
        let local = json!({"general": {"description": "local"}});
        let merged = merge_document([&a, &b], &local);
        assert_eq!(
            merged,
            json!({
                "general": {"timezone": "CET", "ula": "a", "description": "local"},
                "dns_servers": ["1.1.1.1", "8.8.8.8"]
            })
        );
    }

    #[test]
    fn later_fragment_scalar_wins() {
        let a = json!({"general": {"timezone": "UTC"}});
        let b = json!({"general": {"timezone": "CET"}});
        let forward = merge_document([&a, &b], &json!({}));
        let reverse = merge_document([&b, &a], &json!({}));
        assert_eq!(forward["general"]["timezone"], "CET");
        assert_eq!(reverse["general"]["timezone"], "UTC");
    }

    #[test]
    fn identical_files_are_deduplicated_keeping_first() {
        let mut doc = json!({"files": [
            {"path": "/etc/a", "mode": "0644", "contents": "x"},
            {"path": "/etc/b", "mode": "0644", "contents": "y"},
            {"path": "/etc/a", "mode": "0644", "contents": "x"},
            {"path": "/etc/a", "mode": "0600", "contents": "x"}
        ]});
        dedupe_files(&mut doc);
        let paths: Vec<_> = doc["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| (f["path"].as_str().unwrap(), f["mode"].as_str().unwrap()))
            .collect();
        assert_eq!(paths, vec![("/etc/a", "0644"), ("/etc/b", "0644"), ("/etc/a", "0600")]);
    }

    #[test]
    fn known_variables_are_substituted_unknown_left_as_written() {
        let resolver = crate::context::ContextResolver::new(
            [("ssid".to_string(), json!("office")), ("channel".to_string(), json!(6))]
                .into_iter()
                .collect(),
            crate::context::ContextFunctions::new(),
            false,
        );
        let context = resolver.template_context(&Default::default(), None);
        let mut doc = json!({"wifi": ["{{ ssid }}-{{channel}}", "{{ missing }}"], "n": 1});
        substitute(&mut doc, &context);
        assert_eq!(doc, json!({"wifi": ["office-6", "{{ missing }}"], "n": 1}));
    }

    #[test]
    fn hostname_defaults_to_sanitized_device_name() {
        let mut doc = json!({});
        default_hostname(&mut doc, "00:11:22:33:44:55");
        assert_eq!(doc["general"]["hostname"], "00-11-22-33-44-55");

        let mut doc = json!({"general": {"hostname": "custom"}});
        default_hostname(&mut doc, "router");
        assert_eq!(doc["general"]["hostname"], "custom");
    }
}
