//! Environment handling for config documents: `${VAR}` substitution,
//! environment overlays and deep merging.

use serde_yaml::Value;

use super::ConfigError;

/// Merge `overlay` into `base`. Mappings merge key by key; any other value
/// in the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Remove the `environments` section and merge the selected one into the document
pub fn apply_environment(doc: &mut Value, name: Option<&str>) -> Result<(), ConfigError> {
    let environments = match doc.as_mapping_mut() {
        Some(mapping) => mapping.remove("environments"),
        None => None,
    };

    let Some(name) = name else { return Ok(()) };
    let overlay = environments
        .as_ref()
        .and_then(|envs| envs.get(name))
        .cloned()
        .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?;

    deep_merge(doc, overlay);
    Ok(())
}

/// Expand `${VAR}` and `${VAR:default}` in every string value.
///
/// A string that is exactly one reference is re-read as a YAML scalar, so
/// `max: ${POOL_MAX:4}` yields a number.
pub fn substitute(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return Ok(());
            }
            let whole = is_single_reference(s);
            let expanded = expand(s, lookup)?;
            *value = if whole { retype(expanded) } else { Value::String(expanded) };
        }
        Value::Sequence(items) => {
            for item in items {
                substitute(item, lookup)?;
            }
        }
        Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                substitute(item, lookup)?;
            }
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, lookup)?,
        _ => {}
    }
    Ok(())
}

/// Expand all references in one string; an unterminated `${` is kept verbatim
pub fn expand(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let reference = &after[..end];
        let (name, default) = match reference.split_once(':') {
            Some((name, default)) => (name.trim(), Some(default)),
            None => (reference.trim(), None),
        };
        match lookup(name) {
            Some(v) => out.push_str(&v),
            None => match default {
                Some(d) => out.push_str(d),
                None => return Err(ConfigError::MissingVar(name.to_string())),
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn is_single_reference(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s[2..].find('}') == Some(s.len() - 3)
}

/// Numbers and booleans become typed; everything else stays a string
fn retype(expanded: String) -> Value {
    match serde_yaml::from_str::<Value>(&expanded) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(expanded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(name: &str) -> Option<String> {
        match name {
            "HOST" => Some("db.internal".to_string()),
            "PORT" => Some("5433".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand() {
        assert_eq!(expand("${HOST}:${PORT}", &vars).unwrap(), "db.internal:5433");
        assert_eq!(expand("${USER_NAME:etl}", &vars).unwrap(), "etl");
        assert_eq!(expand("url=${MISSING:http://x:1}", &vars).unwrap(), "url=http://x:1");
        assert_eq!(expand("cost ${ unterminated", &vars).unwrap(), "cost ${ unterminated");
        assert!(matches!(expand("${NOPE}", &vars), Err(ConfigError::MissingVar(v)) if v == "NOPE"));
    }

    #[test]
    fn test_substitute_retypes_whole_references() {
        let mut doc: Value = serde_yaml::from_str("port: ${PORT}\nurl: 'pg://${HOST}:${PORT}'\nflag: ${FLAG:true}").unwrap();
        substitute(&mut doc, &vars).unwrap();

        assert_eq!(doc["port"], Value::from(5433));
        assert_eq!(doc["url"], Value::from("pg://db.internal:5433"));
        assert_eq!(doc["flag"], Value::Bool(true));
    }

    #[test]
    fn test_deep_merge() {
        let mut base: Value = serde_yaml::from_str("a: {x: 1, y: 2}\nlist: [1, 2]").unwrap();
        let overlay: Value = serde_yaml::from_str("a: {y: 3, z: 4}\nlist: [9]").unwrap();
        deep_merge(&mut base, overlay);

        assert_eq!(base["a"]["x"], Value::from(1));
        assert_eq!(base["a"]["y"], Value::from(3));
        assert_eq!(base["a"]["z"], Value::from(4));
        assert_eq!(base["list"], serde_yaml::from_str::<Value>("[9]").unwrap());
    }
}
