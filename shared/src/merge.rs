use serde_json::Value;

/// Folds `patch` into `target`: objects merge key by key and recursively,
/// anything else (scalars, arrays, null) in `patch` replaces what was there.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                let nested = value.is_object() && target.get(&key).map_or(false, Value::is_object);
                if nested {
                    if let Some(existing) = target.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    target.insert(key, value);
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
