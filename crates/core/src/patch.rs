//! JSON merge patches (RFC 7386).

use serde_json::Value as Json;

/// Apply `patch` onto `target` in place. `null` in the patch removes the key; non-object
/// patch values replace wholesale.
pub fn merge(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                let slot = target_map.entry(k.clone()).or_insert(Json::Null);
                merge(slot, v);
            }
        }
    }
}

/// Split a patch into the part that may be shown before the server confirms it
/// (`metadata.labels`, `metadata.annotations`) and the remainder. Either side is `None`
/// when empty.
pub fn split_display_safe(patch: &Json) -> (Option<Json>, Option<Json>) {
    let Json::Object(root) = patch else {
        return (None, Some(patch.clone()));
    };
    let mut safe_meta = serde_json::Map::new();
    let mut rest = root.clone();
    if let Some(Json::Object(meta)) = rest.get_mut("metadata") {
        for key in ["labels", "annotations"] {
            if let Some(v) = meta.remove(key) {
                safe_meta.insert(key.to_string(), v);
            }
        }
        if meta.is_empty() {
            rest.remove("metadata");
        }
    }
    let safe = if safe_meta.is_empty() {
        None
    } else {
        let mut m = serde_json::Map::new();
        m.insert("metadata".into(), Json::Object(safe_meta));
        Some(Json::Object(m))
    };
    let rest = if rest.is_empty() { None } else { Some(Json::Object(rest)) };
    (safe, rest)
}

/// Compute the merge patch turning `from` into `to`.
pub fn diff(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(a), Json::Object(b)) => {
            let mut out = serde_json::Map::new();
            for (k, va) in a {
                match b.get(k) {
                    None => {
                        out.insert(k.clone(), Json::Null);
                    }
                    Some(vb) if va != vb => {
                        out.insert(k.clone(), diff(va, vb));
                    }
                    _ => {}
                }
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    out.insert(k.clone(), vb.clone());
                }
            }
            Json::Object(out)
        }
        _ => to.clone(),
    }
}
