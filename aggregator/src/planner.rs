//! Request classification, target-backend selection, and per-backend
//! request rewriting.

use crate::codec;
use crate::config::Backend;
use crate::pool::{JsonMap, MapPool};
use idcache::TranslationCache;
use serde_json::Value;
use std::collections::BTreeSet;

/// Routing decision for one inbound request.
#[derive(Clone, Debug)]
pub struct Plan {
    /// At least one `*ids` params field held a non-empty sequence.
    pub id_based: bool,
    /// Params keys ending in `ids` that participate in routing/rewriting.
    pub id_fields: Vec<String>,
    /// Backend IDs to fan out to. For broadcast requests this is the whole
    /// fleet; for ID-based requests it may be a subset — or empty, which the
    /// engine reports as a planning error.
    pub targets: Vec<u8>,
}

/// Reports whether the request narrows to specific backends and which
/// `*ids` fields drive that decision.
pub fn classify(request: &JsonMap) -> (bool, Vec<String>) {
    let mut id_based = false;
    let mut fields = Vec::new();

    if let Some(Value::Object(params)) = request.get("params") {
        for (key, value) in params {
            if !key.ends_with("ids") {
                continue;
            }
            match value {
                Value::Array(items) if !items.is_empty() => {
                    id_based = true;
                    fields.push(key.clone());
                }
                Value::Array(_) | Value::Null => {}
                Value::String(_) | Value::Number(_) => fields.push(key.clone()),
                other => {
                    tracing::warn!(key, value = %other, "Unexpected type for routing field");
                }
            }
        }
    }

    (id_based, fields)
}

/// Builds the full routing plan for a request against the configured fleet.
pub fn plan(request: &JsonMap, backends: &[Backend]) -> Plan {
    let (id_based, id_fields) = classify(request);
    let all: Vec<u8> = backends.iter().map(|b| b.id).collect();

    if !id_based {
        return Plan {
            id_based,
            id_fields,
            targets: all,
        };
    }

    let Some(Value::Object(params)) = request.get("params") else {
        return Plan {
            id_based: false,
            id_fields,
            targets: all,
        };
    };

    let mut wanted = BTreeSet::new();
    for field in &id_fields {
        let Some(value) = params.get(field) else {
            continue;
        };
        let items: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Array(items) => Box::new(items.iter()),
            scalar => Box::new(std::iter::once(scalar)),
        };
        for item in items {
            match codec::backend_of(item) {
                // A zero marker promotes the whole request to broadcast.
                0 => {
                    return Plan {
                        id_based,
                        id_fields,
                        targets: all,
                    };
                }
                digit => {
                    wanted.insert(digit);
                }
            }
        }
    }

    // Digits with no configured backend are not viable targets.
    let targets = all.into_iter().filter(|id| wanted.contains(id)).collect();
    Plan {
        id_based,
        id_fields,
        targets,
    }
}

/// Produces backend `b`'s copy of the request: a pooled deep clone with the
/// backend's token in `auth` and every routing field narrowed to IDs this
/// backend owns.
///
/// Returns `None` (and recycles the clone) when a filtered sequence becomes
/// empty or a scalar routing field addresses a different backend: this
/// backend drops out of the fan-out without an error.
pub fn rewrite_for_backend(
    pool: &MapPool,
    request: &JsonMap,
    backend: &Backend,
    plan: &Plan,
    cache: &TranslationCache,
) -> Option<JsonMap> {
    let mut cloned = pool.clone_request(request);
    cloned.insert("auth".to_string(), Value::String(backend.token.clone()));

    let viable = match cloned.get_mut("params") {
        Some(Value::Object(params)) if plan.id_based => {
            rewrite_params(params, backend, &plan.id_fields, cache)
        }
        _ => true,
    };

    if viable {
        Some(cloned)
    } else {
        pool.put(cloned);
        None
    }
}

fn rewrite_params(
    params: &mut JsonMap,
    backend: &Backend,
    id_fields: &[String],
    cache: &TranslationCache,
) -> bool {
    for field in id_fields {
        let Some(value) = params.get_mut(field) else {
            continue;
        };

        match value {
            Value::Array(items) => {
                let mut filtered = Vec::with_capacity(items.len());
                for item in items.iter() {
                    match codec::backend_of(item) {
                        digit if digit == backend.id => {
                            if let Some(original) = codec::decode_for_backend(item, backend.id) {
                                filtered.push(original);
                            }
                        }
                        0 => filtered.push(resolve_zero_marker(item, backend.id, field, cache)),
                        // IDs owned by other backends are dropped.
                        _ => {}
                    }
                }
                if filtered.is_empty() {
                    return false;
                }
                *items = filtered;
            }
            scalar => match codec::backend_of(scalar) {
                digit if digit == backend.id => {
                    if let Some(original) = codec::decode_for_backend(scalar, backend.id) {
                        *scalar = original;
                    }
                }
                0 => {
                    let resolved = resolve_zero_marker(scalar, backend.id, field, cache);
                    *scalar = resolved;
                }
                _ => return false,
            },
        }
    }
    true
}

/// A value with no backend digit is either a hash-derived proxy ID (resolved
/// per backend through the translation cache) or a plain broadcast marker
/// that every backend receives unchanged.
fn resolve_zero_marker(
    value: &Value,
    backend_id: u8,
    field: &str,
    cache: &TranslationCache,
) -> Value {
    let entity = entity_type_of(field);
    let Some(proxy_id) = codec::value_to_i64(value) else {
        return value.clone();
    };

    match cache.get_original_id(entity, proxy_id, backend_id) {
        Some(original) => {
            tracing::trace!(backend_id, proxy_id, original, entity, "Resolved proxy ID");
            match value {
                Value::String(_) => Value::String(original.to_string()),
                _ => Value::from(original),
            }
        }
        None => value.clone(),
    }
}

/// `hostids` → `host`, `groupids` → `group`.
pub fn entity_type_of(field: &str) -> &str {
    field
        .strip_suffix("ids")
        .or_else(|| field.strip_suffix("id"))
        .unwrap_or(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn backends() -> Vec<Backend> {
        [1u8, 2]
            .iter()
            .map(|id| Backend {
                id: *id,
                name: format!("zbx{id}"),
                url: format!("http://zbx{id}.example.com/api_jsonrpc.php"),
                token: format!("token-{id}"),
                ignore_tls: false,
            })
            .collect()
    }

    fn request(params: Value) -> JsonMap {
        json!({"jsonrpc": "2.0", "method": "host.get", "id": 1, "params": params})
            .as_object()
            .unwrap()
            .clone()
    }

    fn empty_cache() -> TranslationCache {
        TranslationCache::in_memory(HashMap::new())
    }

    #[test]
    fn requests_without_ids_broadcast() {
        let plan = plan(&request(json!({"filter": {"name": "web"}})), &backends());
        assert!(!plan.id_based);
        assert_eq!(plan.targets, vec![1, 2]);
    }

    #[test]
    fn empty_id_sequences_do_not_make_a_request_id_based() {
        let plan = plan(&request(json!({"hostids": []})), &backends());
        assert!(!plan.id_based);
        assert_eq!(plan.targets, vec![1, 2]);
    }

    #[test]
    fn id_based_requests_narrow_to_owning_backends() {
        let plan1 = plan(&request(json!({"hostids": ["10001", "20001"]})), &backends());
        assert!(plan1.id_based);
        assert_eq!(plan1.id_fields, vec!["hostids"]);
        assert_eq!(plan1.targets, vec![1, 2]);

        let plan2 = plan(&request(json!({"hostids": ["10002"]})), &backends());
        assert_eq!(plan2.targets, vec![2]);
    }

    #[test]
    fn zero_marker_promotes_to_broadcast() {
        // "1" parses below the radix, so it has no backend digit.
        let plan = plan(&request(json!({"hostids": ["1"]})), &backends());
        assert!(plan.id_based);
        assert_eq!(plan.targets, vec![1, 2]);
    }

    #[test]
    fn unconfigured_backend_digits_leave_no_viable_targets() {
        let plan = plan(&request(json!({"hostids": ["10007"]})), &backends());
        assert!(plan.id_based);
        assert!(plan.targets.is_empty());
    }

    #[test]
    fn rewrite_keeps_only_this_backends_ids_and_sets_auth() {
        let pool = MapPool::new();
        let cache = empty_cache();
        let src = request(json!({"hostids": ["10001", "20002", "30001"]}));
        let plan = plan(&src, &backends());

        let b1 = rewrite_for_backend(&pool, &src, &backends()[0], &plan, &cache).unwrap();
        assert_eq!(b1["auth"], json!("token-1"));
        assert_eq!(b1["params"]["hostids"], json!(["1000", "3000"]));

        let b2 = rewrite_for_backend(&pool, &src, &backends()[1], &plan, &cache).unwrap();
        assert_eq!(b2["auth"], json!("token-2"));
        assert_eq!(b2["params"]["hostids"], json!(["2000"]));

        // The source request is untouched by either rewrite.
        assert_eq!(src["params"]["hostids"], json!(["10001", "20002", "30001"]));
        assert!(src.get("auth").is_none());
    }

    #[test]
    fn numeric_ids_keep_their_representation() {
        let pool = MapPool::new();
        let cache = empty_cache();
        let src = request(json!({"itemids": [10001, 20001]}));
        let plan = plan(&src, &backends());

        let b1 = rewrite_for_backend(&pool, &src, &backends()[0], &plan, &cache).unwrap();
        assert_eq!(b1["params"]["itemids"], json!([1000, 2000]));
    }

    #[test]
    fn backend_with_no_matching_ids_is_abandoned() {
        let pool = MapPool::new();
        let cache = empty_cache();
        let src = request(json!({"hostids": ["10002"]}));
        let plan = plan(&src, &backends());

        assert!(rewrite_for_backend(&pool, &src, &backends()[0], &plan, &cache).is_none());
        assert!(rewrite_for_backend(&pool, &src, &backends()[1], &plan, &cache).is_some());
    }

    #[test]
    fn hash_derived_ids_resolve_through_the_cache() {
        let pool = MapPool::new();
        let cache = TranslationCache::in_memory(HashMap::from([(
            "group".to_string(),
            "name".to_string(),
        )]));
        cache.set("group", 89539170, 1, 1, "Linux");
        cache.set("group", 89539170, 7, 2, "Linux");

        let src = request(json!({"groupids": ["89539170"]}));
        let plan = plan(&src, &backends());
        assert_eq!(plan.targets, vec![1, 2]);

        let b1 = rewrite_for_backend(&pool, &src, &backends()[0], &plan, &cache).unwrap();
        assert_eq!(b1["params"]["groupids"], json!(["1"]));
        let b2 = rewrite_for_backend(&pool, &src, &backends()[1], &plan, &cache).unwrap();
        assert_eq!(b2["params"]["groupids"], json!(["7"]));
    }

    #[test]
    fn unresolvable_zero_markers_pass_through_unfiltered() {
        let pool = MapPool::new();
        let cache = empty_cache();
        let src = request(json!({"hostids": ["1"]}));
        let plan = plan(&src, &backends());

        for backend in &backends() {
            let rewritten = rewrite_for_backend(&pool, &src, backend, &plan, &cache).unwrap();
            assert_eq!(rewritten["params"]["hostids"], json!(["1"]));
        }
    }

    #[test]
    fn scalar_routing_field_skips_foreign_backends() {
        let pool = MapPool::new();
        let cache = empty_cache();
        // The sequence makes the request ID-based; the scalar field is
        // rewritten per backend alongside it.
        let src = request(json!({"hostids": ["10001", "10002"], "triggerids": "551"}));
        let plan = plan(&src, &backends());
        assert_eq!(plan.targets, vec![1, 2]);

        let b1 = rewrite_for_backend(&pool, &src, &backends()[0], &plan, &cache).unwrap();
        assert_eq!(b1["params"]["triggerids"], json!("55"));
        assert!(rewrite_for_backend(&pool, &src, &backends()[1], &plan, &cache).is_none());
    }

    #[test]
    fn entity_types_strip_id_suffixes() {
        assert_eq!(entity_type_of("hostids"), "host");
        assert_eq!(entity_type_of("groupids"), "group");
        assert_eq!(entity_type_of("hostid"), "host");
    }
}
