//! Response rewriting: the reverse half of the ID translation.
//!
//! Walks a backend's `result` tree and rewrites every identifier into the
//! proxy namespace. Maps whose keys are all decimal digits are re-keyed;
//! fields ending in `id` are rewritten either with the simple radix-10
//! encoding or, for hash-cached entity types, with a name-derived proxy ID
//! recorded in the translation cache. Entity types on the dedup list
//! collapse to one instance per proxy ID within a single aggregation.

use crate::codec;
use crate::pool::JsonMap;
use idcache::TranslationCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Proxy IDs already emitted during one client request, per entity type.
/// Shared across the per-backend rewriters of a single aggregation.
pub type SeenIds = Arc<Mutex<HashMap<String, HashSet<i64>>>>;

pub fn new_seen_ids() -> SeenIds {
    Arc::new(Mutex::new(HashMap::new()))
}

pub struct ResponseRewriter {
    backend_id: u8,
    cache: Arc<TranslationCache>,
    dedup_types: Arc<Vec<String>>,
    seen: SeenIds,
}

impl ResponseRewriter {
    pub fn new(
        backend_id: u8,
        cache: Arc<TranslationCache>,
        dedup_types: Arc<Vec<String>>,
        seen: SeenIds,
    ) -> Self {
        ResponseRewriter {
            backend_id,
            cache,
            dedup_types,
            seen,
        }
    }

    /// Rewrites a backend `result` value into the proxy ID namespace.
    pub fn rewrite(&self, result: Value) -> Value {
        self.walk(result, 0).unwrap_or(Value::Null)
    }

    /// `None` means the value was dropped as a duplicate; that only happens
    /// for dedup-listed objects at nesting depth 1.
    fn walk(&self, value: Value, depth: usize) -> Option<Value> {
        match value {
            Value::Array(items) => Some(Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| self.walk(item, depth + 1))
                    .collect(),
            )),
            Value::Object(map) => self.walk_object(map, depth),
            scalar => Some(scalar),
        }
    }

    fn walk_object(&self, mut map: JsonMap, depth: usize) -> Option<Value> {
        rewrite_digit_keys(&mut map, self.backend_id);

        let id_keys: Vec<String> = map.keys().filter(|k| is_id_field(k)).cloned().collect();
        for key in id_keys {
            let entity = &key[..key.len() - 2];
            let current = map.get(&key).cloned().unwrap_or(Value::Null);

            let rewritten = if self.cache.is_cached_type(entity) {
                match self.cached_proxy_id(entity, &map, &current) {
                    Some((proxy_id, value)) => {
                        if depth == 1 && self.dedup_types.iter().any(|t| t == entity) {
                            if !self.first_sighting(entity, proxy_id) {
                                return None;
                            }
                        }
                        value
                    }
                    None => current,
                }
            } else {
                codec::encode(&current, self.backend_id)
            };
            map.insert(key, rewritten);
        }

        let mut out = JsonMap::with_capacity(map.len());
        for (key, value) in map {
            if !is_id_field(&key) && matches!(value, Value::Array(_) | Value::Object(_)) {
                if let Some(processed) = self.walk(value, depth + 1) {
                    out.insert(key, processed);
                }
            } else {
                out.insert(key, value);
            }
        }
        Some(Value::Object(out))
    }

    /// Hash-derived proxy ID for a cached entity, reusing the existing cache
    /// mapping when one exists. Returns the numeric ID and its
    /// representation-preserving JSON value.
    fn cached_proxy_id(
        &self,
        entity: &str,
        map: &JsonMap,
        original: &Value,
    ) -> Option<(i64, Value)> {
        let original_id = match codec::value_to_i64(original) {
            Some(n) => n,
            None => {
                tracing::error!(
                    backend_id = self.backend_id,
                    entity,
                    id = %original,
                    "ID transformation error"
                );
                return None;
            }
        };

        let proxy_id = match self.cache.get_proxy_id(entity, original_id, self.backend_id) {
            Some(proxy_id) => proxy_id,
            None => {
                let name_field = self.cache.name_field(entity)?;
                let Some(name) = map.get(&name_field).and_then(Value::as_str) else {
                    tracing::error!(
                        backend_id = self.backend_id,
                        entity,
                        name_field,
                        "Proxy ID generation failed, name field missing"
                    );
                    return None;
                };

                let proxy_id = codec::hash_proxy_id(name);
                self.cache
                    .set(entity, proxy_id, original_id, self.backend_id, name);
                tracing::trace!(
                    proxy_id,
                    entity,
                    name,
                    backend_id = self.backend_id,
                    original_id,
                    "Generated proxy ID"
                );
                proxy_id
            }
        };

        let value = match original {
            Value::String(_) => Value::String(proxy_id.to_string()),
            _ => Value::from(proxy_id),
        };
        Some((proxy_id, value))
    }

    /// Records a proxy ID; `false` when it was already emitted this request.
    fn first_sighting(&self, entity: &str, proxy_id: i64) -> bool {
        self.seen
            .lock()
            .entry(entity.to_string())
            .or_default()
            .insert(proxy_id)
    }
}

/// Ends in `id`, but is not the bare JSON-RPC `id` field.
fn is_id_field(key: &str) -> bool {
    key.ends_with("id") && key != "id"
}

/// Responses like `problem.get`'s keyed form use the entity ID as the map
/// key; those keys get the simple encoding.
fn rewrite_digit_keys(map: &mut JsonMap, backend_id: u8) {
    if map.is_empty() || !map.keys().all(|key| codec::is_digit_string(key)) {
        return;
    }

    let entries = std::mem::take(map);
    for (key, value) in entries {
        let new_key = match codec::encode(&Value::String(key.clone()), backend_id) {
            Value::String(encoded) => encoded,
            _ => key,
        };
        map.insert(new_key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn plain_cache() -> Arc<TranslationCache> {
        Arc::new(TranslationCache::in_memory(HashMap::new()))
    }

    fn group_cache() -> Arc<TranslationCache> {
        Arc::new(TranslationCache::in_memory(HashMap::from([(
            "group".to_string(),
            "name".to_string(),
        )])))
    }

    fn rewriter(
        backend_id: u8,
        cache: Arc<TranslationCache>,
        dedup: &[&str],
        seen: SeenIds,
    ) -> ResponseRewriter {
        ResponseRewriter::new(
            backend_id,
            cache,
            Arc::new(dedup.iter().map(|s| s.to_string()).collect()),
            seen,
        )
    }

    #[test]
    fn simple_id_fields_get_the_backend_digit() {
        let rewriter = rewriter(1, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!([
            {"hostid": "1000", "name": "h1"},
            {"hostid": 2000, "name": "h2"},
        ]));

        assert_eq!(
            result,
            json!([
                {"hostid": "10001", "name": "h1"},
                {"hostid": 20001, "name": "h2"},
            ])
        );
    }

    #[test]
    fn bare_id_field_is_not_rewritten() {
        let rewriter = rewriter(2, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!([{"id": "17", "itemid": "17"}]));
        assert_eq!(result, json!([{"id": "17", "itemid": "172"}]));
    }

    #[test]
    fn nested_id_fields_are_rewritten_too() {
        let rewriter = rewriter(3, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!([
            {"itemid": "42", "triggers": [{"triggerid": "7", "priority": "4"}]}
        ]));
        assert_eq!(
            result,
            json!([{"itemid": "423", "triggers": [{"triggerid": "73", "priority": "4"}]}])
        );
    }

    #[test]
    fn all_digit_map_keys_are_rewritten() {
        let rewriter = rewriter(1, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!({
            "100": {"eventid": "9"},
            "200": {"eventid": "8"},
        }));

        assert_eq!(
            result,
            json!({
                "1001": {"eventid": "91"},
                "2001": {"eventid": "81"},
            })
        );
    }

    #[test]
    fn mixed_keys_are_left_alone() {
        let rewriter = rewriter(1, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!({"100": 1, "name": 2}));
        assert_eq!(result, json!({"100": 1, "name": 2}));
    }

    #[test]
    fn hash_cached_types_use_name_derived_ids() {
        let cache = group_cache();
        let rewriter = rewriter(1, cache.clone(), &[], new_seen_ids());

        let result = rewriter.rewrite(json!([{"groupid": "1", "name": "Linux"}]));
        assert_eq!(result, json!([{"groupid": "89539170", "name": "Linux"}]));

        // The mapping is recorded for the request path.
        assert_eq!(cache.get_original_id("group", 89539170, 1), Some(1));
        assert_eq!(cache.get_proxy_id("group", 1, 1), Some(89539170));
    }

    #[test]
    fn existing_cache_mapping_wins_over_rehashing() {
        let cache = group_cache();
        cache.set("group", 555550, 1, 1, "Linux");
        let rewriter = rewriter(1, cache, &[], new_seen_ids());

        let result = rewriter.rewrite(json!([{"groupid": "1", "name": "Linux"}]));
        assert_eq!(result, json!([{"groupid": "555550", "name": "Linux"}]));
    }

    #[test]
    fn missing_name_field_keeps_the_original_id() {
        let rewriter = rewriter(1, group_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!([{"groupid": "1", "flags": "0"}]));
        assert_eq!(result, json!([{"groupid": "1", "flags": "0"}]));
    }

    #[test]
    fn duplicate_dedup_listed_entities_are_dropped() {
        let cache = group_cache();
        let seen = new_seen_ids();

        // Two backends return the same group name; both collapse to one
        // hash-derived ID and the second arrival is dropped.
        let first = rewriter(1, cache.clone(), &["group"], seen.clone());
        let second = rewriter(2, cache.clone(), &["group"], seen.clone());

        let r1 = first.rewrite(json!([{"groupid": "1", "name": "Linux"}]));
        let r2 = second.rewrite(json!([{"groupid": "7", "name": "Linux"}]));

        assert_eq!(r1, json!([{"groupid": "89539170", "name": "Linux"}]));
        assert_eq!(r2, json!([]));

        assert_eq!(cache.get_original_id("group", 89539170, 1), Some(1));
        assert_eq!(cache.get_original_id("group", 89539170, 2), Some(7));
    }

    #[test]
    fn dedup_only_applies_at_top_level() {
        let cache = group_cache();
        let seen = new_seen_ids();
        let rewriter = rewriter(1, cache, &["group"], seen);

        let result = rewriter.rewrite(json!([
            {"hostid": "10", "groups": [{"groupid": "1", "name": "Linux"}]},
            {"hostid": "20", "groups": [{"groupid": "1", "name": "Linux"}]},
        ]));

        // Nested groups are rewritten but never dropped.
        let items = result.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["groups"][0]["groupid"], json!("89539170"));
        assert_eq!(items[1]["groups"][0]["groupid"], json!("89539170"));
    }

    #[test]
    fn types_off_the_dedup_list_are_kept() {
        let cache = Arc::new(TranslationCache::in_memory(HashMap::from([(
            "host".to_string(),
            "name".to_string(),
        )])));
        let seen = new_seen_ids();

        let first = rewriter(1, cache.clone(), &[], seen.clone());
        let second = rewriter(2, cache, &[], seen);

        let r1 = first.rewrite(json!([{"hostid": "1", "name": "web"}]));
        let r2 = second.rewrite(json!([{"hostid": "4", "name": "web"}]));

        assert_eq!(r1.as_array().unwrap().len(), 1);
        assert_eq!(r2.as_array().unwrap().len(), 1);
        assert_eq!(r1[0]["hostid"], r2[0]["hostid"]);
    }

    #[test]
    fn scalar_array_elements_survive() {
        let rewriter = rewriter(1, plain_cache(), &[], new_seen_ids());
        let result = rewriter.rewrite(json!(["10", "20", "30"]));
        assert_eq!(result, json!(["10", "20", "30"]));
    }

    #[test]
    fn numeric_ids_keep_numeric_representation() {
        let cache = group_cache();
        let rewriter = rewriter(1, cache, &[], new_seen_ids());
        let result = rewriter.rewrite(json!([{"groupid": 1, "name": "Linux"}]));
        assert_eq!(result, json!([{"groupid": 89539170, "name": "Linux"}]));
    }
}
