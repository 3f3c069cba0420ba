use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;

/// Keep the last row for each key, in first-seen order.
///
/// Postgres rejects an `INSERT .. ON CONFLICT DO UPDATE` that touches the same
/// key twice, so every batch goes through this first.
pub fn dedupe_last_by_key<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<Option<T>> = Vec::with_capacity(rows.len());
    for row in rows {
        let k = key(&row);
        match slots.get(&k) {
            Some(&idx) => out[idx] = Some(row),
            None => {
                slots.insert(k, out.len());
                out.push(Some(row));
            }
        }
    }
    out.into_iter().flatten().collect()
}

/// Postgres accepts at most this many bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// How many rows fit in one multi-row `INSERT` when each row binds `columns` values.
pub fn rows_per_insert(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Serialize a serde-backed enum into its string name.
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}
