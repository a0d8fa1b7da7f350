//! Folding multi-valued headers into the gateway's single-valued map
//!
//! The proxy response format maps each header name to one string. Header
//! names are case-insensitive on the wire but not as map keys, so the n-th
//! value of a repeated header is stored under the n-th case variant of its
//! name (`set-cookie`, `set-cookiE`, `set-cookIe`, ...). This only exists
//! for the gateway format; everything before it uses a real `HeaderMap`.

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;

/// Distinct case variants of `name`, all-lowercase first, rightmost letter
/// flipping fastest.
pub fn case_variants(name: &str) -> impl Iterator<Item = String> {
    let lower: Vec<char> = name.to_lowercase().chars().collect();
    let letters: Vec<usize> = lower
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_alphabetic() && c.to_uppercase().ne(c.to_lowercase()))
        .map(|(i, _)| i)
        .collect();
    let count: u64 = 1u64.checked_shl(letters.len() as u32).unwrap_or(u64::MAX);

    (0..count).map(move |n| {
        let mut variant = lower.clone();
        for (bit, &position) in letters.iter().rev().enumerate() {
            if bit < 64 && n & (1 << bit) != 0 {
                variant[position] = variant[position].to_ascii_uppercase();
            }
        }
        variant.into_iter().collect()
    })
}

/// Flatten `headers` so every value survives in a single-valued map
pub fn fold_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut folded = BTreeMap::new();

    for name in headers.keys() {
        let mut variants = case_variants(name.as_str());
        let mut last_key: Option<String> = None;

        for value in headers.get_all(name) {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match variants.next() {
                Some(key) => {
                    folded.insert(key.clone(), value);
                    last_key = Some(key);
                }
                // Out of spellings: fall back to a comma-joined value.
                None => {
                    if let Some(existing) = last_key.as_ref().and_then(|k| folded.get_mut(k)) {
                        existing.push_str(", ");
                        existing.push_str(&value);
                    }
                }
            }
        }
    }

    folded
}
