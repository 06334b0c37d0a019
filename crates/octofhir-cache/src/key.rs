//! Deterministic cache key builders.
//!
//! Two key families exist and their formats are shared with external admin
//! tooling, so they must not change:
//!
//! - resumable per-query logs: `fhir:everything:<Type>:<k1>=<v1>&<k2>=<v2>`
//! - whole-bundle entries: `<Type>:<id>::Scopes:<s1>,<s2>::<Operation>`

use std::collections::BTreeSet;
use std::fmt;

/// Prefix of every resumable per-query log key.
pub const EVERYTHING_PREFIX: &str = "fhir:everything:";

/// A cache key. Equal logical queries under equal access context produce
/// equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a resumable per-query log.
    ///
    /// Parameters are sorted by name (then value); `_`-prefixed parameters
    /// are excluded. `%`, `&` and `=` inside names and values are
    /// percent-encoded, so one pair can never pass for several.
    pub fn everything<K, V>(resource_type: &str, params: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (escape_component(k), escape_component(v)))
            .collect();
        pairs.sort_unstable();
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        Self(format!("{EVERYTHING_PREFIX}{resource_type}:{query}"))
    }

    /// Key for a whole-bundle cache entry. Scopes are sorted and
    /// de-duplicated, so their input order does not matter.
    pub fn scoped<S: AsRef<str>>(
        resource_type: &str,
        id: &str,
        scopes: impl IntoIterator<Item = S>,
        operation: &str,
    ) -> Self {
        let scopes: BTreeSet<String> = scopes
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let scopes = scopes.into_iter().collect::<Vec<_>>().join(",");
        Self(format!("{resource_type}:{id}::Scopes:{scopes}::{operation}"))
    }

    /// Prefix shared by every whole-bundle key of one resource.
    pub fn scoped_prefix(resource_type: &str, id: &str) -> String {
        format!("{resource_type}:{id}::")
    }

    /// Prefix shared by every per-query log of one resource type.
    pub fn everything_prefix(resource_type: &str) -> String {
        format!("{EVERYTHING_PREFIX}{resource_type}:")
    }

    /// Returns `true` if this per-query log key carries `id=<id>` among its
    /// parameters, including comma-separated id lists.
    pub fn has_id_param(key: &str, id: &str) -> bool {
        let Some(rest) = key.strip_prefix(EVERYTHING_PREFIX) else {
            return false;
        };
        let Some((_, query)) = rest.split_once(':') else {
            return false;
        };
        let id = escape_component(id);
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(k, _)| *k == "id" || *k == "_id")
            .any(|(_, v)| v.split(',').any(|candidate| candidate == id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

/// Splits a space-separated scope string (`X-Fhir-Scopes`, OAuth `scope`).
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_key_is_order_independent() {
        let expected = "Patient:24a5930e-11b4-5525-b482-669174917044::Scopes:access/*.*,user/*.read,user/*.write::Summary";
        let orders = [
            ["user/*.read", "access/*.*", "user/*.write"],
            ["user/*.write", "user/*.read", "access/*.*"],
            ["access/*.*", "user/*.write", "user/*.read"],
        ];
        for scopes in orders {
            let key = CacheKey::scoped(
                "Patient",
                "24a5930e-11b4-5525-b482-669174917044",
                scopes,
                "Summary",
            );
            assert_eq!(key.as_str(), expected);
        }
    }

    #[test]
    fn test_scoped_key_dedups_scopes() {
        let key = CacheKey::scoped(
            "Patient",
            "1",
            parse_scopes("user/*.read  user/*.read access/*.*"),
            "Read",
        );
        assert_eq!(key.as_str(), "Patient:1::Scopes:access/*.*,user/*.read::Read");
    }

    #[test]
    fn test_everything_key_sorts_and_drops_internal_params() {
        let params = [
            ("type", "Observation"),
            ("_debug", "true"),
            ("id", "123"),
            ("_format", "ndjson"),
        ];
        let key = CacheKey::everything("Patient", &params);
        assert_eq!(key.as_str(), "fhir:everything:Patient:id=123&type=Observation");
        assert_eq!(
            CacheKey::everything("Patient", &[("type", "Observation"), ("id", "123")]),
            key
        );
    }

    #[test]
    fn test_everything_key_values_cannot_inject_pairs() {
        let forged = CacheKey::everything("Patient", &[("type", "Observation&scopes=access/*.*")]);
        let honest = CacheKey::everything(
            "Patient",
            &[("type", "Observation"), ("scopes", "access/*.*")],
        );
        assert_ne!(forged, honest);
        assert_eq!(
            forged.as_str(),
            "fhir:everything:Patient:type=Observation%26scopes%3Daccess/*.*"
        );

        let key = CacheKey::everything("Patient", &[("id", "a&b")]);
        assert!(CacheKey::has_id_param(key.as_str(), "a&b"));
    }

    #[test]
    fn test_everything_key_without_params() {
        let none: [(&str, &str); 0] = [];
        assert_eq!(
            CacheKey::everything("Patient", &none).as_str(),
            "fhir:everything:Patient:"
        );
    }

    #[test]
    fn test_has_id_param() {
        assert!(CacheKey::has_id_param("fhir:everything:Patient:id=1,2&x=y", "2"));
        assert!(!CacheKey::has_id_param("fhir:everything:Patient:id=12", "1"));
        assert!(!CacheKey::has_id_param("Patient:1::Scopes:::Read", "1"));
    }
}
