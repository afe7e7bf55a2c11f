//! Path prefix to service id mapping used for egress routing

use super::ResolveError;
use crate::config::PrefixMapping;
use std::collections::HashMap;

/// Longest-prefix lookup from request path to service id
#[derive(Debug, Clone, Default)]
pub struct PathPrefixServiceMap {
    /// Sorted longest prefix first
    entries: Vec<(String, String)>,
}

impl PathPrefixServiceMap {
    pub fn new(mapping: HashMap<String, String>) -> Self {
        let mut entries: Vec<(String, String)> = mapping
            .into_iter()
            .filter(|(prefix, _)| !prefix.is_empty())
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    /// Accepts a map, a JSON object string, or `prefix=serviceId&...`
    pub fn from_mapping(mapping: &PrefixMapping) -> Result<Self, ResolveError> {
        match mapping {
            PrefixMapping::Map(map) => Ok(Self::new(map.clone())),
            PrefixMapping::Text(text) => Self::parse(text),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ResolveError> {
        let text = text.trim();
        if text.starts_with('{') {
            let map: HashMap<String, String> = serde_json::from_str(text)
                .map_err(|e| ResolveError::InvalidMapping(e.to_string()))?;
            return Ok(Self::new(map));
        }

        let map = text
            .split('&')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((prefix, service)) => (prefix.trim().to_string(), service.trim().to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Ok(Self::new(map))
    }

    /// Service id for the longest configured prefix of `path`
    pub fn service_for(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, service)| service.as_str())
            .filter(|service| !service.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_form() {
        let map = PathPrefixServiceMap::parse(
            " /v1/pets = petstore & /v1 = gateway&/v1/orders=orders ",
        )
        .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.service_for("/v1/pets/12"), Some("petstore"));
        assert_eq!(map.service_for("/v1/orders"), Some("orders"));
        assert_eq!(map.service_for("/v1/users"), Some("gateway"));
        assert_eq!(map.service_for("/v2/pets"), None);
    }

    #[test]
    fn test_json_form() {
        let map = PathPrefixServiceMap::parse(r#"{"/v1/pets": "petstore"}"#).unwrap();
        assert_eq!(map.service_for("/v1/pets"), Some("petstore"));

        assert!(PathPrefixServiceMap::parse("{not json").is_err());
    }

    #[test]
    fn test_from_yaml_map() {
        let mut raw = HashMap::new();
        raw.insert("/v1/pets".to_string(), "petstore".to_string());
        let map = PathPrefixServiceMap::from_mapping(&PrefixMapping::Map(raw)).unwrap();
        assert_eq!(map.service_for("/v1/pets/1"), Some("petstore"));
    }

    #[test]
    fn test_missing_service_id() {
        let map = PathPrefixServiceMap::parse("/v1/pets").unwrap();
        assert_eq!(map.service_for("/v1/pets"), None);
    }
}
