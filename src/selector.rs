//! Maps a group name to the concrete (provider, model, credential) triple
//! with the lowest weighted usage.

use std::sync::Arc;

use crate::client::UpstreamClient;
use crate::registry::Registry;
use crate::{Result, RouterError};

/// A routing decision: where the request goes and under which credential.
#[derive(Debug)]
pub struct Route<'a> {
    pub provider: &'a str,
    /// Upstream model name to substitute into the outgoing request.
    pub model: &'a str,
    pub client: &'a Arc<UpstreamClient>,
}

/// Picks the (entry, credential) pair minimising
/// `usage(credential, model) * weight`, enumerating entries and credentials
/// in declared order so the earliest pair wins ties. Weight 0 collapses the
/// product to 0, making the entry a hard preference.
pub fn resolve_group<'a>(registry: &'a Registry, group_name: &str) -> Result<Route<'a>> {
    let group = registry
        .group(group_name)
        .ok_or_else(|| RouterError::UnknownGroup(group_name.to_string()))?;

    let mut best: Option<(i64, Route<'a>)> = None;
    for entry in &group.entries {
        let Some(provider) = registry.provider(&entry.provider) else {
            continue;
        };
        for client in &provider.clients {
            let effective = client
                .usage()
                .get(&entry.name)
                .saturating_mul(i64::from(entry.weight));
            let replace = match &best {
                Some((min, _)) => effective < *min,
                None => true,
            };
            if replace {
                best = Some((
                    effective,
                    Route {
                        provider: &provider.name,
                        model: &entry.name,
                        client,
                    },
                ));
            }
        }
    }

    best.map(|(_, route)| route)
        .ok_or_else(|| RouterError::UnknownGroup(group_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry(yaml: &str) -> Registry {
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        Registry::from_config(&config).expect("registry")
    }

    fn two_entry_registry() -> Registry {
        registry(
            r#"
api_key: secret
providers:
  - name: p
    base_url: http://localhost:9000/v1
    api_keys: [k]
groups:
  - name: g
    models:
      - { weight: 1, provider: p, name: m-a }
      - { weight: 2, provider: p, name: m-b }
"#,
        )
    }

    #[test]
    fn unknown_group_is_an_error() {
        let registry = two_entry_registry();
        let err = resolve_group(&registry, "nope").unwrap_err();
        assert!(matches!(err, RouterError::UnknownGroup(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn tie_resolves_to_earliest_entry() {
        // 100*1 vs 50*2: equal effective usage, declared order wins.
        let registry = two_entry_registry();
        let client = registry.client("p", "k").expect("client");
        client.usage().add("m-a", 100).expect("add");
        client.usage().add("m-b", 50).expect("add");

        let route = resolve_group(&registry, "g").expect("route");
        assert_eq!(route.model, "m-a");
        assert_eq!(route.provider, "p");
    }

    #[test]
    fn weight_multiplies_observed_usage() {
        let registry = registry(
            r#"
api_key: secret
providers:
  - name: p
    base_url: http://localhost:9000/v1
    api_keys: [k]
groups:
  - name: g
    models:
      - { weight: 2, provider: p, name: m-expensive }
      - { weight: 1, provider: p, name: m-cheap }
"#,
        );
        let client = registry.client("p", "k").expect("client");
        client.usage().add("m-expensive", 100).expect("add");
        client.usage().add("m-cheap", 150).expect("add");

        // 150 < 200: the cheap entry wins despite higher raw usage.
        assert_eq!(resolve_group(&registry, "g").expect("route").model, "m-cheap");

        client.usage().add("m-cheap", 51).expect("add");
        // 200 < 201: the expensive entry takes over.
        assert_eq!(
            resolve_group(&registry, "g").expect("route").model,
            "m-expensive"
        );
    }

    #[test]
    fn weight_zero_is_a_hard_preference() {
        let registry = registry(
            r#"
api_key: secret
providers:
  - name: p
    base_url: http://localhost:9000/v1
    api_keys: [k]
groups:
  - name: g
    models:
      - { weight: 1, provider: p, name: m-a }
      - { weight: 0, provider: p, name: m-free }
"#,
        );
        let client = registry.client("p", "k").expect("client");
        client.usage().add("m-free", 1_000_000).expect("add");

        // Weight 0 keeps the entry's effective usage pinned at 0.
        assert_eq!(resolve_group(&registry, "g").expect("route").model, "m-free");
    }

    #[test]
    fn credentials_alternate_under_equal_usage() {
        let registry = registry(
            r#"
api_key: secret
providers:
  - name: p
    base_url: http://localhost:9000/v1
    api_keys: [k1, k2]
groups:
  - name: g
    models:
      - { weight: 1, provider: p, name: m }
"#,
        );

        let route = resolve_group(&registry, "g").expect("route");
        assert_eq!(route.client.api_key(), "k1");
        route.client.usage().add("m", 100).expect("add");

        let route = resolve_group(&registry, "g").expect("route");
        assert_eq!(route.client.api_key(), "k2");
        route.client.usage().add("m", 100).expect("add");

        let route = resolve_group(&registry, "g").expect("route");
        assert_eq!(route.client.api_key(), "k1");
    }

    #[test]
    fn selection_minimises_over_entries_and_credentials() {
        let registry = registry(
            r#"
api_key: secret
providers:
  - name: p1
    base_url: http://localhost:9000/v1
    api_keys: [a, b]
  - name: p2
    base_url: http://localhost:9001/v1
    api_keys: [c]
groups:
  - name: g
    models:
      - { weight: 1, provider: p1, name: m1 }
      - { weight: 1, provider: p2, name: m2 }
"#,
        );
        registry
            .client("p1", "a")
            .expect("client")
            .usage()
            .add("m1", 30)
            .expect("add");
        registry
            .client("p1", "b")
            .expect("client")
            .usage()
            .add("m1", 20)
            .expect("add");
        registry
            .client("p2", "c")
            .expect("client")
            .usage()
            .add("m2", 25)
            .expect("add");

        let route = resolve_group(&registry, "g").expect("route");
        assert_eq!(route.provider, "p1");
        assert_eq!(route.client.api_key(), "b");
    }
}
