//! The immutable, process-lifetime catalogue of providers, credentials, and
//! groups, built once from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::client::UpstreamClient;
use crate::config::Config;

/// One element of a group's expansion.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub provider: String,
    /// Upstream model name sent to the provider.
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub entries: Vec<ModelEntry>,
}

pub struct Provider {
    pub name: String,
    pub base_url: String,
    /// One client per API key, in declared order. The selector's tie-break
    /// relies on this order.
    pub clients: Vec<Arc<UpstreamClient>>,
}

pub struct Registry {
    groups: Vec<Group>,
    group_index: HashMap<String, usize>,
    providers: HashMap<String, Provider>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::new();

        let mut providers = HashMap::new();
        for provider in &config.providers {
            let clients = provider
                .api_keys
                .iter()
                .map(|key| Arc::new(UpstreamClient::new(http.clone(), &provider.base_url, key)))
                .collect();
            providers.insert(
                provider.name.clone(),
                Provider {
                    name: provider.name.clone(),
                    base_url: provider.base_url.clone(),
                    clients,
                },
            );
        }

        let mut groups = Vec::with_capacity(config.groups.len());
        let mut group_index = HashMap::new();
        for group in &config.groups {
            let entries = group
                .models
                .iter()
                .map(|entry| ModelEntry {
                    provider: entry.provider.clone(),
                    name: entry.name.clone(),
                    weight: entry.weight,
                })
                .collect();
            group_index.insert(group.name.clone(), groups.len());
            groups.push(Group {
                name: group.name.clone(),
                entries,
            });
        }

        Ok(Self {
            groups,
            group_index,
            providers,
        })
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.group_index.get(name).map(|idx| &self.groups[*idx])
    }

    /// Groups in declared order, for the models listing.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    /// The client for one (provider, key) pair; test seams reach the ledger
    /// through this.
    pub fn client(&self, provider: &str, api_key: &str) -> Option<&Arc<UpstreamClient>> {
        self.providers
            .get(provider)?
            .clients
            .iter()
            .find(|client| client.api_key() == api_key)
    }
}
