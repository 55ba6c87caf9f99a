//! Deep merge of per-provider snapshots into one effective configuration.
use std::collections::{BTreeMap, btree_map::Entry};

use crate::config::models::{Configuration, Configurations, ServiceRoute};

/// Merge every provider's latest snapshot, visiting providers in name order.
///
/// - services are unioned; an identical duplicate is kept once
/// - duplicates differing only in `servers` have their server lists unioned by address
/// - any other conflicting duplicate is dropped from the result and logged
/// - `global_middleware` is a de-duplicated union in encounter order
/// - the first `balance_mode` and `database` seen win
pub fn merge_configurations(configurations: &Configurations) -> Configuration {
    let mut merged = Configuration::default();
    let mut services: BTreeMap<String, ServiceRoute> = BTreeMap::new();
    let mut conflicting: BTreeMap<String, Vec<&str>> = BTreeMap::new();

    for (provider, config) in configurations {
        if merged.balance_mode.is_none() {
            merged.balance_mode = config.balance_mode.clone();
        }
        if merged.database.is_none() {
            merged.database = config.database.clone();
        }
        for name in &config.global_middleware {
            if !merged.global_middleware.contains(name) {
                merged.global_middleware.push(name.clone());
            }
        }

        for (name, service) in &config.services {
            if let Some(providers) = conflicting.get_mut(name) {
                providers.push(provider);
                continue;
            }
            match services.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(service.clone());
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing == service {
                        continue;
                    }
                    if existing.same_shape(service) {
                        for server in &service.servers {
                            let address = server.address();
                            if !existing.servers.iter().any(|s| s.address() == address) {
                                existing.servers.push(server.clone());
                            }
                        }
                    } else {
                        slot.remove();
                        conflicting.insert(name.clone(), vec![provider]);
                    }
                }
            }
        }
    }

    for (service, providers) in &conflicting {
        tracing::error!(
            service = %service,
            providers = ?providers,
            "Service defined with conflicting routes by several providers, dropping it"
        );
    }

    merged.services = services;
    merged
}
