// Copyright 2024 Event Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Destination resolution: mapping an observed event to the ordered set of
//! chains its relay jobs go to.
//!
//! Three strategies exist: a static destination list, a destination read
//! from an event parameter (optionally through a lookup table), and custom
//! functions registered at startup. Resolver references are validated
//! before any service starts.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EventMappingConfig, ResolverSpec};
use crate::error::{Error, Result};
use crate::types::EventData;

/// A custom resolver function: `(mapping_name, event, source_chain)` to an
/// ordered list of destination chain names.
pub type CustomResolverFn =
    Arc<dyn Fn(&str, &EventData, &str) -> Result<Vec<String>> + Send + Sync>;

/// Custom resolver functions, registered by id at startup.
///
/// No dynamic code loading; the registry is populated in `main` before the
/// services are wired.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    functions: HashMap<String, CustomResolverFn>,
}

impl ResolverRegistry {
    /// Registers a function under the given id, replacing any previous one.
    pub fn register<F>(&mut self, id: impl Into<String>, function: F)
    where
        F: Fn(&str, &EventData, &str) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.functions.insert(id.into(), Arc::new(function));
    }

    fn get(&self, id: &str) -> Option<&CustomResolverFn> {
        self.functions.get(id)
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("functions", &self.functions.keys())
            .finish()
    }
}

/// Resolves events to destination chains, shared by all listeners.
#[derive(Debug)]
pub struct DestinationResolver {
    specs: HashMap<String, ResolverSpec>,
    registry: ResolverRegistry,
}

impl DestinationResolver {
    /// Builds the resolver, checking every mapping's resolver reference and
    /// every custom spec's function id. Problems are aggregated into a
    /// single startup error.
    pub fn new(
        specs: HashMap<String, ResolverSpec>,
        registry: ResolverRegistry,
        mappings: &[EventMappingConfig],
    ) -> Result<Self> {
        let mut problems = Vec::new();
        for mapping in mappings {
            if !specs.contains_key(&mapping.destination_resolver) {
                problems.push(format!(
                    "mapping {} references unknown resolver {}",
                    mapping.name, mapping.destination_resolver
                ));
            }
        }
        for (name, spec) in &specs {
            if let ResolverSpec::Custom { function_id } = spec {
                if registry.get(function_id).is_none() {
                    problems.push(format!(
                        "resolver {name} references unregistered custom function {function_id}"
                    ));
                }
            }
        }
        if !problems.is_empty() {
            return Err(Error::InvalidConfig(problems.join("; ")));
        }
        Ok(Self { specs, registry })
    }

    /// Maps an event to its destination chains.
    ///
    /// An empty result means no job is created; the caller logs a warning.
    /// A missing event parameter or lookup entry is a
    /// [`Error::Resolver`] and skips the event.
    pub fn resolve(
        &self,
        mapping_name: &str,
        resolver_name: &str,
        event: &EventData,
        source_chain: &str,
    ) -> Result<Vec<String>> {
        let spec = self.specs.get(resolver_name).ok_or_else(|| {
            Error::Resolver(format!("unknown resolver {resolver_name}"))
        })?;
        match spec {
            ResolverSpec::Static { destinations } => Ok(destinations
                .iter()
                .filter(|dest| dest.as_str() != source_chain)
                .cloned()
                .collect()),
            ResolverSpec::EventParameter {
                parameter_name,
                mapping,
            } => {
                let value = event.args.get(parameter_name).ok_or_else(|| {
                    Error::Resolver(format!(
                        "event {} carries no parameter {parameter_name}",
                        event.name
                    ))
                })?;
                let key = value.as_lookup_string();
                match mapping {
                    Some(table) => match table.get(&key) {
                        Some(chain) => Ok(vec![chain.clone()]),
                        None => Err(Error::Resolver(format!(
                            "no destination mapping entry for value {key}"
                        ))),
                    },
                    None => Ok(vec![key]),
                }
            }
            ResolverSpec::Custom { function_id } => {
                let function = self.registry.get(function_id).ok_or_else(|| {
                    Error::Resolver(format!("unregistered custom resolver {function_id}"))
                })?;
                function(mapping_name, event, source_chain)
            }
        }
    }
}
