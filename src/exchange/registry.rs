//! Name → connector lookup used by the coordinator and the engine.

use crate::exchange::connector::ExchangeConnector;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ExchangeRegistry {
    connectors: BTreeMap<String, Arc<ExchangeConnector>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connector: Arc<ExchangeConnector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExchangeConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ExchangeConnector>> {
        self.connectors.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
