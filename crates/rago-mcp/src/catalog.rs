//! Merged tool catalog across servers

use rago_core::ToolDescriptor;
use std::collections::HashMap;

use crate::protocol::RemoteTool;

/// One server's contribution to the catalog
pub(crate) struct ServerTools<'a> {
    pub server: &'a str,
    pub running: bool,
    pub tools: &'a [RemoteTool],
}

/// Immutable snapshot, swapped whole whenever a server's state or tool list changes
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    entries: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Servers are visited in configuration order. The first server to
    /// publish a tool name keeps the bare name; later ones are published as
    /// `server.tool`. The qualified form always resolves.
    pub fn build<'a, I>(servers: I) -> Self
    where
        I: IntoIterator<Item = ServerTools<'a>>,
    {
        let mut catalog = Catalog::default();
        for group in servers {
            for tool in group.tools {
                let qualified = format!("{}.{}", group.server, tool.name);
                let published = if catalog.index.contains_key(&tool.name) {
                    qualified.clone()
                } else {
                    tool.name.clone()
                };
                if catalog.index.contains_key(&published) {
                    continue;
                }

                let position = catalog.entries.len();
                catalog.entries.push(ToolDescriptor {
                    name: published.clone(),
                    remote_name: tool.name.clone(),
                    server_name: group.server.to_string(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    enabled: group.running,
                });
                catalog.index.insert(published, position);
                catalog.index.entry(qualified).or_insert(position);
            }
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.entries
    }

    pub fn count_for(&self, server: &str) -> usize {
        self.entries
            .iter()
            .filter(|t| t.server_name == server)
            .count()
    }
}
