//! Permission store seam.
//!
//! Accounts and permission rows live outside the relay. The relay only reads
//! global defaults and single edges per request and writes them back through
//! the update calls; any caching is the store's business.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::permissions::{PermissionEdge, PermissionSet};

/// Errors that can arise while talking to the permission store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("permission store unavailable: {0}")]
    Unavailable(String),

    /// An edge was written with issuer equal to target.
    #[error("self-referencing permission edge for {0}")]
    SelfEdge(String),

    /// Returned when updating an edge that does not exist.
    #[error("permission edge not found: {issuer} -> {target}")]
    NotFound { issuer: String, target: String },
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Global defaults of `friend_code`, `None` if the account has none stored.
    async fn get_global_permissions(&self, friend_code: &str) -> Result<Option<PermissionSet>, StoreError>;

    /// The edge `issuer → target`, `None` when the issuer has not added the target.
    async fn get_single_permissions(
        &self,
        issuer: &str,
        target: &str,
    ) -> Result<Option<PermissionEdge>, StoreError>;

    /// Every edge issued by `friend_code`.
    async fn get_all_permissions(&self, friend_code: &str) -> Result<Vec<PermissionEdge>, StoreError>;

    async fn update_global_permissions(
        &self,
        friend_code: &str,
        permissions: PermissionSet,
    ) -> Result<(), StoreError>;

    /// Insert or replace the edge named by `edge.issuer` and `edge.target`.
    async fn update_single_permissions(&self, edge: PermissionEdge) -> Result<(), StoreError>;

    async fn remove_single_permissions(&self, issuer: &str, target: &str) -> Result<(), StoreError>;
}

/// Store kept entirely in memory. Used by tests, the smoke test, and
/// deployments that seed permissions at startup.
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    globals: DashMap<String, PermissionSet>,
    edges: DashMap<(String, String), PermissionEdge>,
}

impl InMemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn get_global_permissions(&self, friend_code: &str) -> Result<Option<PermissionSet>, StoreError> {
        Ok(self.globals.get(friend_code).map(|g| *g))
    }

    async fn get_single_permissions(
        &self,
        issuer: &str,
        target: &str,
    ) -> Result<Option<PermissionEdge>, StoreError> {
        Ok(self
            .edges
            .get(&(issuer.to_string(), target.to_string()))
            .map(|e| e.clone()))
    }

    async fn get_all_permissions(&self, friend_code: &str) -> Result<Vec<PermissionEdge>, StoreError> {
        let mut edges: Vec<PermissionEdge> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == friend_code)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(edges)
    }

    async fn update_global_permissions(
        &self,
        friend_code: &str,
        permissions: PermissionSet,
    ) -> Result<(), StoreError> {
        self.globals.insert(friend_code.to_string(), permissions);
        Ok(())
    }

    async fn update_single_permissions(&self, edge: PermissionEdge) -> Result<(), StoreError> {
        if edge.issuer == edge.target {
            return Err(StoreError::SelfEdge(edge.issuer));
        }
        self.edges
            .insert((edge.issuer.clone(), edge.target.clone()), edge);
        Ok(())
    }

    async fn remove_single_permissions(&self, issuer: &str, target: &str) -> Result<(), StoreError> {
        match self.edges.remove(&(issuer.to_string(), target.to_string())) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                issuer: issuer.to_string(),
                target: target.to_string(),
            }),
        }
    }
}
