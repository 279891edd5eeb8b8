//! Per-session document bookkeeping.
//!
//! Each session id maps to its own async mutex over the session's document
//! list. Ingestion holds that lock from the capacity check until the new
//! document is recorded, so two concurrent uploads to one session cannot
//! both slip under the limit. Different sessions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use docent_core::models::Document;
use docent_core::{Error, Result};

type SessionDocuments = Arc<tokio::sync::Mutex<Vec<Document>>>;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionDocuments>>,
    max_documents: usize,
}

impl SessionRegistry {
    pub fn new(max_documents: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_documents,
        }
    }

    pub fn max_documents(&self) -> usize {
        self.max_documents
    }

    fn handle(&self, session_id: &str) -> SessionDocuments {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    fn existing(&self, session_id: &str) -> Option<SessionDocuments> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).map(Arc::clone)
    }

    /// Locks a session's document list, creating the session if needed.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Vec<Document>> {
        self.handle(session_id).lock_owned().await
    }

    pub async fn documents(&self, session_id: &str) -> Vec<Document> {
        match self.existing(session_id) {
            Some(docs) => docs.lock().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn document(&self, session_id: &str, document_id: &str) -> Option<Document> {
        let docs = self.existing(session_id)?;
        let docs = docs.lock().await;
        docs.iter().find(|d| d.id == document_id).cloned()
    }

    pub async fn remove_document(&self, session_id: &str, document_id: &str) -> Result<Document> {
        let not_found = || Error::DocumentNotFound {
            session_id: session_id.to_string(),
            document_id: document_id.to_string(),
        };
        let docs = self.existing(session_id).ok_or_else(not_found)?;
        let mut docs = docs.lock().await;
        let position = docs
            .iter()
            .position(|d| d.id == document_id)
            .ok_or_else(not_found)?;
        Ok(docs.remove(position))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(session_id)
    }
}
