// Connection graph service: directed request/accept/decline state machine
// over the connections collection. Edges are directed while pending and
// logically undirected once accepted.

use std::sync::Arc;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{Connection, ConnectionStatus, PendingRequest};
use crate::store::MeetStore;

#[derive(Clone)]
pub struct ConnectionService {
    store: Arc<MeetStore>,
}

impl ConnectionService {
    pub fn new(store: Arc<MeetStore>) -> Self {
        Self { store }
    }

    /// Create a pending edge from sender to receiver. Any existing record
    /// for this exact ordered pair, regardless of status, is a conflict;
    /// the store's pending-pair index additionally closes the window
    /// between this check and the insert.
    pub async fn send_request(&self, sender_id: &str, receiver_id: &str) -> AppResult<String> {
        if sender_id.trim().is_empty() || receiver_id.trim().is_empty() {
            return Err(AppError::Validation(
                "senderId and receiverId are required".to_string(),
            ));
        }
        if sender_id == receiver_id {
            return Err(AppError::Validation(
                "Cannot send a connection request to yourself".to_string(),
            ));
        }

        if self
            .store
            .find_connection_ordered(sender_id, receiver_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(
                "A connection request already exists between these users".to_string(),
            ));
        }

        let connection = self.store.insert_connection(sender_id, receiver_id).await?;
        debug!(
            connection_id = %connection.id,
            sender = %sender_id,
            receiver = %receiver_id,
            "Connection request created"
        );
        Ok(connection.id)
    }

    /// Resolve a pending request. `pending -> accepted` and
    /// `pending -> declined` are the only legal transitions; anything else
    /// is a conflict.
    pub async fn respond(&self, connection_id: &str, decision: ConnectionStatus) -> AppResult<()> {
        if decision == ConnectionStatus::Pending {
            return Err(AppError::Validation(
                "Decision must be accepted or declined".to_string(),
            ));
        }

        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Connection {} not found", connection_id))
            })?;

        // The store updates only rows still pending, so a concurrent
        // responder loses cleanly instead of overwriting a terminal state.
        let updated = self
            .store
            .update_connection_status(&connection, decision)
            .await?;
        if !updated {
            return Err(AppError::Conflict(format!(
                "Connection {} is not pending",
                connection_id
            )));
        }

        Ok(())
    }

    pub async fn get(&self, connection_id: &str) -> AppResult<Connection> {
        self.store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", connection_id)))
    }

    /// Accepted edges touching the user, as sender or receiver.
    pub async fn list_accepted(&self, user_id: &str) -> AppResult<Vec<Connection>> {
        let mut edges = self
            .store
            .list_connections_by_sender(user_id, ConnectionStatus::Accepted)
            .await?;
        edges.extend(
            self.store
                .list_connections_by_receiver(user_id, ConnectionStatus::Accepted)
                .await?,
        );
        Ok(edges)
    }

    /// Counterparty ids of accepted edges.
    pub async fn accepted_peer_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .list_accepted(user_id)
            .await?
            .iter()
            .map(|c| c.peer_of(user_id).to_string())
            .collect())
    }

    /// Incoming pending requests with the sender's profile attached.
    /// An N+1 resolve is acceptable at this scale and rides the store's
    /// profile cache; a missing profile degrades to the raw sender id.
    pub async fn list_incoming_pending(&self, user_id: &str) -> AppResult<Vec<PendingRequest>> {
        let pending = self
            .store
            .list_connections_by_receiver(user_id, ConnectionStatus::Pending)
            .await?;

        let mut requests = Vec::with_capacity(pending.len());
        for connection in pending {
            let sender = self.store.get_user(&connection.sender_id).await?;
            let sender_name = sender
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| connection.sender_id.clone());
            requests.push(PendingRequest {
                id: connection.id,
                sender_id: connection.sender_id,
                sender_name,
                sender,
            });
        }

        Ok(requests)
    }
}
